use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use mpgate_core::current_unix_timestamp_ms;

pub const DEFAULT_DEDUP_WINDOW_MS: u64 = 30_000;
const DEDUP_PURGE_THRESHOLD: usize = 1_024;

/// Time-bounded set of delivery keys. A key observed again inside the window is a duplicate.
#[derive(Debug)]
pub struct MessageDeduplicator {
    window_ms: u64,
    expires_at: Mutex<HashMap<String, u64>>,
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW_MS)
    }
}

impl MessageDeduplicator {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms: window_ms.max(1),
            expires_at: Mutex::new(HashMap::new()),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Returns `true` on first sight of `key`.
    pub fn observe(&self, key: &str) -> bool {
        self.observe_at(key, current_unix_timestamp_ms())
    }

    pub fn observe_at(&self, key: &str, now_ms: u64) -> bool {
        let mut entries = self
            .expires_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if entries.len() > DEDUP_PURGE_THRESHOLD {
            entries.retain(|_, expires_at| *expires_at > now_ms);
        }
        if let Some(expires_at) = entries.get(key) {
            if *expires_at > now_ms {
                return false;
            }
        }
        entries.insert(key.to_string(), now_ms.saturating_add(self.window_ms));
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.expires_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
