//! Fixed-window request limiter keyed by remote address.
//!
//! Process-local only. Buckets are pruned lazily once the table grows past
//! [`RATE_LIMIT_PRUNE_THRESHOLD`] entries.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use mpgate_core::current_unix_timestamp_ms;

pub const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_RATE_LIMIT_MAX_REQUESTS: usize = 30;
pub const RATE_LIMIT_PRUNE_THRESHOLD: usize = 1_024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: usize },
    Limited { retry_after_secs: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug, Clone, Default)]
struct RateLimitBucket {
    window_started_unix_ms: u64,
    accepted_requests: usize,
    rejected_requests: usize,
}

#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    window_ms: u64,
    max_requests: usize,
    buckets: Mutex<HashMap<String, RateLimitBucket>>,
}

impl Default for FixedWindowRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_LIMIT_WINDOW_MS, DEFAULT_RATE_LIMIT_MAX_REQUESTS)
    }
}

impl FixedWindowRateLimiter {
    pub fn new(window_ms: u64, max_requests: usize) -> Self {
        Self {
            window_ms: window_ms.max(1),
            max_requests: max_requests.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn check(&self, key: &str) -> RateLimitDecision {
        self.check_at(key, current_unix_timestamp_ms())
    }

    pub fn check_at(&self, key: &str, now_unix_ms: u64) -> RateLimitDecision {
        let window_ms = self.window_ms;
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if buckets.len() > RATE_LIMIT_PRUNE_THRESHOLD {
            buckets.retain(|_, bucket| {
                now_unix_ms.saturating_sub(bucket.window_started_unix_ms) < window_ms
            });
        }

        let bucket = buckets.entry(key.to_string()).or_default();
        if bucket.accepted_requests == 0
            || now_unix_ms.saturating_sub(bucket.window_started_unix_ms) >= window_ms
        {
            bucket.window_started_unix_ms = now_unix_ms;
            bucket.accepted_requests = 0;
            bucket.rejected_requests = 0;
        }
        if bucket.accepted_requests >= self.max_requests {
            bucket.rejected_requests = bucket.rejected_requests.saturating_add(1);
            let reset_at = bucket.window_started_unix_ms.saturating_add(window_ms);
            let remaining_ms = reset_at.saturating_sub(now_unix_ms);
            return RateLimitDecision::Limited {
                retry_after_secs: remaining_ms.div_ceil(1_000).max(1),
            };
        }
        bucket.accepted_requests += 1;
        RateLimitDecision::Allowed {
            remaining: self.max_requests - bucket.accepted_requests,
        }
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
