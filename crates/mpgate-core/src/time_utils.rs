use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, saturating instead of panicking on clock skew.
pub fn current_unix_timestamp_ms() -> u64 {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

pub fn deadline_unix_ms(now_unix_ms: u64, ttl_ms: u64) -> u64 {
    now_unix_ms.saturating_add(ttl_ms)
}

/// A deadline equal to `now` counts as expired.
pub fn is_expired_unix_ms(expires_unix_ms: u64, now_unix_ms: u64) -> bool {
    expires_unix_ms <= now_unix_ms
}
