//! Unix time helpers.
//!
//! Every expiry in this crate (nonce packages, tokens, RSA keys) is a Unix
//! timestamp in seconds. Operations that check an expiry take `now` as a
//! parameter in their `_at` variants so tests can move the clock.

/// Seconds in one hour
pub const SECS_PER_HOUR: i64 = 3600;

/// Returns the current Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Returns the timestamp `ttl_secs` from now, saturating on overflow.
pub fn expires_in(ttl_secs: u64) -> i64 {
    let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
    now_timestamp().saturating_add(ttl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expires_in_window() {
        let before = now_timestamp();
        let expiry = expires_in(SECS_PER_HOUR as u64);
        let after = now_timestamp();
        assert!(expiry >= before + SECS_PER_HOUR);
        assert!(expiry <= after + SECS_PER_HOUR);
        assert!(expires_in(0) >= before);
    }

    #[test]
    fn test_expires_in_saturates() {
        assert_eq!(expires_in(u64::MAX), i64::MAX);
        assert_eq!(expires_in(i64::MAX as u64 + 1), i64::MAX);
        assert_eq!(expires_in(i64::MAX as u64), i64::MAX);
    }
}
