//! Wall-clock helpers
//!
//! Expiry and trade timestamps are Unix milliseconds so they encode
//! identically on every node.

use chrono::Utc;

/// Current Unix time in milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current time plus a TTL, saturating
pub fn expiry_from_now(ttl_ms: u64) -> i64 {
    now_millis().saturating_add(ttl_ms.min(i64::MAX as u64) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_is_in_future() {
        let now = now_millis();
        assert!(expiry_from_now(1_000) >= now + 1_000);
        assert_eq!(expiry_from_now(u64::MAX), i64::MAX);
    }
}
