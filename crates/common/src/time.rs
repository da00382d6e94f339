//! Wall-clock helpers. All persisted timestamps are epoch milliseconds.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Whether `since_ms` lies more than `minutes` in the past relative to `now`.
pub fn older_than_minutes(since_ms: u64, minutes: u64, now: u64) -> bool {
    now.saturating_sub(since_ms) > minutes.saturating_mul(60_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn older_than_minutes_is_strict() {
        let now = 10 * 60_000;
        assert!(!older_than_minutes(now - 60_000, 1, now));
        assert!(older_than_minutes(now - 60_001, 1, now));
        // Timestamps in the future never count as old.
        assert!(!older_than_minutes(now + 5, 0, now));
    }
}
