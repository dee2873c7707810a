use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// What to do with a `LogEntry` whose event timestamp falls outside the
/// configured window, from spec.md §6 `timestamp_validation.invalid_action`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidTimestampAction {
    Clamp,
    Reject,
    Warn,
}

/// Result of validating an entry's event timestamp against the allowed
/// window `[now - past_limit, now + future_limit]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampVerdict {
    /// Timestamp was within the window, unchanged.
    Ok,
    /// Timestamp was out of window and clamped to the nearest bound.
    Clamped,
    /// Timestamp was out of window and the caller should warn but keep it.
    Warned,
    /// Timestamp was out of window and the entry should be rejected.
    Rejected,
}

/// Applies `action` to `timestamp` given `now` and the configured past/future
/// limits. Returns the (possibly clamped) timestamp and the verdict.
pub fn validate_timestamp(
    timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
    max_past: Duration,
    max_future: Duration,
    action: InvalidTimestampAction,
) -> (DateTime<Utc>, TimestampVerdict) {
    let lower = now - max_past;
    let upper = now + max_future;

    if timestamp >= lower && timestamp <= upper {
        return (timestamp, TimestampVerdict::Ok);
    }

    match action {
        InvalidTimestampAction::Reject => (timestamp, TimestampVerdict::Rejected),
        InvalidTimestampAction::Warn => (timestamp, TimestampVerdict::Warned),
        InvalidTimestampAction::Clamp => {
            let clamped = if timestamp < lower { lower } else { upper };
            (clamped, TimestampVerdict::Clamped)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_window_is_ok() {
        let now = Utc::now();
        let (ts, verdict) = validate_timestamp(
            now,
            now,
            Duration::hours(1),
            Duration::hours(1),
            InvalidTimestampAction::Clamp,
        );
        assert_eq!(verdict, TimestampVerdict::Ok);
        assert_eq!(ts, now);
    }

    #[test]
    fn future_timestamp_clamps_to_upper_bound() {
        let now = Utc::now();
        let far_future = now + Duration::days(3650);
        let (ts, verdict) = validate_timestamp(
            far_future,
            now,
            Duration::hours(1),
            Duration::seconds(300),
            InvalidTimestampAction::Clamp,
        );
        assert_eq!(verdict, TimestampVerdict::Clamped);
        assert_eq!(ts, now + Duration::seconds(300));
    }

    #[test]
    fn reject_action_flags_without_mutating() {
        let now = Utc::now();
        let past = now - Duration::days(3650);
        let (ts, verdict) = validate_timestamp(
            past,
            now,
            Duration::hours(1),
            Duration::hours(1),
            InvalidTimestampAction::Reject,
        );
        assert_eq!(verdict, TimestampVerdict::Rejected);
        assert_eq!(ts, past);
    }
}
