//! Idle-work gating from daily quota surplus.

use std::time::Duration;

use chrono::{DateTime, FixedOffset, Timelike};

/// Percentage (0..100) of the local day elapsed at `now`.
pub fn elapsed_day_pct(now: DateTime<FixedOffset>) -> f64 {
    let seconds = f64::from(now.num_seconds_from_midnight());
    seconds / 86_400.0 * 100.0
}

/// Points by which daily usage lags the clock. Positive means unspent slack.
pub fn surplus(elapsed_pct: f64, usage_pct: f64) -> f64 {
    elapsed_pct - usage_pct
}

/// Background work is allowed when any tier's surplus exceeds `threshold`
/// and the system has had no active goal for longer than `idle_threshold`.
pub fn idle_work_permitted(
    surpluses: &[f64],
    threshold: f64,
    idle_for: Duration,
    idle_threshold: Duration,
) -> bool {
    idle_for > idle_threshold && surpluses.iter().any(|surplus| *surplus > threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn noon_is_half_the_day() {
        let offset = FixedOffset::west_opt(8 * 3600).expect("offset");
        let noon = offset
            .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("time");
        assert!((elapsed_day_pct(noon) - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn requires_both_idle_time_and_surplus() {
        let idle = Duration::from_secs(600);
        let limit = Duration::from_secs(300);
        assert!(idle_work_permitted(&[10.0, 30.0], 25.0, idle, limit));
        assert!(!idle_work_permitted(&[10.0, 20.0], 25.0, idle, limit));
        assert!(!idle_work_permitted(
            &[90.0],
            25.0,
            Duration::from_secs(10),
            limit
        ));
    }

    #[test]
    fn surplus_is_clock_minus_usage() {
        assert!((surplus(60.0, 20.0) - 40.0).abs() < f64::EPSILON);
    }
}
