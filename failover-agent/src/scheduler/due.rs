//! When does a target need a run?

use std::fmt;

use chrono::{DateTime, TimeZone, Timelike, Utc};
use failover_store::{ReplicationRun, ReplicationTarget};

/// A run is never postponed for longer than this.
pub const MAX_RUN_GAP: chrono::Duration = chrono::Duration::hours(24);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueReason {
    /// Manual trigger.
    Forced,
    NeverRun,
    LastFailed,
    /// The last recorded start lies in the future.
    ClockReset,
    Overdue,
    ScheduledHour,
}

impl fmt::Display for DueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DueReason::Forced => "forced",
            DueReason::NeverRun => "never run",
            DueReason::LastFailed => "last run failed",
            DueReason::ClockReset => "clock reset",
            DueReason::Overdue => "overdue",
            DueReason::ScheduledHour => "scheduled hour",
        };
        f.write_str(text)
    }
}

/// Decide whether `target` is due at `now`, given its most recent run.
///
/// Schedule hours are matched against `now` in its own time zone.
pub fn is_due<Tz: TimeZone>(
    target: &ReplicationTarget,
    last: Option<&ReplicationRun>,
    now: &DateTime<Tz>,
) -> Option<DueReason> {
    let Some(last) = last else {
        return Some(DueReason::NeverRun);
    };
    if !last.success {
        return Some(DueReason::LastFailed);
    }

    let elapsed = now.with_timezone(&Utc).signed_duration_since(last.started_at);
    if elapsed < chrono::Duration::zero() {
        return Some(DueReason::ClockReset);
    }
    if elapsed > MAX_RUN_GAP {
        return Some(DueReason::Overdue);
    }

    let min_interval = chrono::Duration::from_std(target.min_interval).unwrap_or(MAX_RUN_GAP);
    if target.schedule_hours.contains(&now.hour()) && elapsed >= min_interval {
        return Some(DueReason::ScheduledHour);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, FixedOffset};
    use std::collections::BTreeSet;
    use std::path::PathBuf;

    fn target(hours: &[u32], min_interval_secs: u64) -> ReplicationTarget {
        ReplicationTarget {
            id: "t1".into(),
            source: "primary".into(),
            destination: "standby".into(),
            to_path: PathBuf::from("/"),
            schedule_hours: hours.iter().copied().collect::<BTreeSet<_>>(),
            min_interval: std::time::Duration::from_secs(min_interval_secs),
            bandwidth_limit: -1,
            use_compression: false,
            enabled: true,
        }
    }

    fn run_at(started: DateTime<Utc>, success: bool) -> ReplicationRun {
        let mut run = ReplicationRun::new("t1", started);
        run.success = success;
        run
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 15, 0).unwrap()
    }

    #[test]
    fn test_never_run_is_due() {
        assert_eq!(is_due(&target(&[], 3600), None, &noon()), Some(DueReason::NeverRun));
    }

    #[test]
    fn test_recent_success_outside_schedule_not_due() {
        let last = run_at(noon() - Duration::hours(2), true);
        assert_eq!(is_due(&target(&[3], 3600), Some(&last), &noon()), None);
    }

    #[test]
    fn test_failed_run_is_retried() {
        let last = run_at(noon() - Duration::minutes(5), false);
        assert_eq!(is_due(&target(&[], 3600), Some(&last), &noon()), Some(DueReason::LastFailed));
    }

    #[test]
    fn test_future_start_means_clock_reset() {
        let last = run_at(noon() + Duration::hours(1), true);
        assert_eq!(is_due(&target(&[], 3600), Some(&last), &noon()), Some(DueReason::ClockReset));
    }

    #[test]
    fn test_more_than_a_day_is_overdue() {
        let last = run_at(noon() - Duration::hours(25), true);
        assert_eq!(is_due(&target(&[], 3600), Some(&last), &noon()), Some(DueReason::Overdue));

        let last = run_at(noon() - Duration::hours(24), true);
        assert_eq!(is_due(&target(&[], 3600), Some(&last), &noon()), None);
    }

    #[test]
    fn test_scheduled_hour_respects_min_interval() {
        let t = target(&[12], 3600);
        let two_hours = run_at(noon() - Duration::hours(2), true);
        assert_eq!(is_due(&t, Some(&two_hours), &noon()), Some(DueReason::ScheduledHour));

        let half_hour = run_at(noon() - Duration::minutes(30), true);
        assert_eq!(is_due(&t, Some(&half_hour), &noon()), None);
    }

    #[test]
    fn test_hour_is_taken_in_local_zone() {
        let t = target(&[14], 3600);
        let last = run_at(noon() - Duration::hours(3), true);
        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(is_due(&t, Some(&last), &noon().with_timezone(&plus_two)), Some(DueReason::ScheduledHour));
        assert_eq!(is_due(&t, Some(&last), &noon()), None);
    }
}
