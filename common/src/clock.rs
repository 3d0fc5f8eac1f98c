use chrono::{DateTime, Utc};
use log::info;

/// Result of comparing one wall-clock reading against the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContinuityEvent {
    /// Signed jump in seconds, set only when it exceeded the motion timeout.
    pub jump_secs: Option<i64>,
    pub refresh_requested: bool,
}

impl ContinuityEvent {
    pub fn is_discontinuity(&self) -> bool {
        self.jump_secs.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct ClockMonitor {
    refetch_threshold_secs: i64,
    last_known: Option<DateTime<Utc>>,
}

impl ClockMonitor {
    pub fn new(refetch_threshold_secs: i64) -> Self {
        Self {
            refetch_threshold_secs,
            last_known: None,
        }
    }

    pub fn last_known(&self) -> Option<DateTime<Utc>> {
        self.last_known
    }

    /// Records `now` as the last known reading and reports any discontinuity.
    ///
    /// Only forward jumps past the refetch threshold request a schedule refresh.
    pub fn observe(&mut self, now: DateTime<Utc>, motion_timeout_secs: u32) -> ContinuityEvent {
        let Some(previous) = self.last_known.replace(now) else {
            return ContinuityEvent::default();
        };

        let delta = (now - previous).num_seconds();
        if delta.unsigned_abs() <= u64::from(motion_timeout_secs) {
            return ContinuityEvent::default();
        }

        info!("clock jumped by {delta}s");
        ContinuityEvent {
            jump_secs: Some(delta),
            refresh_requested: delta > self.refetch_threshold_secs,
        }
    }
}

/// Whether the motion timeout has run out, measured on the wall clock.
pub fn motion_expired(
    now: DateTime<Utc>,
    last_motion_at: Option<DateTime<Utc>>,
    motion_timeout_secs: u32,
) -> bool {
    let Some(last_motion_at) = last_motion_at else {
        return true;
    };
    (now - last_motion_at).num_seconds() > i64::from(motion_timeout_secs)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 2, 12, 0, 0).unwrap()
    }

    #[test]
    fn first_reading_is_never_a_jump() {
        let mut monitor = ClockMonitor::new(3_600);

        assert_eq!(monitor.observe(base(), 300), ContinuityEvent::default());
        assert_eq!(monitor.last_known(), Some(base()));
    }

    #[test]
    fn steady_ticks_are_continuous() {
        let mut monitor = ClockMonitor::new(3_600);
        monitor.observe(base(), 300);

        let event = monitor.observe(base() + Duration::seconds(300), 300);

        assert!(!event.is_discontinuity());
    }

    #[test]
    fn small_forward_jump_skips_refetch() {
        let mut monitor = ClockMonitor::new(3_600);
        monitor.observe(base(), 300);

        let event = monitor.observe(base() + Duration::seconds(1_800), 300);

        assert_eq!(event.jump_secs, Some(1_800));
        assert!(!event.refresh_requested);
    }

    #[test]
    fn large_forward_jump_requests_refetch() {
        let mut monitor = ClockMonitor::new(3_600);
        monitor.observe(base(), 300);

        let event = monitor.observe(base() + Duration::hours(5), 300);

        assert!(event.refresh_requested);
        assert_eq!(monitor.last_known(), Some(base() + Duration::hours(5)));
    }

    #[test]
    fn backward_jump_never_refetches() {
        let mut monitor = ClockMonitor::new(3_600);
        monitor.observe(base(), 300);

        let event = monitor.observe(base() - Duration::hours(5), 300);

        assert_eq!(event.jump_secs, Some(-18_000));
        assert!(!event.refresh_requested);
    }

    #[test]
    fn motion_expiry_uses_wall_clock() {
        let seen = base();

        assert!(!motion_expired(seen + Duration::seconds(300), Some(seen), 300));
        assert!(motion_expired(seen + Duration::seconds(301), Some(seen), 300));
        assert!(motion_expired(seen, None, 300));
        // Going back in time never expires a recent motion.
        assert!(!motion_expired(seen - Duration::hours(1), Some(seen), 300));
    }
}
