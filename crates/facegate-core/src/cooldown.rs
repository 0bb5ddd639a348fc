//! Per-identity dispatch cooldown.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Source of wall-clock time for the gate.
pub trait Clock {
    fn now(&self) -> SystemTime;
}

/// The system wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Tracks the last dispatch time per identity label.
///
/// Labels never recorded behave as if last dispatched at the UNIX epoch.
#[derive(Debug, Default, Clone)]
pub struct CooldownTracker {
    last_dispatch: HashMap<String, SystemTime>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn last(&self, label: &str) -> SystemTime {
        self.last_dispatch
            .get(label)
            .copied()
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    /// Time since the last dispatch of `label`, zero if `now` is earlier.
    fn elapsed(&self, label: &str, now: SystemTime) -> Duration {
        now.duration_since(self.last(label)).unwrap_or(Duration::ZERO)
    }

    /// True iff more than `window` has passed since `label` was last dispatched.
    pub fn should_dispatch(&self, label: &str, now: SystemTime, window: Duration) -> bool {
        self.elapsed(label, now) > window
    }

    /// Record a dispatch decision for `label`. Call this when deciding to
    /// dispatch, whether or not the backend call then succeeds.
    pub fn record(&mut self, label: &str, now: SystemTime) {
        self.last_dispatch.insert(label.to_string(), now);
    }

    /// Cooldown left before `label` may dispatch again, floored to zero.
    pub fn remaining(&self, label: &str, now: SystemTime, window: Duration) -> Duration {
        window.saturating_sub(self.elapsed(label, now))
    }

    pub fn len(&self) -> usize {
        self.last_dispatch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_dispatch.is_empty()
    }
}

/// Render a remaining cooldown as `"COOLDOWN: {m}m {s}s"`, truncating to whole seconds.
pub fn format_remaining(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    format!("COOLDOWN: {}m {}s", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(50);

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    #[test]
    fn test_unseen_label_dispatches() {
        let tracker = CooldownTracker::new();
        assert!(tracker.should_dispatch("A001", at(0), WINDOW));
        assert_eq!(tracker.remaining("A001", at(0), WINDOW), Duration::ZERO);
    }

    #[test]
    fn test_window_boundary() {
        let mut tracker = CooldownTracker::new();
        tracker.record("A001", at(0));

        assert!(!tracker.should_dispatch("A001", at(0), WINDOW));
        assert!(!tracker.should_dispatch("A001", at(49), WINDOW));
        // Exactly `window` later is still inside the cooldown.
        assert!(!tracker.should_dispatch("A001", at(50), WINDOW));
        assert!(tracker.should_dispatch(
            "A001",
            at(50) + Duration::from_millis(1),
            WINDOW
        ));
        assert!(tracker.should_dispatch("A001", at(120), WINDOW));
    }

    #[test]
    fn test_clock_going_backwards_stays_in_cooldown() {
        let mut tracker = CooldownTracker::new();
        tracker.record("A001", at(100));
        assert!(!tracker.should_dispatch("A001", at(10), WINDOW));
        assert_eq!(tracker.remaining("A001", at(10), WINDOW), WINDOW);
    }

    #[test]
    fn test_remaining_one_second_later() {
        let mut tracker = CooldownTracker::new();
        tracker.record("A001", at(0));
        let remaining = tracker.remaining("A001", at(1), WINDOW);
        assert_eq!(remaining, Duration::from_secs(49));
        assert_eq!(format_remaining(remaining), "COOLDOWN: 0m 49s");
    }

    #[test]
    fn test_remaining_floors_to_zero() {
        let mut tracker = CooldownTracker::new();
        tracker.record("A001", at(0));
        assert_eq!(tracker.remaining("A001", at(500), WINDOW), Duration::ZERO);
    }

    #[test]
    fn test_labels_are_independent() {
        let mut tracker = CooldownTracker::new();
        tracker.record("A001", at(0));
        assert!(tracker.should_dispatch("B002", at(1), WINDOW));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_format_remaining_minutes() {
        assert_eq!(
            format_remaining(Duration::from_millis(125_900)),
            "COOLDOWN: 2m 5s"
        );
    }
}
