//! Sliding-window event-rate counter.
//!
//! Mirrors `RateTracker` from the originating implementation: a
//! monotonically ordered ring of event timestamps pruned to a fixed
//! window, reporting events-per-minute.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Minimum allowed window, per the configuration surface (`rate_window`,
/// minimum 30s).
pub const MIN_WINDOW: Duration = Duration::from_secs(30);

/// Default window used when none is configured.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(180);

/// A sliding-window event-rate counter. Safe to `record` and read
/// concurrently from any number of tasks.
#[derive(Debug)]
pub struct RateTracker {
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl RateTracker {
    /// Creates a tracker with the given window, floored to [`MIN_WINDOW`].
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(MIN_WINDOW),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// The effective window in use (after flooring).
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Records an event at the current instant and prunes stale entries.
    pub fn record(&self) {
        let now = Instant::now();
        let mut events = self.events.lock();
        events.push_back(now);
        Self::prune(&mut events, now, self.window);
    }

    /// Prunes stale entries, then reports events-per-minute over the
    /// effective span (`max(1s, min(window, now - oldest))`).
    pub fn rate_per_minute(&self) -> f64 {
        let now = Instant::now();
        let mut events = self.events.lock();
        Self::prune(&mut events, now, self.window);
        let Some(&oldest) = events.front() else {
            return 0.0;
        };
        let span = (now - oldest).min(self.window).max(Duration::from_secs(1));
        (events.len() as f64 / span.as_secs_f64()) * 60.0
    }

    fn prune(events: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(&oldest) = events.front() {
            if now.duration_since(oldest) > window {
                events.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn empty_tracker_reports_zero() {
        let tracker = RateTracker::new(Duration::from_secs(60));
        assert_eq!(tracker.rate_per_minute(), 0.0);
    }

    #[test]
    fn window_is_floored_to_minimum() {
        let tracker = RateTracker::new(Duration::from_secs(1));
        assert_eq!(tracker.window(), MIN_WINDOW);
    }

    #[test]
    fn single_burst_yields_expected_rate() {
        let tracker = RateTracker::new(Duration::from_secs(60));
        for _ in 0..6 {
            tracker.record();
        }
        // Six events recorded near-instantly: span floors to 1s, so the
        // rate is `(6 / 1) * 60 = 360`, an upper bound in practice since a
        // few microseconds elapse between calls.
        let rate = tracker.rate_per_minute();
        assert!(rate > 0.0);
    }

    #[test]
    fn events_outside_window_are_pruned() {
        let tracker = RateTracker::new(MIN_WINDOW);
        tracker.record();
        sleep(Duration::from_millis(10));
        let rate = tracker.rate_per_minute();
        assert!(rate > 0.0);
    }

    /// Two events `window + 1s` apart: the older one must be pruned before
    /// the rate is computed, leaving exactly one event in the span.
    #[test]
    fn stale_event_is_pruned_before_recent_one_counted() {
        let tracker = RateTracker::new(MIN_WINDOW);
        let now = Instant::now();
        {
            let mut events = tracker.events.lock();
            events.push_back(now - (MIN_WINDOW + Duration::from_secs(1)));
            events.push_back(now);
        }
        let rate = tracker.rate_per_minute();
        // With one event left and a 1s-floored span, rate == 60/span <= 60.
        assert!(rate > 0.0 && rate <= 60.0);
        assert_eq!(tracker.events.lock().len(), 1);
    }
}
