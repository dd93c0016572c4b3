//! Monotonic time for the pipeline.
//!
//! Origin timestamps, per-stage latencies and all remote deadlines read a
//! single process-scoped monotonic source, never wall clock. Stations hold
//! the source as a trait object, which lets tests freeze time and step it
//! frame by frame through the latency-sensitive paths.

use crate::defaults;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// The pipeline's time source.
pub trait Clock: Send + Sync {
    /// Current monotonic reading.
    fn now(&self) -> Instant;

    /// Elapsed time since an earlier reading of this clock.
    ///
    /// Used for latency accounting against origin timestamps; saturates to
    /// zero if `earlier` is in this clock's future.
    fn since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

/// Production source backed by `Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Test source that stands still until stepped.
///
/// Keeps a fixed epoch and a shared offset, so clones hand the same frozen
/// timeline to several stations at once.
#[derive(Debug, Clone)]
pub struct ManualClock {
    epoch: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Steps the clock forward.
    pub fn advance(&self, step: Duration) {
        *self.offset.lock().unwrap() += step;
    }

    /// Steps the clock forward by whole 30ms capture frames.
    pub fn advance_frames(&self, frames: u32) {
        self.advance(Duration::from_millis(
            frames as u64 * defaults::FRAME_DURATION_MS as u64,
        ));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.epoch + *self.offset.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock;
        let first = clock.now();
        assert!(clock.now() >= first);
    }

    #[test]
    fn test_since_measures_elapsed() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(750));
        assert_eq!(clock.since(start), Duration::from_millis(750));
    }

    #[test]
    fn test_since_saturates_on_future_readings() {
        let clock = ManualClock::new();
        let now = clock.now();
        let future = now + Duration::from_secs(1);
        assert_eq!(clock.since(future), Duration::ZERO);
    }

    #[test]
    fn test_manual_clock_stands_still() {
        let clock = ManualClock::new();
        let first = clock.now();
        assert_eq!(clock.now(), first);
    }

    #[test]
    fn test_advance_frames_steps_in_frame_units() {
        let clock = ManualClock::new();
        let start = clock.now();
        // Ten 30ms capture frames
        clock.advance_frames(10);
        assert_eq!(clock.since(start), Duration::from_millis(300));
    }

    #[test]
    fn test_clones_share_the_timeline() {
        let clock = ManualClock::new();
        let station_view = clock.clone();
        clock.advance(Duration::from_millis(40));
        assert_eq!(station_view.now(), clock.now());
    }
}
