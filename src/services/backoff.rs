//! Exponential backoff with jitter for remote-service retries.

use rand::Rng;
use std::time::Duration;

/// Retry schedule: exponential growth from a base delay, capped, with
/// symmetric jitter so reconnecting clients don't stampede.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    factor: f64,
    cap: Duration,
    jitter: f64,
    max_attempts: u32,
}

impl Backoff {
    /// A fully custom schedule. Tests use tiny delays here; production
    /// code uses the named schedules below.
    pub fn new(base: Duration, factor: f64, cap: Duration, jitter: f64, max_attempts: u32) -> Self {
        Self {
            base,
            factor,
            cap,
            jitter,
            max_attempts,
        }
    }

    /// The streaming-service schedule: 0.5s base, doubling, 30s cap,
    /// ±25% jitter, 5 attempts.
    pub fn streaming() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            cap: Duration::from_secs(30),
            jitter: 0.25,
            max_attempts: 5,
        }
    }

    /// Shorter schedule used by per-request retries (translator, TTS).
    pub fn request() -> Self {
        Self {
            max_attempts: 3,
            ..Self::streaming()
        }
    }

    /// Longer schedule for rate-limit responses.
    pub fn rate_limited() -> Self {
        Self {
            base: Duration::from_secs(2),
            ..Self::streaming()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the given retry attempt (0-based), with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * self.factor.powi(attempt as i32);
        let capped = exp.min(self.cap.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}
