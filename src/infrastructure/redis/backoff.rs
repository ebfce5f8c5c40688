//! Reconnect backoff for long-lived Redis subscriptions

use std::time::Duration;

use rand::Rng;

/// Doubling delay with a cap and +/- jitter so that nodes losing Redis at the
/// same moment do not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    current: Duration,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            jitter: 0.1,
            current: initial,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        if self.jitter <= 0.0 {
            return base;
        }
        let spread = base.as_millis() as f64 * self.jitter;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_millis((base.as_millis() as f64 + offset).max(1.0) as u64)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30))
    }
}
