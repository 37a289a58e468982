use rand::Rng;
use std::time::Duration;

/// Randomized, capped exponential backoff for reconnect attempts.
///
/// Each failure grows the delay by a random fraction of up to twice its
/// current value, never beyond `max`. The delay only grows until
/// [`Backoff::reset`].
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
    fails: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
            fails: 0,
        }
    }

    /// Record a failed attempt and return the delay before the next one.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn next_delay(&mut self) -> Duration {
        self.fails = self.fails.saturating_add(1);
        let current_ms = self.current.as_millis().min(u128::from(u64::MAX)) as u64;
        let factor: f64 = rand::thread_rng().gen();
        let grow_ms = (current_ms as f64 * 2.0 * factor) as u64;
        self.current = Duration::from_millis(current_ms.saturating_add(grow_ms)).min(self.max);
        self.current
    }

    /// Back to the floor after a successful connection.
    pub fn reset(&mut self) {
        self.fails = 0;
        self.current = self.min;
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn fails(&self) -> u32 {
        self.fails
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}
