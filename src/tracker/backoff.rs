use std::time::Duration;

/// Delay policy for consecutive camera read failures.
///
/// The first `after_failures` failures retry immediately. Past that the delay
/// starts at `base`, doubles per failure and is capped at `max`. The loop
/// never gives up on its own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub after_failures: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            after_failures: 5,
            base: Duration::from_millis(10),
            max: Duration::from_millis(500),
        }
    }
}

impl Backoff {
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures <= self.after_failures {
            return Duration::ZERO;
        }
        let exponent = (consecutive_failures - self.after_failures - 1).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// True for the first failure that gets delayed.
    pub fn is_escalating(&self, consecutive_failures: u32) -> bool {
        consecutive_failures == self.after_failures + 1
    }
}
