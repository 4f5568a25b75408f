use std::time::Duration;

/// Retry schedule for transient upstream failures. The delay grows linearly
/// with the attempt number (attempt × base), so attempt 1 waits one base
/// delay, attempt 2 waits two, and so on.
///
/// Kept as a plain value so callers can pass it into a provider and tests
/// can exercise the schedule without any network in the loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay to sleep after a failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.max(1))
    }

    /// Whether another attempt remains after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
