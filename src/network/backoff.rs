use std::time::Duration;

// Tiered reconnect delays
pub const FIRST_RETRY_DELAY: Duration = Duration::ZERO;
pub const SHORT_RETRY_DELAY: Duration = Duration::from_millis(500);
pub const MEDIUM_RETRY_DELAY: Duration = Duration::from_millis(15_000);
pub const LONG_RETRY_DELAY: Duration = Duration::from_millis(60_000);

/// Delay before the next attempt after `consecutive_failures` failures in a row
pub fn retry_delay(consecutive_failures: u32) -> Duration {
    match consecutive_failures {
        0 | 1 => FIRST_RETRY_DELAY,
        2..=5 => SHORT_RETRY_DELAY,
        6..=13 => MEDIUM_RETRY_DELAY,
        _ => LONG_RETRY_DELAY,
    }
}

/// What the protocol handler wants done after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    /// Give up: the manager closes instead of reconnecting
    Stop,
}

/// Consecutive-failure counter driving the reconnect schedule
#[derive(Debug, Default, Clone)]
pub struct Backoff {
    consecutive_failures: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a failure and return the delay to wait before retrying
    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        retry_delay(self.consecutive_failures)
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
