//! Pure reconnection policy
//!
//! Fixed retry budget with a fixed delay between attempts. The supervisor
//! feeds in the number of consecutive connection failures and acts on the
//! returned [`ReconnectionDecision`].

use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive `ConnectionLost` failures tolerated before giving up
    pub max_retries: u32,
    /// Pause before each reconnection attempt
    pub retry_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// Decide what to do after `consecutive_failures` failures (pure function)
    ///
    /// A successful connect resets the caller's counter to zero, so failures
    /// never accumulate across healthy periods.
    pub fn decide(&self, consecutive_failures: u32) -> ReconnectionDecision {
        if consecutive_failures >= self.max_retries {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }

        ReconnectionDecision::Proceed {
            attempt: consecutive_failures + 1,
            delay: self.retry_delay,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries == 0 {
            return Err("max_retries must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Sleep `delay`, then make reconnection attempt number `attempt`
    Proceed { attempt: u32, delay: Duration },
    /// Budget exhausted
    AbortMaxAttemptsExceeded,
}
