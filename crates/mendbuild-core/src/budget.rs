//! Retry budget and delay schedule.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DriverError;

/// Bounded retry policy for one driver run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryBudget {
    pub max_attempts: u32,

    /// Fixed wait after a failure that one or more rules repaired.
    pub settle_delay: Duration,

    /// Unit of the linear backoff after an unclassified failure.
    pub backoff_step: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            settle_delay: Duration::from_secs(2),
            backoff_step: Duration::from_secs(5),
        }
    }
}

impl RetryBudget {
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.max_attempts == 0 {
            return Err(DriverError::InvalidBudget(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff_step.is_zero() {
            return Err(DriverError::InvalidBudget(
                "backoff_step must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Wait before the attempt following `attempt`.
    ///
    /// `fixes_applied` is the number of rules applied to `attempt`'s
    /// failure. Unclassified failures back off linearly in the attempt
    /// number, so each wait is strictly longer than the previous one.
    pub fn delay_after(&self, attempt: u32, fixes_applied: u32) -> Duration {
        if fixes_applied > 0 {
            self.settle_delay
        } else {
            self.backoff_step.saturating_mul(attempt.max(1))
        }
    }
}
