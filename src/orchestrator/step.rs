//! Per-step retry state machine.
//!
//! A step makes at most `max_retries + 1` model calls. Transport failures
//! move it through `Running → (backoff) → Running` until the retries are
//! spent, then to `Failed`. Output moves it to `Done` or `Escalated`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use steward_common::StepStatus;

use crate::errors::TransportError;

pub const DEFAULT_MAX_RETRIES: u32 = 1;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(2);

/// Delay before a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffPolicy {
    Fixed { delay: Duration },
    /// `base * 2^(retry - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed {
            delay: DEFAULT_BACKOFF,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            BackoffPolicy::Fixed { delay } => delay,
            BackoffPolicy::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// What the caller should do after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    Retry { after: Duration },
    GiveUp(TransportError),
}

#[derive(Debug, Clone)]
pub struct StepMachine {
    pub status: StepStatus,
    /// Attempts started so far.
    pub attempt: u32,
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl StepMachine {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            status: StepStatus::Pending,
            attempt: 0,
            max_retries,
            backoff,
        }
    }

    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.status = StepStatus::Running;
        self.attempt
    }

    pub fn retries_used(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }

    pub fn on_transport_error(&mut self, err: TransportError) -> StepAction {
        if self.attempt <= self.max_retries {
            StepAction::Retry {
                after: self.backoff.delay(self.attempt),
            }
        } else {
            self.status = StepStatus::Failed;
            StepAction::GiveUp(err)
        }
    }

    pub fn on_output(&mut self, escalated: bool) {
        self.status = if escalated {
            StepStatus::Escalated
        } else {
            StepStatus::Done
        };
    }

    pub fn skip(&mut self) {
        self.status = StepStatus::Skipped;
    }
}

impl Default for StepMachine {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES, BackoffPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> TransportError {
        TransportError::Timeout(Duration::from_secs(30))
    }

    #[test]
    fn test_single_retry_then_give_up() {
        let mut machine = StepMachine::default();
        machine.begin_attempt();
        assert_eq!(
            machine.on_transport_error(timeout()),
            StepAction::Retry {
                after: Duration::from_secs(2)
            }
        );
        machine.begin_attempt();
        assert_eq!(
            machine.on_transport_error(timeout()),
            StepAction::GiveUp(timeout())
        );
        assert_eq!(machine.status, StepStatus::Failed);
        assert_eq!(machine.retries_used(), 1);
    }

    #[test]
    fn test_zero_retries_gives_up_immediately() {
        let mut machine = StepMachine::new(0, BackoffPolicy::default());
        machine.begin_attempt();
        assert!(matches!(
            machine.on_transport_error(TransportError::RateLimit("429".into())),
            StepAction::GiveUp(TransportError::RateLimit(_))
        ));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_millis(500),
            max: Duration::from_secs(3),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(3));
        assert_eq!(policy.delay(40), Duration::from_secs(3));
    }

    #[test]
    fn test_output_transitions() {
        let mut machine = StepMachine::default();
        machine.begin_attempt();
        machine.on_output(true);
        assert_eq!(machine.status, StepStatus::Escalated);
        machine.on_output(false);
        assert_eq!(machine.status, StepStatus::Done);
        machine.skip();
        assert_eq!(machine.status, StepStatus::Skipped);
    }
}
