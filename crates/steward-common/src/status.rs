use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid {kind} status: {value}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

/// Lifecycle of a workflow run.
///
/// `Pending → Running → {Completed, Failed, TerminatedBudget, TerminatedError}`.
/// Terminal states never transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TerminatedBudget,
    TerminatedError,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TerminatedBudget => "terminated_budget",
            Self::TerminatedError => "terminated_error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Whether `self → to` is a legal transition.
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::TerminatedError)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::TerminatedBudget)
                | (Self::Running, Self::TerminatedError)
        )
    }

    /// Runs that stopped abnormally (or never stopped) may be continued from
    /// their checkpoint. Completed and Failed runs are final outcomes.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Running | Self::TerminatedBudget | Self::TerminatedError
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "terminated_budget" => Ok(Self::TerminatedBudget),
            "terminated_error" => Ok(Self::TerminatedError),
            _ => Err(ParseStatusError {
                kind: "run",
                value: s.to_string(),
            }),
        }
    }
}

/// Status of one agent invocation within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Escalated,
    Failed,
    /// The prompt could not be fitted into the context window and the role is optional.
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Escalated => "escalated",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "escalated" => Ok(Self::Escalated),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(ParseStatusError {
                kind: "step",
                value: s.to_string(),
            }),
        }
    }
}

/// Outcome of a single model call as written to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Failed,
    Truncated,
    Skipped,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Truncated => "truncated",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "truncated" => Ok(Self::Truncated),
            "skipped" => Ok(Self::Skipped),
            _ => Err(ParseStatusError {
                kind: "call",
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_RUN: [RunStatus; 6] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Completed,
        RunStatus::Failed,
        RunStatus::TerminatedBudget,
        RunStatus::TerminatedError,
    ];

    #[test]
    fn terminal_states_never_transition() {
        for from in ALL_RUN.iter().filter(|s| s.is_terminal()) {
            for to in ALL_RUN {
                assert!(
                    !from.can_transition_to(to),
                    "{} must not transition to {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn running_reaches_every_terminal_state() {
        for to in ALL_RUN.iter().filter(|s| s.is_terminal()) {
            assert!(RunStatus::Running.can_transition_to(*to));
        }
        assert!(!RunStatus::Running.can_transition_to(RunStatus::Pending));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn resumable_excludes_final_outcomes() {
        assert!(RunStatus::TerminatedBudget.is_resumable());
        assert!(RunStatus::TerminatedError.is_resumable());
        assert!(RunStatus::Running.is_resumable());
        assert!(!RunStatus::Completed.is_resumable());
        assert!(!RunStatus::Failed.is_resumable());
    }

    #[test]
    fn status_strings_parse_back() {
        for status in ALL_RUN {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<StepStatus>().is_err());
        assert_eq!("skipped".parse::<CallStatus>().unwrap(), CallStatus::Skipped);
    }
}
