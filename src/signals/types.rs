//! Signal types an agent can emit in its output.

use serde::{Deserialize, Serialize};

/// The agent cannot complete its step and asks for a different role to take over.
///
/// Emitted as `<escalate>reason</escalate>`. `<blocker>reason</blocker>` is
/// read the same way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationSignal {
    pub reason: String,
}

impl EscalationSignal {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Signals extracted from one step's output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSignals {
    /// Every escalation found, in order of appearance.
    pub escalations: Vec<EscalationSignal>,
    /// Last `<summary>` block, if the agent wrote one.
    pub summary: Option<String>,
}

impl StepSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_escalation(&self) -> bool {
        !self.escalations.is_empty()
    }

    /// Escalation reasons joined into one line.
    pub fn escalation_reason(&self) -> Option<String> {
        if self.escalations.is_empty() {
            return None;
        }
        Some(
            self.escalations
                .iter()
                .map(|e| e.reason.as_str())
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}
