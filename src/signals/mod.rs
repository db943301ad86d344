//! Control signals emitted by agents.
//!
//! An agent talks back to the orchestrator through tags in its output:
//!
//! - `<escalate>reason</escalate>` - the step cannot be completed by this role
//! - `<summary>text</summary>` - a short account of what the step did
//!
//! Anything else in the output is treated as the step's artifact.

mod parser;
mod types;

pub use parser::{extract_signals, strip_signals};
pub use types::{EscalationSignal, StepSignals};
