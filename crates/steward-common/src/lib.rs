//! Shared domain types for the Steward orchestration core.
//!
//! Everything here is plain data: work items, execution plans, run and step
//! records, and the immutable model-call records appended to the usage ledger.
//! Behaviour that needs I/O or configuration lives in the `steward` crate.

pub mod call;
pub mod plan;
pub mod run;
pub mod status;
pub mod work_item;

pub use call::{BudgetSnapshot, ModelCall, NewModelCall, ShrinkAction, ShrinkRecord, Usage};
pub use plan::{ComplexityClass, ExecutionPlan, MAX_DURATION_SECS};
pub use run::{Step, WorkflowRun};
pub use status::{CallStatus, ParseStatusError, RunStatus, StepStatus};
pub use work_item::WorkItem;
