//! Workflow orchestration: runs a work item's execution plan step by step
//! under its budget, with retries, fallbacks, checkpoints and resume.

pub mod heartbeat;
pub mod roles;
pub mod runner;
pub mod step;

pub use heartbeat::{DEFAULT_STALE_AFTER, Heartbeat, report_stale};
pub use roles::{AgentRole, BuiltinRole, RoleRegistry};
pub use runner::{
    CeilingOverrides, Orchestrator, OrchestratorSettings, ResumePlan, RunContext, RunReport,
};
pub use step::{BackoffPolicy, StepAction, StepMachine};
