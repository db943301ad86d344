//! Steward: budget-governed orchestration of agent workflows.
//!
//! A work item is assessed into a complexity class, bound to an execution
//! plan and driven through the plan's agent roles one step at a time. Every
//! model call is authorized against the run's budget, fitted into the
//! context window, recorded in the usage ledger and checkpointed so a
//! stopped run can be resumed without replaying anything.

pub mod assess;
pub mod audit;
pub mod budget;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod errors;
pub mod ledger;
pub mod model;
pub mod orchestrator;
pub mod signals;
pub mod sink;
pub mod source;
pub mod store;
pub mod telemetry;
pub mod util;
