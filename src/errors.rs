//! Typed error hierarchy for the Steward orchestrator.
//!
//! - `OrchestratorError` - run lifecycle failures surfaced to callers
//! - `LedgerError` / `CheckpointError` - data errors, always fatal to the current step
//! - `ContextError` - invalid context-window configuration, fatal to the run
//! - `TransportError` - model-call failures, retried by the step machine
//! - `SourceError` - work-item lookup failures, which prevent a run from starting

use std::time::Duration;

use steward_common::RunStatus;
use thiserror::Error;

/// Errors from the workflow orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Workflow run {id} not found")]
    RunNotFound { id: i64 },

    #[error("Workflow run {id} cannot be resumed from status {status}")]
    NotResumable { id: i64, status: RunStatus },

    #[error("Workflow run {id} has no checkpoint to resume from")]
    NoCheckpoint { id: i64 },

    #[error("Invalid status transition for run {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Unknown agent role '{0}'")]
    UnknownRole(String),

    #[error("Invalid execution plan: {0}")]
    InvalidPlan(String),

    #[error("Workflow run {id} was already resumed as run {continuation}; resume that run instead")]
    AlreadyResumed { id: i64, continuation: i64 },

    #[error("Work item could not be fetched: {0}")]
    Source(#[from] SourceError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the usage ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Failed to append model call for run {run_id}: {source}")]
    AppendFailed {
        run_id: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("Model call {id} not found; corrections must reference an existing record")]
    UnknownCall { id: i64 },

    #[error("Ledger query failed: {0}")]
    Query(#[source] anyhow::Error),
}

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to write checkpoint for run {run_id}: {source}")]
    WriteFailed {
        run_id: i64,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to read checkpoint for run {run_id}: {source}")]
    ReadFailed {
        run_id: i64,
        #[source]
        source: anyhow::Error,
    },
}

/// Errors from context governor configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContextError {
    #[error("Invalid safety buffer '{value}': {reason}")]
    InvalidSafetyBuffer { value: String, reason: String },

    #[error("Safety buffer of {buffer} tokens leaves no room in a {window}-token context window")]
    BufferExceedsWindow { buffer: usize, window: usize },
}

/// Failures reported by the model-calling capability.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("Rate limited by provider: {0}")]
    RateLimit(String),

    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Provider error: {0}")]
    Provider(String),
}

impl TransportError {
    /// Stable code stored on the ledger record and the failed step.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimit(_) => "RATE_LIMIT",
            Self::Timeout(_) => "TIMEOUT",
            Self::Provider(_) => "PROVIDER_ERROR",
        }
    }
}

/// Failures from the work-item source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Work item '{id}' not found")]
    NotFound { id: String },

    #[error("Not authorized to read work items: {0}")]
    Auth(String),

    #[error("Work item '{id}' is malformed: {message}")]
    Malformed { id: String, message: String },
}
