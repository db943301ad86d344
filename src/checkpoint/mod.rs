//! Checkpoint Store
//!
//! After every completed step the orchestrator overwrites a single snapshot for
//! the run: which plan step finished last, bounded summaries of what each step
//! produced, and the remaining budget. A checkpoint always sits on a step
//! boundary; resume reads it back and continues with the next plan step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use steward_common::BudgetSnapshot;

use crate::errors::CheckpointError;
use crate::store::DbHandle;

/// Most recent step summaries kept in a checkpoint.
pub const MAX_STEP_SUMMARIES: usize = 16;

/// What one completed step produced, in brief.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub plan_index: usize,
    pub role: String,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: i64,
    /// Plan index of the last step that finished (done or skipped).
    pub last_completed_step: usize,
    /// Newest ledger record covered by this checkpoint's figures.
    pub last_call_id: Option<i64>,
    pub summaries: Vec<StepSummary>,
    /// Rolling summary fed to the next step's prompt.
    pub running_summary: String,
    /// Signed remaining budget at the step boundary.
    pub remaining: BudgetSnapshot,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(run_id: i64, last_completed_step: usize, remaining: BudgetSnapshot) -> Self {
        Self {
            run_id,
            last_completed_step,
            last_call_id: None,
            summaries: Vec::new(),
            running_summary: String::new(),
            remaining,
            updated_at: Utc::now(),
        }
    }

    /// Append a summary, evicting the oldest past [`MAX_STEP_SUMMARIES`].
    pub fn push_summary(
        &mut self,
        plan_index: usize,
        role: impl Into<String>,
        summary: impl Into<String>,
    ) {
        self.summaries.push(StepSummary {
            plan_index,
            role: role.into(),
            summary: summary.into(),
        });
        if self.summaries.len() > MAX_STEP_SUMMARIES {
            let excess = self.summaries.len() - MAX_STEP_SUMMARIES;
            self.summaries.drain(..excess);
        }
    }

    /// Plan index the next run should start from.
    pub fn next_step(&self) -> usize {
        self.last_completed_step + 1
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Overwrite the run's checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn load(&self, run_id: i64) -> Result<Option<Checkpoint>, CheckpointError>;
}

#[async_trait]
impl CheckpointStore for DbHandle {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let run_id = checkpoint.run_id;
        let mut owned = checkpoint.clone();
        owned.updated_at = Utc::now();
        let written = self
            .call(move |db| db.upsert_checkpoint(&owned))
            .await
            .map_err(|source| CheckpointError::WriteFailed { run_id, source })?;
        if !written {
            tracing::debug!(run_id, "Run is no longer live; checkpoint not stored");
        }
        Ok(())
    }

    async fn load(&self, run_id: i64) -> Result<Option<Checkpoint>, CheckpointError> {
        self.call(move |db| db.get_checkpoint(run_id))
            .await
            .map_err(|source| CheckpointError::ReadFailed { run_id, source })
    }
}
