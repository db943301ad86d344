use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::plan::ExecutionPlan;
use crate::status::{RunStatus, StepStatus};
use crate::work_item::WorkItem;

/// The unit of execution: one work item driven through one bound plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: i64,
    pub work_item: WorkItem,
    pub plan: ExecutionPlan,
    /// Plan index of the step currently executing (or next to execute).
    pub current_step: usize,
    pub status: RunStatus,
    /// Human-readable termination reason for non-completed terminal runs.
    pub reason: Option<String>,
    /// Run this one continues from, when created by a resume.
    pub resumed_from: Option<i64>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration, if the run has started.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let started = self.started_at?;
        Some(self.finished_at.unwrap_or(now) - started)
    }
}

/// One agent invocation within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: i64,
    pub run_id: i64,
    /// Execution order within the run, starting at 1. Fallback steps take the
    /// next sequence number while sharing the plan index of the step they replace.
    pub seq: u32,
    pub plan_index: usize,
    pub role: String,
    pub status: StepStatus,
    pub input_summary: String,
    pub output_summary: Option<String>,
    pub escalation_reason: Option<String>,
    pub error_code: Option<String>,
    /// Whether the code-change sink accepted this step's artifact, if one was offered.
    pub artifact_accepted: Option<bool>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
