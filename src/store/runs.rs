//! Workflow run and step records.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use steward_common::{ExecutionPlan, RunStatus, Step, StepStatus, WorkItem, WorkflowRun};

use super::StewardDb;

const RUN_COLUMNS: &str = "id, work_item, plan, current_step, status, reason, resumed_from, \
     cancel_requested, created_at, started_at, finished_at, last_heartbeat";

const STEP_COLUMNS: &str = "id, run_id, seq, plan_index, role, status, input_summary, \
     output_summary, escalation_reason, error_code, artifact_accepted, started_at, finished_at";

/// Result of a compare-and-set status update.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(WorkflowRun),
    /// The run was not in a state that allows the requested transition.
    Rejected { current: RunStatus },
}

/// Final fields written when a step stops running.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub output_summary: Option<String>,
    pub escalation_reason: Option<String>,
    pub error_code: Option<String>,
}

impl StepOutcome {
    pub fn new(status: StepStatus) -> Self {
        Self {
            status,
            output_summary: None,
            escalation_reason: None,
            error_code: None,
        }
    }

    pub fn output(mut self, summary: impl Into<String>) -> Self {
        self.output_summary = Some(summary.into());
        self
    }

    pub fn escalation(mut self, reason: impl Into<String>) -> Self {
        self.escalation_reason = Some(reason.into());
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }
}

impl StewardDb {
    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(
        &self,
        work_item: &WorkItem,
        plan: &ExecutionPlan,
        resumed_from: Option<i64>,
    ) -> Result<WorkflowRun> {
        let item_json = serde_json::to_string(work_item).context("Failed to encode work item")?;
        let plan_json = serde_json::to_string(plan).context("Failed to encode plan")?;
        self.conn
            .execute(
                "INSERT INTO workflow_runs
                 (work_item_id, work_item, plan, complexity, resumed_from, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    work_item.id,
                    item_json,
                    plan_json,
                    plan.complexity.as_str(),
                    resumed_from,
                    Utc::now()
                ],
            )
            .context("Failed to insert workflow run")?;
        let id = self.conn.last_insert_rowid();
        self.get_run(id)?.context("Workflow run not found after insert")
    }

    pub fn get_run(&self, id: i64) -> Result<Option<WorkflowRun>> {
        let sql = format!("SELECT {} FROM workflow_runs WHERE id = ?1", RUN_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], RunRow::from_row)
            .optional()
            .context("Failed to query workflow run")?;
        row.map(RunRow::into_run).transpose()
    }

    /// Id of the newest run that continues `id`, if it was ever resumed.
    pub fn latest_continuation(&self, id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT MAX(id) FROM workflow_runs WHERE resumed_from = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("Failed to query continuation runs")
    }

    /// Most recent runs first.
    pub fn list_runs(&self, limit: usize) -> Result<Vec<WorkflowRun>> {
        let sql = format!(
            "SELECT {} FROM workflow_runs ORDER BY id DESC LIMIT ?1",
            RUN_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map(params![limit as i64], RunRow::from_row)
            .context("Failed to query workflow runs")?;
        let mut runs = Vec::new();
        for row in rows {
            let r = row.context("Failed to read workflow run row")?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }

    /// Move a run to `to`, but only if it is still in a state that allows it.
    ///
    /// The UPDATE is guarded on the status read, so two writers racing on the
    /// same run cannot both succeed.
    pub fn transition_run(
        &self,
        id: i64,
        to: RunStatus,
        reason: Option<&str>,
    ) -> Result<Transition> {
        let current = self
            .get_run(id)?
            .with_context(|| format!("Workflow run {} not found", id))?
            .status;
        if !current.can_transition_to(to) {
            return Ok(Transition::Rejected { current });
        }

        let now = Utc::now();
        let changed = if to == RunStatus::Running {
            self.conn.execute(
                "UPDATE workflow_runs SET status = ?1, started_at = ?2, last_heartbeat = ?2
                 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), now, id, current.as_str()],
            )
        } else {
            self.conn.execute(
                "UPDATE workflow_runs SET status = ?1, reason = ?2, finished_at = ?3
                 WHERE id = ?4 AND status = ?5",
                params![to.as_str(), reason, now, id, current.as_str()],
            )
        }
        .context("Failed to update workflow run status")?;

        if changed == 0 {
            let current = self
                .get_run(id)?
                .context("Workflow run vanished during transition")?
                .status;
            return Ok(Transition::Rejected { current });
        }
        let run = self
            .get_run(id)?
            .context("Workflow run not found after transition")?;
        Ok(Transition::Applied(run))
    }

    pub fn set_current_step(&self, id: i64, plan_index: usize) -> Result<()> {
        self.conn
            .execute(
                "UPDATE workflow_runs SET current_step = ?1 WHERE id = ?2",
                params![plan_index as i64, id],
            )
            .context("Failed to update current step")?;
        Ok(())
    }

    /// Refresh the liveness timestamp. Returns false once the run is terminal.
    pub fn touch_heartbeat(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE workflow_runs SET last_heartbeat = ?1
                 WHERE id = ?2 AND status IN ('pending', 'running')",
                params![Utc::now(), id],
            )
            .context("Failed to update heartbeat")?;
        Ok(changed > 0)
    }

    /// Flag a live run for cancellation. Returns false if the run is already terminal.
    pub fn request_cancel(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE workflow_runs SET cancel_requested = 1
                 WHERE id = ?1 AND status IN ('pending', 'running')",
                params![id],
            )
            .context("Failed to request cancellation")?;
        Ok(changed > 0)
    }

    pub fn cancel_requested(&self, id: i64) -> Result<bool> {
        let flag: Option<bool> = self
            .conn
            .query_row(
                "SELECT cancel_requested FROM workflow_runs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read cancel flag")?;
        Ok(flag.unwrap_or(false))
    }

    /// Running runs whose last heartbeat is older than `stale_after`.
    pub fn stale_runs(
        &self,
        stale_after: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkflowRun>> {
        let sql = format!(
            "SELECT {} FROM workflow_runs WHERE status = 'running' ORDER BY id",
            RUN_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare stale_runs")?;
        let rows = stmt
            .query_map([], RunRow::from_row)
            .context("Failed to query running runs")?;
        let cutoff = now - stale_after;
        let mut stale = Vec::new();
        for row in rows {
            let run = row.context("Failed to read workflow run row")?.into_run()?;
            let last_seen = run.last_heartbeat.or(run.started_at).unwrap_or(run.created_at);
            if last_seen < cutoff {
                stale.push(run);
            }
        }
        Ok(stale)
    }

    // ── Steps ─────────────────────────────────────────────────────────

    /// Insert a step in the Running state with the next sequence number.
    pub fn create_step(
        &self,
        run_id: i64,
        plan_index: usize,
        role: &str,
        input_summary: &str,
    ) -> Result<Step> {
        let seq: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM steps WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .context("Failed to compute next step seq")?;
        self.conn
            .execute(
                "INSERT INTO steps (run_id, seq, plan_index, role, status, input_summary, started_at)
                 VALUES (?1, ?2, ?3, ?4, 'running', ?5, ?6)",
                params![run_id, seq, plan_index as i64, role, input_summary, Utc::now()],
            )
            .context("Failed to insert step")?;
        let id = self.conn.last_insert_rowid();
        self.get_step(id)?.context("Step not found after insert")
    }

    pub fn finish_step(&self, id: i64, outcome: &StepOutcome) -> Result<Step> {
        self.conn
            .execute(
                "UPDATE steps SET status = ?1, output_summary = ?2, escalation_reason = ?3,
                 error_code = ?4, finished_at = ?5 WHERE id = ?6",
                params![
                    outcome.status.as_str(),
                    outcome.output_summary,
                    outcome.escalation_reason,
                    outcome.error_code,
                    Utc::now(),
                    id
                ],
            )
            .context("Failed to finish step")?;
        self.get_step(id)?.context("Step not found after update")
    }

    pub fn set_artifact_accepted(&self, id: i64, accepted: bool) -> Result<()> {
        self.conn
            .execute(
                "UPDATE steps SET artifact_accepted = ?1 WHERE id = ?2",
                params![accepted, id],
            )
            .context("Failed to record artifact outcome")?;
        Ok(())
    }

    pub fn get_step(&self, id: i64) -> Result<Option<Step>> {
        let sql = format!("SELECT {} FROM steps WHERE id = ?1", STEP_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], StepRow::from_row)
            .optional()
            .context("Failed to query step")?;
        row.map(StepRow::into_step).transpose()
    }

    /// Steps of a run in execution order.
    pub fn list_steps(&self, run_id: i64) -> Result<Vec<Step>> {
        let sql = format!(
            "SELECT {} FROM steps WHERE run_id = ?1 ORDER BY seq",
            STEP_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_steps")?;
        let rows = stmt
            .query_map(params![run_id], StepRow::from_row)
            .context("Failed to query steps")?;
        let mut steps = Vec::new();
        for row in rows {
            let r = row.context("Failed to read step row")?;
            steps.push(r.into_step()?);
        }
        Ok(steps)
    }
}

// ── Row conversions ───────────────────────────────────────────────────

/// Intermediate row struct for workflow_runs.
struct RunRow {
    id: i64,
    work_item: String,
    plan: String,
    current_step: i64,
    status: String,
    reason: Option<String>,
    resumed_from: Option<i64>,
    cancel_requested: bool,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_heartbeat: Option<DateTime<Utc>>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            work_item: row.get(1)?,
            plan: row.get(2)?,
            current_step: row.get(3)?,
            status: row.get(4)?,
            reason: row.get(5)?,
            resumed_from: row.get(6)?,
            cancel_requested: row.get(7)?,
            created_at: row.get(8)?,
            started_at: row.get(9)?,
            finished_at: row.get(10)?,
            last_heartbeat: row.get(11)?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun> {
        let status = RunStatus::from_str(&self.status).context("Failed to parse run status")?;
        let work_item: WorkItem =
            serde_json::from_str(&self.work_item).context("Failed to parse work item JSON")?;
        let plan: ExecutionPlan =
            serde_json::from_str(&self.plan).context("Failed to parse plan JSON")?;
        Ok(WorkflowRun {
            id: self.id,
            work_item,
            plan,
            current_step: self.current_step.max(0) as usize,
            status,
            reason: self.reason,
            resumed_from: self.resumed_from,
            cancel_requested: self.cancel_requested,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            last_heartbeat: self.last_heartbeat,
        })
    }
}

/// Intermediate row struct for steps.
struct StepRow {
    id: i64,
    run_id: i64,
    seq: i64,
    plan_index: i64,
    role: String,
    status: String,
    input_summary: String,
    output_summary: Option<String>,
    escalation_reason: Option<String>,
    error_code: Option<String>,
    artifact_accepted: Option<bool>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl StepRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            seq: row.get(2)?,
            plan_index: row.get(3)?,
            role: row.get(4)?,
            status: row.get(5)?,
            input_summary: row.get(6)?,
            output_summary: row.get(7)?,
            escalation_reason: row.get(8)?,
            error_code: row.get(9)?,
            artifact_accepted: row.get(10)?,
            started_at: row.get(11)?,
            finished_at: row.get(12)?,
        })
    }

    fn into_step(self) -> Result<Step> {
        let status = StepStatus::from_str(&self.status).context("Failed to parse step status")?;
        Ok(Step {
            id: self.id,
            run_id: self.run_id,
            seq: self.seq.max(0) as u32,
            plan_index: self.plan_index.max(0) as usize,
            role: self.role,
            status,
            input_summary: self.input_summary,
            output_summary: self.output_summary,
            escalation_reason: self.escalation_reason,
            error_code: self.error_code,
            artifact_accepted: self.artifact_accepted,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use steward_common::ComplexityClass;

    pub(crate) fn sample_plan() -> ExecutionPlan {
        ExecutionPlan {
            complexity: ComplexityClass::Simple,
            workflow_type: "quick_fix".to_string(),
            roles: vec!["implementer".into(), "tester".into()],
            fallback_role: None,
            optional_roles: Vec::new(),
            max_messages: 20,
            max_cost: 1.0,
            max_tokens: 200_000,
            max_duration_secs: 1800,
        }
    }

    pub(crate) fn sample_item() -> WorkItem {
        WorkItem::new("ENG-1", "Fix login redirect").with_criteria(["redirects", "keeps session"])
    }

    #[test]
    fn test_create_and_get_run() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let run = db.create_run(&sample_item(), &sample_plan(), None)?;
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.work_item.id, "ENG-1");
        assert_eq!(run.plan.workflow_type, "quick_fix");
        assert_eq!(run.current_step, 0);
        assert!(!run.cancel_requested);
        assert!(run.started_at.is_none());

        let fetched = db.get_run(run.id)?.expect("run exists");
        assert_eq!(fetched, run);
        assert!(db.get_run(9999)?.is_none());
        Ok(())
    }

    #[test]
    fn test_transition_sets_timestamps() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let run = db.create_run(&sample_item(), &sample_plan(), None)?;

        let running = match db.transition_run(run.id, RunStatus::Running, None)? {
            Transition::Applied(r) => r,
            other => panic!("expected applied, got {:?}", other),
        };
        assert!(running.started_at.is_some());
        assert!(running.last_heartbeat.is_some());

        let done = match db.transition_run(run.id, RunStatus::TerminatedBudget, Some("over"))? {
            Transition::Applied(r) => r,
            other => panic!("expected applied, got {:?}", other),
        };
        assert_eq!(done.reason.as_deref(), Some("over"));
        assert!(done.finished_at.is_some());
        Ok(())
    }

    #[test]
    fn test_terminal_run_rejects_transition() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let run = db.create_run(&sample_item(), &sample_plan(), None)?;
        db.transition_run(run.id, RunStatus::Running, None)?;
        db.transition_run(run.id, RunStatus::Completed, None)?;

        let outcome = db.transition_run(run.id, RunStatus::TerminatedError, Some("late"))?;
        assert_eq!(
            outcome,
            Transition::Rejected {
                current: RunStatus::Completed
            }
        );
        assert_eq!(db.get_run(run.id)?.unwrap().status, RunStatus::Completed);
        Ok(())
    }

    #[test]
    fn test_trigger_blocks_direct_update_of_terminal_status() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let run = db.create_run(&sample_item(), &sample_plan(), None)?;
        db.transition_run(run.id, RunStatus::TerminatedError, Some("boom"))?;
        let result = db.conn.execute(
            "UPDATE workflow_runs SET status = 'running' WHERE id = ?1",
            params![run.id],
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_heartbeat_and_cancel_only_touch_live_runs() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let run = db.create_run(&sample_item(), &sample_plan(), None)?;
        db.transition_run(run.id, RunStatus::Running, None)?;
        assert!(db.touch_heartbeat(run.id)?);
        assert!(db.request_cancel(run.id)?);
        assert!(db.cancel_requested(run.id)?);

        db.transition_run(run.id, RunStatus::TerminatedError, Some("cancelled"))?;
        assert!(!db.touch_heartbeat(run.id)?);
        assert!(!db.request_cancel(run.id)?);
        Ok(())
    }

    #[test]
    fn test_stale_runs_reports_old_heartbeats() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let run = db.create_run(&sample_item(), &sample_plan(), None)?;
        db.transition_run(run.id, RunStatus::Running, None)?;

        let now = Utc::now();
        assert!(db.stale_runs(chrono::Duration::seconds(60), now)?.is_empty());
        let later = now + chrono::Duration::seconds(300);
        let stale = db.stale_runs(chrono::Duration::seconds(60), later)?;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, run.id);
        // Reporting never changes the run.
        assert_eq!(db.get_run(run.id)?.unwrap().status, RunStatus::Running);
        Ok(())
    }

    #[test]
    fn test_steps_get_sequential_numbers() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let run = db.create_run(&sample_item(), &sample_plan(), None)?;
        let first = db.create_step(run.id, 0, "implementer", "task")?;
        let second = db.create_step(run.id, 0, "planner", "fallback")?;
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(second.plan_index, 0);
        assert_eq!(first.status, StepStatus::Running);

        let done = db.finish_step(
            first.id,
            &StepOutcome::new(StepStatus::Escalated).escalation("needs design"),
        )?;
        assert_eq!(done.status, StepStatus::Escalated);
        assert_eq!(done.escalation_reason.as_deref(), Some("needs design"));
        assert!(done.finished_at.is_some());

        db.set_artifact_accepted(second.id, false)?;
        let steps = db.list_steps(run.id)?;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].artifact_accepted, Some(false));
        Ok(())
    }

    #[test]
    fn test_list_runs_newest_first() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let a = db.create_run(&sample_item(), &sample_plan(), None)?;
        let b = db.create_run(&sample_item(), &sample_plan(), Some(a.id))?;
        let runs = db.list_runs(10)?;
        assert_eq!(runs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![b.id, a.id]);
        assert_eq!(runs[0].resumed_from, Some(a.id));
        Ok(())
    }
}
