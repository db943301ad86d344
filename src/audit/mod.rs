//! Read-only audit projections over runs, steps and the usage ledger.
//!
//! Nothing here writes: every view is assembled from stored records so the
//! CLI (or any other consumer) can inspect runs without touching the ledger.

use std::collections::HashSet;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use steward_common::{ModelCall, Step, WorkflowRun};

use crate::checkpoint::Checkpoint;
use crate::ledger::LedgerTotals;
use crate::store::StewardDb;

pub mod compare;

pub use compare::{RunComparison, StepDelta, StepUsage, TotalsDelta, compare};

/// One step with the usage of its effective ledger records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepView {
    pub step: Step,
    pub calls: u64,
    pub tokens: u64,
    pub cost: f64,
}

/// A run with its steps, totals and checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunView {
    pub run: WorkflowRun,
    pub steps: Vec<StepView>,
    pub totals: LedgerTotals,
    pub checkpoint: Option<Checkpoint>,
    pub elapsed_secs: Option<i64>,
}

/// Row of a run listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run: WorkflowRun,
    pub totals: LedgerTotals,
}

pub fn run_view(db: &StewardDb, run_id: i64) -> Result<Option<RunView>> {
    let Some(run) = db.get_run(run_id)? else {
        return Ok(None);
    };
    let calls = effective_calls(db.calls_for_run(run_id)?);
    let steps = db
        .list_steps(run_id)?
        .into_iter()
        .map(|step| {
            let mut view = StepView {
                step,
                calls: 0,
                tokens: 0,
                cost: 0.0,
            };
            for call in calls.iter().filter(|c| c.step_id == Some(view.step.id)) {
                view.calls += 1;
                view.tokens += call.total_tokens;
                view.cost += call.cost;
            }
            view
        })
        .collect();

    Ok(Some(RunView {
        totals: db.ledger_totals(run_id)?,
        checkpoint: db.get_checkpoint(run_id)?,
        elapsed_secs: run.elapsed(Utc::now()).map(|d| d.num_seconds()),
        steps,
        run,
    }))
}

/// Most recent runs first, each with its ledger totals.
pub fn recent_runs(db: &StewardDb, limit: usize) -> Result<Vec<RunSummary>> {
    db.list_runs(limit)?
        .into_iter()
        .map(|run| {
            let totals = db.ledger_totals(run.id)?;
            Ok(RunSummary { run, totals })
        })
        .collect()
}

/// Drop records that a later correction supersedes.
fn effective_calls(calls: Vec<ModelCall>) -> Vec<ModelCall> {
    let superseded: HashSet<i64> = calls.iter().filter_map(|c| c.corrects).collect();
    calls
        .into_iter()
        .filter(|c| !superseded.contains(&c.id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ledger::tests::new_call;
    use crate::store::runs::StepOutcome;
    use crate::store::runs::tests::{sample_item, sample_plan};
    use steward_common::{RunStatus, StepStatus};

    fn seeded() -> (StewardDb, i64) {
        let db = StewardDb::new_in_memory().unwrap();
        let run = db.create_run(&sample_item(), &sample_plan(), None).unwrap();
        db.transition_run(run.id, RunStatus::Running, None).unwrap();
        let step = db.create_step(run.id, 0, "implementer", "ENG-1").unwrap();
        let mut call = new_call(run.id, 0.25, 1_200);
        call.step_id = Some(step.id);
        db.insert_call(&call).unwrap();
        db.insert_call(&call).unwrap();
        db.finish_step(step.id, &StepOutcome::new(StepStatus::Done).output("patched"))
            .unwrap();
        (db, run.id)
    }

    #[test]
    fn test_run_view_aggregates_per_step() {
        let (db, run_id) = seeded();
        let view = run_view(&db, run_id).unwrap().unwrap();
        assert_eq!(view.run.status, RunStatus::Running);
        assert_eq!(view.steps.len(), 1);
        assert_eq!(view.steps[0].calls, 2);
        assert_eq!(view.steps[0].tokens, view.totals.tokens);
        assert!((view.steps[0].cost - view.totals.cost).abs() < 1e-9);
        assert!(view.checkpoint.is_none());
        assert!(view.elapsed_secs.is_some());
    }

    #[test]
    fn test_run_view_missing_run() {
        let db = StewardDb::new_in_memory().unwrap();
        assert!(run_view(&db, 7).unwrap().is_none());
    }

    #[test]
    fn test_corrected_calls_are_not_double_counted() {
        let (db, run_id) = seeded();
        let calls = db.calls_for_run(run_id).unwrap();
        let mut fix = new_call(run_id, 0.1, 600);
        fix.step_id = calls[0].step_id;
        fix.corrects = Some(calls[0].id);
        db.insert_call(&fix).unwrap();

        let view = run_view(&db, run_id).unwrap().unwrap();
        assert_eq!(view.steps[0].calls, 2);
        assert_eq!(view.totals.calls, 2);
        assert_eq!(view.steps[0].tokens, 1_800);
        assert!((view.totals.cost - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_recent_runs_newest_first() {
        let (db, first) = seeded();
        let second = db.create_run(&sample_item(), &sample_plan(), None).unwrap();
        let runs = recent_runs(&db, 10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run.id, second.id);
        assert_eq!(runs[0].totals, LedgerTotals::default());
        assert_eq!(runs[1].run.id, first);
        assert_eq!(runs[1].totals.calls, 2);
    }
}
