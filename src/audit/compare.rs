//! Side-by-side comparison of two runs.

use std::collections::BTreeMap;

use serde::Serialize;
use steward_common::{RunStatus, StepStatus};

use super::RunView;
use crate::ledger::LedgerTotals;

/// `right - left` for the run totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TotalsDelta {
    pub calls: i64,
    pub messages: i64,
    pub tokens: i64,
    pub cost: f64,
}

impl TotalsDelta {
    fn between(left: &LedgerTotals, right: &LedgerTotals) -> Self {
        Self {
            calls: right.calls as i64 - left.calls as i64,
            messages: right.messages as i64 - left.messages as i64,
            tokens: right.tokens as i64 - left.tokens as i64,
            cost: right.cost - left.cost,
        }
    }
}

/// Usage of one plan step in one run. Fallback attempts are folded in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepUsage {
    /// Roles that worked the step, in order ("implementer" or "implementer>planner").
    pub roles: String,
    /// Status of the last attempt.
    pub status: StepStatus,
    pub calls: u64,
    pub tokens: u64,
    pub cost: f64,
}

/// Per-plan-step comparison. A side is `None` when that run never reached the step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepDelta {
    pub plan_index: usize,
    pub left: Option<StepUsage>,
    pub right: Option<StepUsage>,
    pub tokens: i64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunComparison {
    pub left_run: i64,
    pub right_run: i64,
    pub left_status: RunStatus,
    pub right_status: RunStatus,
    pub left_totals: LedgerTotals,
    pub right_totals: LedgerTotals,
    pub delta: TotalsDelta,
    pub steps: Vec<StepDelta>,
}

pub fn compare(left: &RunView, right: &RunView) -> RunComparison {
    let left_steps = by_plan_index(left);
    let mut right_steps = by_plan_index(right);

    let mut steps = Vec::new();
    for (plan_index, l) in left_steps {
        let r = right_steps.remove(&plan_index);
        steps.push(step_delta(plan_index, Some(l), r));
    }
    for (plan_index, r) in right_steps {
        steps.push(step_delta(plan_index, None, Some(r)));
    }
    steps.sort_by_key(|s| s.plan_index);

    RunComparison {
        left_run: left.run.id,
        right_run: right.run.id,
        left_status: left.run.status,
        right_status: right.run.status,
        left_totals: left.totals,
        right_totals: right.totals,
        delta: TotalsDelta::between(&left.totals, &right.totals),
        steps,
    }
}

fn step_delta(plan_index: usize, left: Option<StepUsage>, right: Option<StepUsage>) -> StepDelta {
    let tokens = |s: &Option<StepUsage>| s.as_ref().map_or(0, |u| u.tokens as i64);
    let cost = |s: &Option<StepUsage>| s.as_ref().map_or(0.0, |u| u.cost);
    StepDelta {
        plan_index,
        tokens: tokens(&right) - tokens(&left),
        cost: cost(&right) - cost(&left),
        left,
        right,
    }
}

fn by_plan_index(view: &RunView) -> BTreeMap<usize, StepUsage> {
    let mut out: BTreeMap<usize, StepUsage> = BTreeMap::new();
    for s in &view.steps {
        out.entry(s.step.plan_index)
            .and_modify(|u| {
                u.roles = format!("{}>{}", u.roles, s.step.role);
                u.status = s.step.status;
                u.calls += s.calls;
                u.tokens += s.tokens;
                u.cost += s.cost;
            })
            .or_insert_with(|| StepUsage {
                roles: s.step.role.clone(),
                status: s.step.status,
                calls: s.calls,
                tokens: s.tokens,
                cost: s.cost,
            });
    }
    out
}
