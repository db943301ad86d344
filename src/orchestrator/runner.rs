use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use steward_common::{
    CallStatus, ComplexityClass, ExecutionPlan, NewModelCall, RunStatus, ShrinkRecord, StepStatus,
    Usage, WorkItem, WorkflowRun,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::heartbeat::{DEFAULT_HEARTBEAT_INTERVAL, Heartbeat};
use super::roles::{AgentRole, RoleRegistry};
use super::step::{BackoffPolicy, DEFAULT_MAX_RETRIES, StepAction, StepMachine};
use crate::assess::PlanTable;
use crate::budget::{BudgetCeilings, BudgetMonitor, BudgetTotals};
use crate::checkpoint::{Checkpoint, CheckpointStore, StepSummary};
use crate::context::{
    ContextGovernor, DEFAULT_CONTEXT_WINDOW, FitOutcome, GovernorSettings, SafetyBuffer, Section,
    SectionKind,
};
use crate::errors::OrchestratorError;
use crate::ledger::{UsageLedger, content_hash};
use crate::model::{CompletionRequest, ModelClient, ModelPricing};
use crate::signals::{extract_signals, strip_signals};
use crate::sink::{Artifact, ArtifactSink};
use crate::source::WorkItemSource;
use crate::store::DbHandle;
use crate::store::runs::{StepOutcome, Transition};
use crate::util::{preview, truncate_str};

/// Bytes of prompt/response text kept on a ledger record for search.
const PREVIEW_BYTES: usize = 240;

/// Runtime knobs shared by every run of one orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub model: String,
    pub context_window: usize,
    /// Default output-token cap per call; roles may lower it.
    pub max_output_tokens: u64,
    pub safety_buffer: SafetyBuffer,
    pub governor: GovernorSettings,
    pub pricing: ModelPricing,
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
    pub heartbeat_interval: Duration,
    /// Cap on the summary kept for each completed step.
    pub summary_max_chars: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-5".to_string(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            max_output_tokens: 8_192,
            safety_buffer: SafetyBuffer::default(),
            governor: GovernorSettings::default(),
            pricing: ModelPricing::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            summary_max_chars: 600,
        }
    }
}

/// Raised ceilings for a resumed run. Unset fields keep the source plan's value.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CeilingOverrides {
    pub max_messages: Option<u32>,
    pub max_cost: Option<f64>,
    pub max_tokens: Option<u64>,
    pub max_duration_secs: Option<u64>,
}

impl CeilingOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn apply(&self, plan: &mut ExecutionPlan) {
        if let Some(v) = self.max_messages {
            plan.max_messages = v;
        }
        if let Some(v) = self.max_cost {
            plan.max_cost = v;
        }
        if let Some(v) = self.max_tokens {
            plan.max_tokens = v;
        }
        if let Some(v) = self.max_duration_secs {
            plan.max_duration_secs = v;
        }
    }
}

/// Everything needed to continue a run, read without side effects.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePlan {
    pub source: WorkflowRun,
    pub checkpoint: Checkpoint,
    /// Plan index the continuation starts at.
    pub next_step: usize,
    /// Usage consumed so far: checkpoint figures plus any calls recorded after it.
    pub totals: BudgetTotals,
    /// Calls recorded after the checkpoint was written.
    pub calls_after_checkpoint: u64,
    /// Newest ledger record of the source run.
    pub last_call_id: Option<i64>,
}

/// Outcome of one run, returned by [`Orchestrator::start`] and [`Orchestrator::resume`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: i64,
    pub work_item_id: String,
    pub complexity: ComplexityClass,
    pub status: RunStatus,
    pub reason: Option<String>,
    pub resumed_from: Option<i64>,
    pub start_step: usize,
    /// Step records created by this execution, fallbacks included.
    pub steps_run: usize,
    pub totals: BudgetTotals,
}

/// State of one live run, passed explicitly through every step.
pub struct RunContext {
    pub run: WorkflowRun,
    pub monitor: BudgetMonitor,
    pub governor: ContextGovernor,
    pub cancel: CancellationToken,
    pub deadline: Instant,
    summaries: Vec<StepSummary>,
    outputs: Vec<PriorOutput>,
    last_call_id: Option<i64>,
    steps_run: usize,
}

/// Full output of a step finished in this process.
struct PriorOutput {
    plan_index: usize,
    role: String,
    kind: SectionKind,
    text: String,
}

impl RunContext {
    fn running_summary(&self) -> String {
        self.summaries
            .iter()
            .map(|s| format!("- Step {} ({}): {}", s.plan_index + 1, s.role, s.summary))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// How a run stopped.
#[derive(Debug, Clone, PartialEq)]
struct RunEnd {
    status: RunStatus,
    reason: Option<String>,
}

impl RunEnd {
    fn completed() -> Self {
        Self {
            status: RunStatus::Completed,
            reason: None,
        }
    }

    fn failed(reason: String) -> Self {
        Self {
            status: RunStatus::Failed,
            reason: Some(reason),
        }
    }

    fn budget(reason: String) -> Self {
        Self {
            status: RunStatus::TerminatedBudget,
            reason: Some(reason),
        }
    }

    fn error(reason: impl Into<String>) -> Self {
        Self {
            status: RunStatus::TerminatedError,
            reason: Some(reason.into()),
        }
    }
}

enum StepEnd {
    Advanced,
    Stop(RunEnd),
}

/// Result of handing a plan step to one role.
enum RoleOutcome {
    /// Done or skipped; the run moves to the next plan step.
    Advanced,
    Escalated(String),
    Failed { code: String, message: String },
    Stop(RunEnd),
}

/// Drives work items through their execution plans.
///
/// Each run gets its own budget monitor, context governor and cancellation
/// token; storage and the model client are shared.
#[derive(Clone)]
pub struct Orchestrator {
    db: DbHandle,
    ledger: Arc<dyn UsageLedger>,
    checkpoints: Arc<dyn CheckpointStore>,
    source: Arc<dyn WorkItemSource>,
    model: Arc<dyn ModelClient>,
    sink: Arc<dyn ArtifactSink>,
    roles: Arc<RoleRegistry>,
    plans: PlanTable,
    settings: OrchestratorSettings,
    active: Arc<Mutex<HashMap<i64, CancellationToken>>>,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        source: Arc<dyn WorkItemSource>,
        model: Arc<dyn ModelClient>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Self {
        Self {
            ledger: Arc::new(db.clone()),
            checkpoints: Arc::new(db.clone()),
            db,
            source,
            model,
            sink,
            roles: Arc::new(RoleRegistry::builtin()),
            plans: PlanTable::default(),
            settings: OrchestratorSettings::default(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_plans(mut self, plans: PlanTable) -> Self {
        self.plans = plans;
        self
    }

    pub fn with_roles(mut self, roles: RoleRegistry) -> Self {
        self.roles = Arc::new(roles);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn UsageLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn plans(&self) -> &PlanTable {
        &self.plans
    }

    /// Ids of runs executing in this process.
    pub async fn active_runs(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.active.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Fetch a work item and run it.
    pub async fn run_item(&self, item_id: &str) -> Result<RunReport, OrchestratorError> {
        let item = self.source.fetch(item_id).await?;
        self.start(item).await
    }

    /// Assess `item`, bind its plan and execute every step.
    ///
    /// Errors are returned only when no run could be created or its final
    /// status could not be stored; every other failure ends the run in a
    /// terminal status with a reason.
    pub async fn start(&self, item: WorkItem) -> Result<RunReport, OrchestratorError> {
        let assessment = self.plans.assess(&item);
        self.check_bindable(&assessment.plan)?;
        let plan = assessment.plan;

        let run = self
            .db
            .call(move |db| db.create_run(&item, &plan, None))
            .await?;
        info!(
            run_id = run.id,
            work_item = %run.work_item.id,
            complexity = %run.plan.complexity,
            workflow = %run.plan.workflow_type,
            steps = run.plan.step_count(),
            "Bound execution plan"
        );

        let ctx = self.new_context(run, BudgetTotals::default(), Vec::new(), None)?;
        self.execute(ctx, 0).await
    }

    /// Work out where `run_id` would continue from. Pure read.
    pub async fn prepare_resume(&self, run_id: i64) -> Result<ResumePlan, OrchestratorError> {
        let source = self
            .db
            .call(move |db| db.get_run(run_id))
            .await?
            .ok_or(OrchestratorError::RunNotFound { id: run_id })?;
        if !source.status.is_resumable() {
            return Err(OrchestratorError::NotResumable {
                id: run_id,
                status: source.status,
            });
        }
        if let Some(continuation) = self
            .db
            .call(move |db| db.latest_continuation(run_id))
            .await?
        {
            return Err(OrchestratorError::AlreadyResumed {
                id: run_id,
                continuation,
            });
        }
        let checkpoint = self
            .checkpoints
            .load(run_id)
            .await?
            .ok_or(OrchestratorError::NoCheckpoint { id: run_id })?;

        let ceilings = BudgetCeilings::from_plan(&source.plan);
        let mut monitor = BudgetMonitor::from_remaining(ceilings, &checkpoint.remaining, ceilings);
        let delta = self
            .ledger
            .usage_since(run_id, checkpoint.last_call_id)
            .await?;
        monitor.absorb(delta.added.into(), delta.withdrawn.into());
        let totals = monitor.totals();
        let last_call_id = self
            .db
            .call(move |db| db.last_call_id(run_id))
            .await?
            .or(checkpoint.last_call_id);

        Ok(ResumePlan {
            next_step: checkpoint.next_step(),
            totals,
            calls_after_checkpoint: delta.added.calls,
            last_call_id,
            source,
            checkpoint,
        })
    }

    /// Continue `run_id` in a new run starting after its last checkpoint.
    ///
    /// A source run that is still pending or running is superseded: it is
    /// moved to TerminatedError so only the continuation can make progress.
    pub async fn resume(
        &self,
        run_id: i64,
        overrides: CeilingOverrides,
    ) -> Result<RunReport, OrchestratorError> {
        let resume = self.prepare_resume(run_id).await?;
        let mut plan = resume.source.plan.clone();
        overrides.apply(&mut plan);
        self.check_bindable(&plan)?;

        let item = resume.source.work_item.clone();
        // Check and insert under one lock so two resumes cannot both win.
        let run = self
            .db
            .call(move |db| match db.latest_continuation(run_id)? {
                Some(continuation) => Ok(Err(continuation)),
                None => db.create_run(&item, &plan, Some(run_id)).map(Ok),
            })
            .await?
            .map_err(|continuation| OrchestratorError::AlreadyResumed {
                id: run_id,
                continuation,
            })?;
        let new_id = run.id;

        if !resume.source.status.is_terminal() {
            if let Some(token) = self.active.lock().await.get(&run_id) {
                token.cancel();
            }
            let reason = format!("superseded by resume run #{}", new_id);
            let applied = self
                .db
                .call(move |db| {
                    db.request_cancel(run_id)?;
                    db.transition_run(run_id, RunStatus::TerminatedError, Some(&reason))
                })
                .await?;
            if let Transition::Rejected { current } = applied {
                warn!(run_id, status = %current, "Source run finished before it could be superseded");
            }
        }

        let ctx = self.new_context(
            run,
            resume.totals,
            resume.checkpoint.summaries.clone(),
            resume.last_call_id,
        )?;

        // The continuation owns a checkpoint from the start, so a crash before
        // its first step still leaves it resumable.
        let mut checkpoint = resume.checkpoint.clone();
        checkpoint.run_id = new_id;
        checkpoint.remaining = ctx.monitor.remaining();
        checkpoint.last_call_id = resume.last_call_id;
        self.checkpoints.save(&checkpoint).await?;

        info!(
            run_id = new_id,
            resumed_from = run_id,
            next_step = resume.next_step,
            spent = resume.totals.cost,
            messages = resume.totals.messages,
            "Resuming run"
        );
        self.execute(ctx, resume.next_step).await
    }

    /// Ask a live run to stop at its next step boundary or call authorization.
    /// Returns false when the run is already terminal.
    pub async fn cancel(&self, run_id: i64) -> Result<bool, OrchestratorError> {
        let requested = self
            .db
            .call(move |db| {
                db.get_run(run_id)?
                    .map(|_| db.request_cancel(run_id))
                    .transpose()
            })
            .await?
            .ok_or(OrchestratorError::RunNotFound { id: run_id })?;
        if let Some(token) = self.active.lock().await.get(&run_id) {
            token.cancel();
        }
        if requested {
            info!(run_id, "Cancellation requested");
        }
        Ok(requested)
    }

    /// Refuse a plan before any run row is written for it.
    fn check_bindable(&self, plan: &ExecutionPlan) -> Result<(), OrchestratorError> {
        self.roles.check_plan(plan)?;
        let problems = plan.ceiling_problems();
        if !problems.is_empty() {
            return Err(OrchestratorError::InvalidPlan(problems.join(", ")));
        }
        Ok(())
    }

    fn new_context(
        &self,
        run: WorkflowRun,
        totals: BudgetTotals,
        summaries: Vec<StepSummary>,
        last_call_id: Option<i64>,
    ) -> Result<RunContext, OrchestratorError> {
        // Reject an unusable window before any step runs.
        self.settings
            .safety_buffer
            .limit(self.settings.context_window)?;
        let deadline = Instant::now()
            .checked_add(run.plan.max_duration())
            .ok_or_else(|| {
                OrchestratorError::InvalidPlan("max_duration_secs is too large".to_string())
            })?;
        Ok(RunContext {
            monitor: BudgetMonitor::with_totals(BudgetCeilings::from_plan(&run.plan), totals),
            governor: ContextGovernor::new(self.settings.safety_buffer, self.settings.governor),
            cancel: CancellationToken::new(),
            deadline,
            run,
            summaries,
            outputs: Vec::new(),
            last_call_id,
            steps_run: 0,
        })
    }

    async fn execute(
        &self,
        mut ctx: RunContext,
        start: usize,
    ) -> Result<RunReport, OrchestratorError> {
        let run_id = ctx.run.id;
        match self
            .db
            .call(move |db| db.transition_run(run_id, RunStatus::Running, None))
            .await?
        {
            Transition::Applied(run) => ctx.run = run,
            Transition::Rejected { current } => {
                return Err(OrchestratorError::InvalidTransition {
                    id: run_id,
                    from: current,
                    to: RunStatus::Running,
                });
            }
        }

        self.active.lock().await.insert(run_id, ctx.cancel.clone());
        let heartbeat = Heartbeat::spawn(
            self.db.clone(),
            run_id,
            self.settings.heartbeat_interval,
            ctx.cancel.clone(),
        );

        let span = info_span!("run", run_id, work_item = %ctx.run.work_item.id);
        let end = self.drive(&mut ctx, start).instrument(span).await;

        heartbeat.stop().await;
        self.active.lock().await.remove(&run_id);

        let reason = end.reason.clone();
        let applied = self
            .db
            .call(move |db| db.transition_run(run_id, end.status, reason.as_deref()))
            .await?;
        let run = match applied {
            Transition::Applied(run) => run,
            Transition::Rejected { current } => {
                warn!(run_id, status = %current, "Run was finished elsewhere; keeping stored status");
                self.db
                    .call(move |db| db.get_run(run_id))
                    .await?
                    .ok_or(OrchestratorError::RunNotFound { id: run_id })?
            }
        };

        let totals = ctx.monitor.totals();
        info!(
            run_id,
            status = %run.status,
            reason = run.reason.as_deref().unwrap_or(""),
            messages = totals.messages,
            tokens = totals.tokens,
            cost = totals.cost,
            "Run finished"
        );
        Ok(RunReport {
            run_id,
            work_item_id: run.work_item.id.clone(),
            complexity: run.plan.complexity,
            status: run.status,
            reason: run.reason.clone(),
            resumed_from: run.resumed_from,
            start_step: start,
            steps_run: ctx.steps_run,
            totals,
        })
    }

    async fn drive(&self, ctx: &mut RunContext, start: usize) -> RunEnd {
        let steps = ctx.run.plan.step_count();
        debug!(start, steps, "Driving plan");
        for index in start..steps {
            if let Some(end) = self.preflight(ctx) {
                return end;
            }
            let role_id = ctx.run.plan.roles[index].clone();
            match self.run_plan_step(ctx, index, &role_id).await {
                Ok(StepEnd::Advanced) => {}
                Ok(StepEnd::Stop(end)) => return end,
                Err(e) => {
                    error!(step = index + 1, role = %role_id, error = %e, "Step aborted");
                    return RunEnd::error(format!("step {} ({}): {}", index + 1, role_id, e));
                }
            }
        }
        RunEnd::completed()
    }

    /// Checks made before a step or a fallback begins.
    fn preflight(&self, ctx: &RunContext) -> Option<RunEnd> {
        if ctx.cancel.is_cancelled() {
            return Some(RunEnd::error("cancelled"));
        }
        if ctx.monitor.should_terminate() {
            return Some(RunEnd::budget(ctx.monitor.describe(ctx.monitor.status())));
        }
        if Instant::now() >= ctx.deadline {
            return Some(RunEnd::error(timeout_reason(&ctx.run.plan)));
        }
        None
    }

    async fn run_plan_step(
        &self,
        ctx: &mut RunContext,
        index: usize,
        role_id: &str,
    ) -> Result<StepEnd, OrchestratorError> {
        let run_id = ctx.run.id;
        self.db
            .call(move |db| db.set_current_step(run_id, index))
            .await?;

        let (reason, code) = match self.attempt_role(ctx, index, role_id, None).await? {
            RoleOutcome::Advanced => return Ok(StepEnd::Advanced),
            RoleOutcome::Stop(end) => return Ok(StepEnd::Stop(end)),
            RoleOutcome::Escalated(reason) => (reason, None),
            RoleOutcome::Failed { code, message } => (message, Some(code)),
        };

        let Some(fallback) = ctx.run.plan.fallback_for(role_id).map(str::to_string) else {
            return Ok(StepEnd::Stop(match code {
                None => RunEnd::failed(format!(
                    "step {} ({}) escalated: {}",
                    index + 1,
                    role_id,
                    reason
                )),
                Some(code) => RunEnd::error(format!(
                    "step {} ({}) failed with {}: {}",
                    index + 1,
                    role_id,
                    code,
                    reason
                )),
            }));
        };
        if let Some(end) = self.preflight(ctx) {
            return Ok(StepEnd::Stop(end));
        }

        info!(step = index + 1, role = role_id, fallback = %fallback, reason = %reason, "Handing step to fallback role");
        let handoff = format!("The {} role could not complete this step: {}", role_id, reason);
        let end = match self.attempt_role(ctx, index, &fallback, Some(handoff)).await? {
            RoleOutcome::Advanced => return Ok(StepEnd::Advanced),
            RoleOutcome::Stop(end) => end,
            RoleOutcome::Escalated(fallback_reason) => RunEnd::failed(format!(
                "step {} ({}) escalated: {}; fallback {} escalated: {}",
                index + 1,
                role_id,
                reason,
                fallback,
                fallback_reason
            )),
            RoleOutcome::Failed { code, message } => RunEnd::error(format!(
                "step {} ({}) escalated: {}; fallback {} failed with {}: {}",
                index + 1,
                role_id,
                reason,
                fallback,
                code,
                message
            )),
        };
        Ok(StepEnd::Stop(end))
    }

    /// One role's attempt at plan step `index`, retries included.
    async fn attempt_role(
        &self,
        ctx: &mut RunContext,
        index: usize,
        role_id: &str,
        handoff: Option<String>,
    ) -> Result<RoleOutcome, OrchestratorError> {
        let role = self.roles.resolve(role_id)?;
        let run_id = ctx.run.id;
        let input_summary = match &handoff {
            Some(h) => format!("fallback: {}", truncate_str(h, 200)),
            None => format!(
                "{}: {}",
                ctx.run.work_item.id,
                truncate_str(&ctx.run.work_item.title, 120)
            ),
        };
        let role_name = role_id.to_string();
        let step = self
            .db
            .call(move |db| db.create_step(run_id, index, &role_name, &input_summary))
            .await?;
        ctx.steps_run += 1;
        let step_id = step.id;
        debug!(step = index + 1, seq = step.seq, role = role_id, "Step started");

        let sections = build_sections(ctx, role.as_ref(), handoff.as_deref());
        let prompt_preview = preview(&render_work_item(&ctx.run.work_item), PREVIEW_BYTES);
        let (prompt, estimated_tokens, shrink_log) = match ctx
            .governor
            .fit(sections, self.settings.context_window)?
        {
            FitOutcome::Fitted {
                prompt,
                estimated_tokens,
                shrink_log,
            } => {
                if !shrink_log.is_empty() {
                    debug!(
                        step = index + 1,
                        actions = shrink_log.len(),
                        estimated_tokens,
                        "Prompt shrunk to fit"
                    );
                }
                (prompt, estimated_tokens, shrink_log)
            }
            FitOutcome::Skipped {
                shrink_log, reason, ..
            } => {
                return self
                    .skip_unfit(ctx, step_id, index, role_id, prompt_preview, shrink_log, reason)
                    .await;
            }
        };

        let max_tokens = role.max_output_tokens(self.settings.max_output_tokens);
        let estimate = self
            .settings
            .pricing
            .estimate(estimated_tokens as u64, max_tokens);
        let mut machine = StepMachine::new(self.settings.max_retries, self.settings.backoff);

        loop {
            if ctx.cancel.is_cancelled() {
                self.finish_step(step_id, StepOutcome::new(StepStatus::Failed).error("CANCELLED"))
                    .await?;
                return Ok(RoleOutcome::Stop(RunEnd::error("cancelled")));
            }
            let verdict = ctx.monitor.would_exceed(&estimate);
            if verdict.is_exceeded() {
                let reason = ctx.monitor.describe_rejection(verdict, &estimate);
                warn!(step = index + 1, role = role_id, %reason, "Call not authorized");
                self.finish_step(step_id, StepOutcome::new(StepStatus::Failed).error("BUDGET"))
                    .await?;
                return Ok(RoleOutcome::Stop(RunEnd::budget(reason)));
            }

            let snapshot = ctx.monitor.remaining();
            let attempt = machine.begin_attempt();
            let request = CompletionRequest {
                model: self.settings.model.clone(),
                prompt: prompt.clone(),
                max_tokens,
            };
            debug!(step = index + 1, role = role_id, attempt, estimated_tokens, "Calling model");

            let result =
                match tokio::time::timeout_at(ctx.deadline, self.model.complete(&request)).await {
                    Ok(result) => result,
                    Err(_) => {
                        // The aborted call never completed, so nothing is recorded for it.
                        warn!(step = index + 1, role = role_id, "Run deadline hit during a model call");
                        self.finish_step(
                            step_id,
                            StepOutcome::new(StepStatus::Failed).error("RUN_TIMEOUT"),
                        )
                        .await?;
                        return Ok(RoleOutcome::Stop(RunEnd::error(timeout_reason(
                            &ctx.run.plan,
                        ))));
                    }
                };

            let mut record = NewModelCall {
                run_id,
                step_id: Some(step_id),
                model: request.model.clone(),
                usage: Usage::default(),
                max_tokens,
                latency_ms: 0,
                cost: 0.0,
                status: CallStatus::Success,
                error_code: None,
                prompt_hash: content_hash(&prompt),
                response_hash: None,
                prompt_preview: prompt_preview.clone(),
                response_preview: String::new(),
                budget_snapshot: snapshot,
                shrink_log: shrink_log.clone(),
                corrects: None,
            };

            match result {
                Ok(completion) => {
                    let cost = self.settings.pricing.resolve_cost(&completion);
                    record.usage = completion.usage;
                    record.latency_ms = completion.latency.as_millis() as u64;
                    record.cost = cost;
                    record.status = if completion.truncated {
                        CallStatus::Truncated
                    } else {
                        CallStatus::Success
                    };
                    record.response_hash = Some(content_hash(&completion.text));
                    record.response_preview = preview(&completion.text, PREVIEW_BYTES);
                    self.append_call(ctx, step_id, record).await?;
                    let budget = ctx.monitor.record(cost, completion.usage.total());
                    debug!(
                        step = index + 1,
                        tokens = completion.usage.total(),
                        cost,
                        budget = %budget,
                        "Model call recorded"
                    );

                    let signals = extract_signals(&completion.text);
                    if let Some(reason) = signals.escalation_reason() {
                        machine.on_output(true);
                        info!(step = index + 1, role = role_id, %reason, "Agent escalated");
                        self.finish_step(
                            step_id,
                            StepOutcome::new(machine.status).escalation(reason.clone()),
                        )
                        .await?;
                        if ctx.monitor.should_terminate() {
                            return Ok(RoleOutcome::Stop(self.budget_end(ctx)));
                        }
                        return Ok(RoleOutcome::Escalated(reason));
                    }

                    machine.on_output(false);
                    let output = strip_signals(&completion.text);
                    let summary = truncate_str(
                        &signals
                            .summary
                            .unwrap_or_else(|| preview(&output, self.settings.summary_max_chars)),
                        self.settings.summary_max_chars,
                    );
                    self.offer_artifact(ctx, step_id, step.seq, role_id, &output)
                        .await;
                    ctx.outputs.push(PriorOutput {
                        plan_index: index,
                        role: role_id.to_string(),
                        kind: role.output_kind(),
                        text: output,
                    });
                    self.complete_step(
                        ctx,
                        step_id,
                        index,
                        role_id,
                        StepOutcome::new(machine.status).output(summary.clone()),
                        summary,
                    )
                    .await?;
                    info!(step = index + 1, role = role_id, attempt, "Step done");

                    if ctx.monitor.should_terminate() {
                        return Ok(RoleOutcome::Stop(self.budget_end(ctx)));
                    }
                    return Ok(RoleOutcome::Advanced);
                }
                Err(err) => {
                    record.status = CallStatus::Failed;
                    record.error_code = Some(err.code().to_string());
                    record.response_preview = preview(&err.to_string(), PREVIEW_BYTES);
                    self.append_call(ctx, step_id, record).await?;
                    // A failed call still counts as a message.
                    ctx.monitor.record(0.0, 0);
                    warn!(step = index + 1, role = role_id, attempt, error = %err, "Model call failed");

                    if ctx.monitor.should_terminate() {
                        self.finish_step(
                            step_id,
                            StepOutcome::new(StepStatus::Failed).error(err.code()),
                        )
                        .await?;
                        return Ok(RoleOutcome::Stop(self.budget_end(ctx)));
                    }

                    match machine.on_transport_error(err) {
                        StepAction::Retry { after } => {
                            debug!(step = index + 1, delay_ms = after.as_millis() as u64, "Retrying after backoff");
                            tokio::select! {
                                _ = tokio::time::sleep(after) => {}
                                _ = ctx.cancel.cancelled() => {}
                            }
                        }
                        StepAction::GiveUp(err) => {
                            warn!(
                                step = index + 1,
                                role = role_id,
                                code = err.code(),
                                retries = machine.retries_used(),
                                "Giving up on step after transport errors"
                            );
                            self.finish_step(
                                step_id,
                                StepOutcome::new(machine.status).error(err.code()),
                            )
                            .await?;
                            return Ok(RoleOutcome::Failed {
                                code: err.code().to_string(),
                                message: format!(
                                    "{} (after {} attempts)",
                                    err,
                                    machine.attempt
                                ),
                            });
                        }
                    }
                }
            }
        }
    }

    /// The prompt could not be fitted: record a skipped call, then skip the
    /// step for an optional role or escalate for a required one.
    #[allow(clippy::too_many_arguments)]
    async fn skip_unfit(
        &self,
        ctx: &mut RunContext,
        step_id: i64,
        index: usize,
        role_id: &str,
        prompt_preview: String,
        shrink_log: Vec<ShrinkRecord>,
        reason: String,
    ) -> Result<RoleOutcome, OrchestratorError> {
        let record = NewModelCall {
            run_id: ctx.run.id,
            step_id: Some(step_id),
            model: self.settings.model.clone(),
            usage: Usage::default(),
            max_tokens: 0,
            latency_ms: 0,
            cost: 0.0,
            status: CallStatus::Skipped,
            error_code: Some("CONTEXT_OVERFLOW".to_string()),
            prompt_hash: content_hash(""),
            response_hash: None,
            prompt_preview,
            response_preview: preview(&reason, PREVIEW_BYTES),
            budget_snapshot: ctx.monitor.remaining(),
            shrink_log,
            corrects: None,
        };
        self.append_call(ctx, step_id, record).await?;

        if ctx.run.plan.is_optional(role_id) {
            info!(step = index + 1, role = role_id, %reason, "Optional step skipped");
            let mut machine = StepMachine::default();
            machine.skip();
            let summary = format!("skipped: {}", reason);
            self.complete_step(
                ctx,
                step_id,
                index,
                role_id,
                StepOutcome::new(machine.status).output(summary.clone()),
                summary,
            )
            .await?;
            return Ok(RoleOutcome::Advanced);
        }

        let reason = format!("context does not fit: {}", reason);
        warn!(step = index + 1, role = role_id, %reason, "Required step cannot be fitted");
        self.finish_step(
            step_id,
            StepOutcome::new(StepStatus::Escalated).escalation(reason.clone()),
        )
        .await?;
        Ok(RoleOutcome::Escalated(reason))
    }

    /// Write the checkpoint for a finished step, then close the step record.
    async fn complete_step(
        &self,
        ctx: &mut RunContext,
        step_id: i64,
        index: usize,
        role_id: &str,
        outcome: StepOutcome,
        summary: String,
    ) -> Result<(), OrchestratorError> {
        let mut checkpoint = Checkpoint::new(ctx.run.id, index, ctx.monitor.remaining());
        checkpoint.last_call_id = ctx.last_call_id;
        checkpoint.summaries = std::mem::take(&mut ctx.summaries);
        checkpoint.push_summary(index, role_id, summary);
        ctx.summaries = checkpoint.summaries.clone();
        checkpoint.running_summary = ctx.running_summary();

        if let Err(e) = self.checkpoints.save(&checkpoint).await {
            error!(step = index + 1, error = %e, "Checkpoint write failed");
            self.finish_step(
                step_id,
                StepOutcome::new(StepStatus::Failed).error("CHECKPOINT_WRITE"),
            )
            .await?;
            return Err(e.into());
        }
        self.finish_step(step_id, outcome).await?;
        Ok(())
    }

    async fn append_call(
        &self,
        ctx: &mut RunContext,
        step_id: i64,
        record: NewModelCall,
    ) -> Result<i64, OrchestratorError> {
        match self.ledger.append(record).await {
            Ok(id) => {
                ctx.last_call_id = Some(id);
                Ok(id)
            }
            Err(e) => {
                error!(step_id, error = %e, "Ledger write failed");
                self.finish_step(
                    step_id,
                    StepOutcome::new(StepStatus::Failed).error("LEDGER_WRITE"),
                )
                .await?;
                Err(OrchestratorError::Ledger(e))
            }
        }
    }

    async fn finish_step(
        &self,
        step_id: i64,
        outcome: StepOutcome,
    ) -> Result<(), OrchestratorError> {
        self.db
            .call(move |db| db.finish_step(step_id, &outcome))
            .await?;
        Ok(())
    }

    /// Offer step output to the sink. Failure is recorded, never fatal.
    async fn offer_artifact(
        &self,
        ctx: &RunContext,
        step_id: i64,
        seq: u32,
        role_id: &str,
        output: &str,
    ) {
        let artifact = Artifact {
            run_id: ctx.run.id,
            step_seq: seq,
            role: role_id.to_string(),
            work_item_id: ctx.run.work_item.id.clone(),
            content: output.to_string(),
        };
        let accepted = match self.sink.submit(&artifact).await {
            Ok(receipt) => {
                debug!(step_id, location = %receipt.location, "Artifact accepted");
                true
            }
            Err(e) => {
                warn!(step_id, error = %e, "Artifact sink rejected step output");
                false
            }
        };
        if let Err(e) = self
            .db
            .call(move |db| db.set_artifact_accepted(step_id, accepted))
            .await
        {
            warn!(step_id, error = %e, "Failed to record artifact outcome");
        }
    }

    fn budget_end(&self, ctx: &RunContext) -> RunEnd {
        RunEnd::budget(ctx.monitor.describe(ctx.monitor.status()))
    }
}

fn timeout_reason(plan: &ExecutionPlan) -> String {
    format!(
        "timed out: run exceeded its max duration of {}s",
        plan.max_duration_secs
    )
}

fn render_work_item(item: &WorkItem) -> String {
    let mut out = format!("{}: {}\n", item.id, item.title);
    let description = item.description.trim();
    if !description.is_empty() {
        out.push('\n');
        out.push_str(description);
        out.push('\n');
    }
    if !item.acceptance_criteria.is_empty() {
        out.push_str("\nAcceptance criteria:\n");
        for (i, criterion) in item.acceptance_criteria.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, criterion));
        }
    }
    out
}

/// Prompt sections for one role: instructions, the work item, the running
/// summary, then prior outputs oldest first and any fallback handoff.
fn build_sections(ctx: &RunContext, role: &dyn AgentRole, handoff: Option<&str>) -> Vec<Section> {
    let mut sections = vec![
        Section::system(role.instructions()),
        Section::task(render_work_item(&ctx.run.work_item)),
        Section::summary(ctx.running_summary()),
    ];
    for output in &ctx.outputs {
        let id = format!("step-{}-{}", output.plan_index + 1, output.role);
        let title = format!("Step {} output ({})", output.plan_index + 1, output.role);
        sections.push(Section::new(output.kind, id, title, output.text.clone()));
    }
    if let Some(handoff) = handoff {
        sections.push(Section::history("handoff", "Escalation", handoff));
    }
    sections
}
