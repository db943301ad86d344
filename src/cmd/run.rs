//! Run execution: `steward run`, `steward resume` and `steward cancel`.

use std::sync::Arc;

use anyhow::Result;
use console::style;
use steward_common::RunStatus;
use tracing::warn;

use steward::config::StewardConfig;
use steward::model::ClaudeCliClient;
use steward::orchestrator::{CeilingOverrides, Orchestrator, RoleRegistry, RunReport};
use steward::sink::DirectorySink;
use steward::source::FileWorkItemSource;

fn build_orchestrator(config: &StewardConfig) -> Result<Orchestrator> {
    let db = super::open_db(config)?;
    let settings = config.toml.orchestrator_settings()?;
    let plans = config.toml.plan_table();
    let problems = plans.validate(&RoleRegistry::builtin().ids());
    if !problems.is_empty() {
        anyhow::bail!(
            "Invalid [plans] in steward.toml:\n  - {}",
            problems.join("\n  - ")
        );
    }
    let model = ClaudeCliClient::new(
        config.toml.claude_cmd(),
        config.project_dir.clone(),
        config.toml.call_timeout(),
    );
    Ok(Orchestrator::new(
        db,
        Arc::new(FileWorkItemSource::new(config.items_dir())),
        Arc::new(model),
        Arc::new(DirectorySink::new(config.artifacts_dir())),
    )
    .with_plans(plans)
    .with_settings(settings))
}

/// Ctrl-C asks every live run to stop at its next step boundary.
fn cancel_on_ctrl_c(orchestrator: &Orchestrator) {
    let orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("Interrupt received; stopping after the current call...");
        for run_id in orchestrator.active_runs().await {
            if let Err(e) = orchestrator.cancel(run_id).await {
                warn!(run_id, error = %e, "Failed to cancel run");
            }
        }
    });
}

pub async fn cmd_run(config: &StewardConfig, item_id: &str, json: bool) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    cancel_on_ctrl_c(&orchestrator);
    let report = orchestrator.run_item(item_id).await?;
    finish(report, json)
}

pub async fn cmd_resume(
    config: &StewardConfig,
    run_id: i64,
    overrides: CeilingOverrides,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    if dry_run {
        let plan = orchestrator.prepare_resume(run_id).await?;
        if json {
            return super::print_json(&serde_json::json!({
                "run_id": run_id,
                "status": plan.source.status,
                "next_step": plan.next_step,
                "steps": plan.source.plan.step_count(),
                "totals": plan.totals,
                "calls_after_checkpoint": plan.calls_after_checkpoint,
            }));
        }
        println!();
        println!(
            "Run #{} ({}) would continue at step {} of {}",
            run_id,
            plan.source.status,
            plan.next_step + 1,
            plan.source.plan.step_count()
        );
        println!(
            "  spent so far: {} messages, {} tokens, ${:.4}",
            plan.totals.messages, plan.totals.tokens, plan.totals.cost
        );
        if plan.calls_after_checkpoint > 0 {
            println!(
                "  {} call(s) recorded after the checkpoint are counted, not replayed",
                plan.calls_after_checkpoint
            );
        }
        if !plan.checkpoint.running_summary.is_empty() {
            println!();
            println!("{}", plan.checkpoint.running_summary);
        }
        println!();
        return Ok(());
    }

    cancel_on_ctrl_c(&orchestrator);
    let report = orchestrator.resume(run_id, overrides).await?;
    finish(report, json)
}

pub async fn cmd_cancel(config: &StewardConfig, run_id: i64) -> Result<()> {
    let orchestrator = build_orchestrator(config)?;
    if orchestrator.cancel(run_id).await? {
        println!(
            "Cancellation requested for run #{}; it stops at its next step boundary.",
            run_id
        );
    } else {
        println!("Run #{} has already finished.", run_id);
    }
    Ok(())
}

fn finish(report: RunReport, json: bool) -> Result<()> {
    if json {
        super::print_json(&report)?;
    } else {
        print_report(&report);
    }
    if report.status != RunStatus::Completed {
        anyhow::bail!(
            "Run #{} ended {}: {}",
            report.run_id,
            report.status,
            report.reason.as_deref().unwrap_or("no reason recorded")
        );
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    let status = match report.status {
        RunStatus::Completed => style(report.status).green(),
        RunStatus::TerminatedBudget => style(report.status).yellow(),
        _ => style(report.status).red(),
    };
    println!();
    println!(
        "Run #{} [{}] {} ({})",
        report.run_id, report.work_item_id, status, report.complexity
    );
    if let Some(source) = report.resumed_from {
        println!(
            "  resumed from #{} at step {}",
            source,
            report.start_step + 1
        );
    }
    if let Some(reason) = &report.reason {
        println!("  reason: {}", reason);
    }
    println!(
        "  {} step(s), {} messages, {} tokens, ${:.4}",
        report.steps_run, report.totals.messages, report.totals.tokens, report.totals.cost
    );
    if report.status.is_resumable() {
        println!();
        println!(
            "  Resume with `steward resume {}` (raise a ceiling with --max-cost etc.)",
            report.run_id
        );
    }
    println!();
}
