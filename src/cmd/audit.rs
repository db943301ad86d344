//! Read-only views: `steward status`, `steward calls`, `steward compare`.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use console::style;

use steward::audit::{self, RunView};
use steward::config::StewardConfig;
use steward::ledger::{CallQuery, CallSort, SortOrder};
use steward::orchestrator::report_stale;
use steward::util::truncate_str;

use crate::CallsArgs;

pub async fn cmd_status(
    config: &StewardConfig,
    run: Option<i64>,
    stale: bool,
    limit: usize,
    json: bool,
) -> Result<()> {
    let db = super::open_db(config)?;

    if stale {
        let runs = report_stale(&db, config.toml.stale_after()).await?;
        if json {
            return super::print_json(&runs);
        }
        if runs.is_empty() {
            println!("No stale runs.");
        }
        for run in runs {
            let seen = run.last_heartbeat.or(run.started_at).unwrap_or(run.created_at);
            println!(
                "#{:<5} {:<12} last heartbeat {}",
                run.id,
                run.work_item.id,
                seen.format("%Y-%m-%d %H:%M:%S")
            );
        }
        return Ok(());
    }

    if let Some(run_id) = run {
        let view = db
            .call(move |db| audit::run_view(db, run_id))
            .await?
            .ok_or_else(|| anyhow!("Run #{} not found", run_id))?;
        if json {
            return super::print_json(&view);
        }
        print_run(&view);
        return Ok(());
    }

    let runs = db.call(move |db| audit::recent_runs(db, limit)).await?;
    if json {
        return super::print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs yet. Start one with `steward run <item>`.");
        return Ok(());
    }
    println!();
    println!(
        "{:<6} {:<12} {:<8} {:<18} {:>6} {:>10} {:>9}",
        "Run", "Item", "Class", "Status", "Msgs", "Tokens", "Cost"
    );
    println!("{}", "-".repeat(75));
    for row in runs {
        println!(
            "{:<6} {:<12} {:<8} {:<18} {:>6} {:>10} {:>9}",
            format!("#{}", row.run.id),
            truncate_str(&row.run.work_item.id, 12),
            row.run.plan.complexity.as_str(),
            row.run.status.as_str(),
            row.totals.messages,
            row.totals.tokens,
            format!("${:.4}", row.totals.cost)
        );
    }
    println!();
    Ok(())
}

fn print_run(view: &RunView) {
    let run = &view.run;
    println!();
    println!(
        "Run #{} [{}] {}",
        run.id,
        run.work_item.id,
        style(run.status).bold()
    );
    println!("  {}", run.work_item.title);
    if let Some(source) = run.resumed_from {
        println!("  resumed from #{}", source);
    }
    if let Some(reason) = &run.reason {
        println!("  reason: {}", reason);
    }
    println!("  created  {}", run.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(started) = run.started_at {
        println!("  started  {}", started.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(finished) = run.finished_at {
        println!("  finished {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(secs) = view.elapsed_secs {
        println!("  elapsed  {}s of {}s", secs, run.plan.max_duration_secs);
    }
    println!(
        "  usage    {}/{} messages, {}/{} tokens, ${:.4}/${:.2}",
        view.totals.messages,
        run.plan.max_messages,
        view.totals.tokens,
        run.plan.max_tokens,
        view.totals.cost,
        run.plan.max_cost
    );
    if let Some(checkpoint) = &view.checkpoint {
        println!(
            "  checkpoint after step {}",
            checkpoint.last_completed_step + 1
        );
    }

    println!();
    println!(
        "  {:<4} {:<5} {:<12} {:<10} {:>5} {:>9} {:>9}  Note",
        "Seq", "Step", "Role", "Status", "Calls", "Tokens", "Cost"
    );
    for s in &view.steps {
        let note = s
            .step
            .escalation_reason
            .as_deref()
            .or(s.step.error_code.as_deref())
            .or(s.step.output_summary.as_deref())
            .unwrap_or("");
        println!(
            "  {:<4} {:<5} {:<12} {:<10} {:>5} {:>9} {:>9}  {}",
            s.step.seq,
            s.step.plan_index + 1,
            s.step.role,
            s.step.status.as_str(),
            s.calls,
            s.tokens,
            format!("${:.4}", s.cost),
            truncate_str(note, 60)
        );
    }
    println!();
}

/// Accepts RFC 3339 or a bare date (midnight UTC).
fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .with_context(|| format!("Invalid date '{}': expected RFC 3339 or YYYY-MM-DD", value))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .ok_or_else(|| anyhow!("Invalid date '{}'", value))
}

pub(crate) fn build_query(args: &CallsArgs) -> Result<CallQuery> {
    Ok(CallQuery {
        run_id: args.run,
        model: args.model.clone(),
        text: args.search.clone(),
        since: args.since.as_deref().map(parse_time).transpose()?,
        until: args.until.as_deref().map(parse_time).transpose()?,
        sort: args.sort.parse::<CallSort>().map_err(anyhow::Error::msg)?,
        order: args.order.parse::<SortOrder>().map_err(anyhow::Error::msg)?,
        page: args.page.max(1),
        per_page: args.per_page.clamp(1, 500),
    })
}

pub async fn cmd_calls(config: &StewardConfig, args: &CallsArgs, json: bool) -> Result<()> {
    let db = super::open_db(config)?;
    let query = build_query(args)?;
    let page = db.call(move |db| db.query_calls(&query)).await?;
    if json {
        return super::print_json(&page);
    }

    println!();
    println!(
        "{:<6} {:<5} {:<8} {:<10} {:>8} {:>8} {:>9}  {:<19}  Error",
        "Call", "Run", "Step", "Status", "Tokens", "Latency", "Cost", "Time"
    );
    for call in &page.items {
        println!(
            "{:<6} {:<5} {:<8} {:<10} {:>8} {:>8} {:>9}  {:<19}  {}",
            call.id,
            call.run_id,
            call.step_id.map(|s| s.to_string()).unwrap_or_default(),
            call.status.as_str(),
            call.total_tokens,
            format!("{}ms", call.latency_ms),
            format!("${:.4}", call.cost),
            call.created_at.format("%Y-%m-%d %H:%M:%S"),
            call.error_code.as_deref().unwrap_or("")
        );
    }
    println!();
    println!(
        "Page {} of {} ({} matching call(s))",
        page.page,
        page.total_pages().max(1),
        page.total
    );
    Ok(())
}

pub async fn cmd_compare(config: &StewardConfig, left: i64, right: i64, json: bool) -> Result<()> {
    let db = super::open_db(config)?;
    let (l, r) = db
        .call(move |db| Ok((audit::run_view(db, left)?, audit::run_view(db, right)?)))
        .await?;
    let l = l.ok_or_else(|| anyhow!("Run #{} not found", left))?;
    let r = r.ok_or_else(|| anyhow!("Run #{} not found", right))?;
    let cmp = audit::compare(&l, &r);
    if json {
        return super::print_json(&cmp);
    }

    println!();
    println!(
        "{:<10} {:>18} {:>18} {:>12}",
        "",
        format!("#{}", cmp.left_run),
        format!("#{}", cmp.right_run),
        "delta"
    );
    println!(
        "{:<10} {:>18} {:>18}",
        "status",
        cmp.left_status.as_str(),
        cmp.right_status.as_str()
    );
    println!(
        "{:<10} {:>18} {:>18} {:>+12}",
        "messages", cmp.left_totals.messages, cmp.right_totals.messages, cmp.delta.messages
    );
    println!(
        "{:<10} {:>18} {:>18} {:>+12}",
        "tokens", cmp.left_totals.tokens, cmp.right_totals.tokens, cmp.delta.tokens
    );
    println!(
        "{:<10} {:>18} {:>18} {:>+12.4}",
        "cost",
        format!("${:.4}", cmp.left_totals.cost),
        format!("${:.4}", cmp.right_totals.cost),
        cmp.delta.cost
    );
    println!();
    println!(
        "{:<5} {:<24} {:<24} {:>10} {:>10}",
        "Step", "Left", "Right", "Δ tokens", "Δ cost"
    );
    for step in &cmp.steps {
        let side = |s: &Option<steward::audit::StepUsage>| {
            s.as_ref()
                .map(|u| format!("{} {}", u.roles, u.status))
                .unwrap_or_else(|| "-".to_string())
        };
        println!(
            "{:<5} {:<24} {:<24} {:>+10} {:>+10.4}",
            step.plan_index + 1,
            truncate_str(&side(&step.left), 24),
            truncate_str(&side(&step.right), 24),
            step.tokens,
            step.cost
        );
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> CallsArgs {
        CallsArgs {
            run: Some(3),
            model: None,
            search: Some("login".into()),
            since: Some("2026-01-02".into()),
            until: Some("2026-01-03T12:00:00Z".into()),
            sort: "cost".into(),
            order: "asc".into(),
            page: 0,
            per_page: 10_000,
        }
    }

    #[test]
    fn test_build_query_parses_filters() {
        let query = build_query(&args()).unwrap();
        assert_eq!(query.run_id, Some(3));
        assert_eq!(query.sort, CallSort::Cost);
        assert_eq!(query.order, SortOrder::Asc);
        assert_eq!(query.page, 1);
        assert_eq!(query.per_page, 500);
        assert_eq!(
            query.since.unwrap().to_rfc3339(),
            "2026-01-02T00:00:00+00:00"
        );
    }

    #[test]
    fn test_build_query_rejects_bad_values() {
        let mut bad = args();
        bad.sort = "size".into();
        assert!(build_query(&bad).is_err());

        let mut bad = args();
        bad.since = Some("yesterday".into());
        assert!(build_query(&bad).is_err());
    }
}
