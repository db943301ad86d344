//! Append-only model-call records.
//!
//! Rows are only ever INSERTed; triggers abort any UPDATE or DELETE. A
//! correction is a new row whose `corrects` column names the row it replaces,
//! and totals are computed over rows that no later row corrects.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params, params_from_iter};
use steward_common::{BudgetSnapshot, CallStatus, ModelCall, NewModelCall, ShrinkRecord};

use super::StewardDb;
use crate::ledger::LedgerTotals;
use crate::ledger::query::{CallQuery, Page};

const CALL_COLUMNS: &str = "id, run_id, step_id, model, prompt_tokens, completion_tokens, \
     total_tokens, max_tokens, latency_ms, cost, status, error_code, prompt_hash, response_hash, \
     prompt_preview, response_preview, messages_remaining, cost_remaining, tokens_remaining, \
     shrink_log, corrects, created_at";

/// Rows not superseded by a later correction.
const EFFECTIVE: &str = "NOT EXISTS (SELECT 1 FROM model_calls c WHERE c.corrects = model_calls.id)";

impl StewardDb {
    pub fn insert_call(&self, call: &NewModelCall) -> Result<i64> {
        let shrink_log =
            serde_json::to_string(&call.shrink_log).context("Failed to encode shrink log")?;
        self.conn
            .execute(
                "INSERT INTO model_calls (
                    run_id, step_id, model, prompt_tokens, completion_tokens, total_tokens,
                    max_tokens, latency_ms, cost, status, error_code, prompt_hash, response_hash,
                    prompt_preview, response_preview, messages_remaining, cost_remaining,
                    tokens_remaining, shrink_log, corrects, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                           ?16, ?17, ?18, ?19, ?20, ?21)",
                params![
                    call.run_id,
                    call.step_id,
                    call.model,
                    call.usage.prompt_tokens as i64,
                    call.usage.completion_tokens as i64,
                    call.usage.total() as i64,
                    call.max_tokens as i64,
                    call.latency_ms as i64,
                    call.cost,
                    call.status.as_str(),
                    call.error_code,
                    call.prompt_hash,
                    call.response_hash,
                    call.prompt_preview,
                    call.response_preview,
                    call.budget_snapshot.messages_remaining,
                    call.budget_snapshot.cost_remaining,
                    call.budget_snapshot.tokens_remaining,
                    shrink_log,
                    call.corrects,
                    Utc::now()
                ],
            )
            .context("Failed to insert model call")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_call(&self, id: i64) -> Result<Option<ModelCall>> {
        let sql = format!("SELECT {} FROM model_calls WHERE id = ?1", CALL_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], CallRow::from_row)
            .optional()
            .context("Failed to query model call")?;
        row.map(CallRow::into_call).transpose()
    }

    /// Every record of a run, corrections included, in id order.
    pub fn calls_for_run(&self, run_id: i64) -> Result<Vec<ModelCall>> {
        let sql = format!(
            "SELECT {} FROM model_calls WHERE run_id = ?1 ORDER BY id",
            CALL_COLUMNS
        );
        self.collect_calls(&sql, params![run_id])
    }

    pub fn calls_for_step(&self, step_id: i64) -> Result<Vec<ModelCall>> {
        let sql = format!(
            "SELECT {} FROM model_calls WHERE step_id = ?1 ORDER BY id",
            CALL_COLUMNS
        );
        self.collect_calls(&sql, params![step_id])
    }

    pub fn ledger_totals(&self, run_id: i64) -> Result<LedgerTotals> {
        self.totals_after(run_id, None)
    }

    /// Totals over a run's effective records with id greater than `after`.
    pub fn totals_after(&self, run_id: i64, after: Option<i64>) -> Result<LedgerTotals> {
        let sql = format!(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status != 'skipped' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(total_tokens), 0),
                    COALESCE(SUM(cost), 0.0)
             FROM model_calls
             WHERE run_id = ?1 AND id > ?2 AND {}",
            EFFECTIVE
        );
        let (calls, messages, tokens, cost): (i64, i64, i64, f64) = self
            .conn
            .query_row(&sql, params![run_id, after.unwrap_or(0)], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .context("Failed to compute ledger totals")?;
        Ok(LedgerTotals {
            calls: calls.max(0) as u64,
            messages: messages.max(0) as u64,
            tokens: tokens.max(0) as u64,
            cost,
        })
    }

    /// Records with id up to `through` that were effective at that point but
    /// have since been replaced by a newer correction.
    pub fn superseded_through(&self, run_id: i64, through: i64) -> Result<LedgerTotals> {
        let (calls, messages, tokens, cost): (i64, i64, i64, f64) = self
            .conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN status != 'skipped' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(total_tokens), 0),
                        COALESCE(SUM(cost), 0.0)
                 FROM model_calls o
                 WHERE o.run_id = ?1 AND o.id <= ?2
                   AND EXISTS (SELECT 1 FROM model_calls c WHERE c.corrects = o.id AND c.id > ?2)
                   AND NOT EXISTS (SELECT 1 FROM model_calls c WHERE c.corrects = o.id AND c.id <= ?2)",
                params![run_id, through],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .context("Failed to compute superseded totals")?;
        Ok(LedgerTotals {
            calls: calls.max(0) as u64,
            messages: messages.max(0) as u64,
            tokens: tokens.max(0) as u64,
            cost,
        })
    }

    /// Id of the newest record of a run, if any.
    pub fn last_call_id(&self, run_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT MAX(id) FROM model_calls WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .context("Failed to read last call id")
    }

    pub fn query_calls(&self, query: &CallQuery) -> Result<Page<ModelCall>> {
        let (where_clause, mut values) = query.where_clause();

        let count_sql = format!("SELECT COUNT(*) FROM model_calls {}", where_clause);
        let total: i64 = self
            .conn
            .query_row(&count_sql, params_from_iter(values.iter()), |row| row.get(0))
            .context("Failed to count model calls")?;

        let sql = format!(
            "SELECT {} FROM model_calls {} {} LIMIT ? OFFSET ?",
            CALL_COLUMNS,
            where_clause,
            query.order_clause()
        );
        values.push(rusqlite::types::Value::Integer(query.limit() as i64));
        values.push(rusqlite::types::Value::Integer(query.offset() as i64));
        let items = self.collect_calls(&sql, params_from_iter(values.iter()))?;

        Ok(Page {
            items,
            page: query.page.max(1),
            per_page: query.limit(),
            total: total.max(0) as usize,
        })
    }

    fn collect_calls<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<ModelCall>> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .context("Failed to prepare model call query")?;
        let rows = stmt
            .query_map(params, CallRow::from_row)
            .context("Failed to query model calls")?;
        let mut calls = Vec::new();
        for row in rows {
            let r = row.context("Failed to read model call row")?;
            calls.push(r.into_call()?);
        }
        Ok(calls)
    }
}

/// Intermediate row struct for model_calls.
struct CallRow {
    id: i64,
    run_id: i64,
    step_id: Option<i64>,
    model: String,
    prompt_tokens: i64,
    completion_tokens: i64,
    total_tokens: i64,
    max_tokens: i64,
    latency_ms: i64,
    cost: f64,
    status: String,
    error_code: Option<String>,
    prompt_hash: String,
    response_hash: Option<String>,
    prompt_preview: String,
    response_preview: String,
    messages_remaining: i64,
    cost_remaining: f64,
    tokens_remaining: i64,
    shrink_log: String,
    corrects: Option<i64>,
    created_at: DateTime<Utc>,
}

impl CallRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            step_id: row.get(2)?,
            model: row.get(3)?,
            prompt_tokens: row.get(4)?,
            completion_tokens: row.get(5)?,
            total_tokens: row.get(6)?,
            max_tokens: row.get(7)?,
            latency_ms: row.get(8)?,
            cost: row.get(9)?,
            status: row.get(10)?,
            error_code: row.get(11)?,
            prompt_hash: row.get(12)?,
            response_hash: row.get(13)?,
            prompt_preview: row.get(14)?,
            response_preview: row.get(15)?,
            messages_remaining: row.get(16)?,
            cost_remaining: row.get(17)?,
            tokens_remaining: row.get(18)?,
            shrink_log: row.get(19)?,
            corrects: row.get(20)?,
            created_at: row.get(21)?,
        })
    }

    fn into_call(self) -> Result<ModelCall> {
        let status = CallStatus::from_str(&self.status).context("Failed to parse call status")?;
        let shrink_log: Vec<ShrinkRecord> =
            serde_json::from_str(&self.shrink_log).context("Failed to parse shrink log JSON")?;
        Ok(ModelCall {
            id: self.id,
            run_id: self.run_id,
            step_id: self.step_id,
            model: self.model,
            prompt_tokens: self.prompt_tokens.max(0) as u64,
            completion_tokens: self.completion_tokens.max(0) as u64,
            total_tokens: self.total_tokens.max(0) as u64,
            max_tokens: self.max_tokens.max(0) as u64,
            latency_ms: self.latency_ms.max(0) as u64,
            cost: self.cost,
            status,
            error_code: self.error_code,
            prompt_hash: self.prompt_hash,
            response_hash: self.response_hash,
            prompt_preview: self.prompt_preview,
            response_preview: self.response_preview,
            budget_snapshot: BudgetSnapshot {
                messages_remaining: self.messages_remaining,
                cost_remaining: self.cost_remaining,
                tokens_remaining: self.tokens_remaining,
            },
            shrink_log,
            corrects: self.corrects,
            created_at: self.created_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::runs::tests::{sample_item, sample_plan};
    use steward_common::{ShrinkAction, Usage};

    pub(crate) fn new_call(run_id: i64, cost: f64, tokens: u64) -> NewModelCall {
        NewModelCall {
            run_id,
            step_id: None,
            model: "claude-sonnet-4-5".to_string(),
            usage: Usage::new(tokens / 2, tokens - tokens / 2),
            max_tokens: 8192,
            latency_ms: 1200,
            cost,
            status: CallStatus::Success,
            error_code: None,
            prompt_hash: "abc".to_string(),
            response_hash: Some("def".to_string()),
            prompt_preview: "implement the login fix".to_string(),
            response_preview: "done".to_string(),
            budget_snapshot: BudgetSnapshot::default(),
            shrink_log: Vec::new(),
            corrects: None,
        }
    }

    #[test]
    fn test_insert_and_get_call() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let run = db.create_run(&sample_item(), &sample_plan(), None)?;
        let mut call = new_call(run.id, 0.25, 1000);
        call.shrink_log.push(ShrinkRecord {
            section_id: "history-0".into(),
            action: ShrinkAction::Dropped,
            original_tokens: 400,
            reduced_tokens: 0,
        });
        call.budget_snapshot = BudgetSnapshot {
            messages_remaining: 19,
            cost_remaining: 0.75,
            tokens_remaining: -5,
        };
        let id = db.insert_call(&call)?;

        let stored = db.get_call(id)?.expect("call exists");
        assert_eq!(stored.total_tokens, 1000);
        assert_eq!(stored.shrink_log.len(), 1);
        assert_eq!(stored.budget_snapshot.tokens_remaining, -5);
        assert_eq!(stored.status, CallStatus::Success);
        Ok(())
    }

    #[test]
    fn test_ledger_rejects_update_and_delete() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let run = db.create_run(&sample_item(), &sample_plan(), None)?;
        let id = db.insert_call(&new_call(run.id, 0.1, 10))?;

        assert!(
            db.conn
                .execute("UPDATE model_calls SET cost = 0 WHERE id = ?1", params![id])
                .is_err()
        );
        assert!(
            db.conn
                .execute("DELETE FROM model_calls WHERE id = ?1", params![id])
                .is_err()
        );
        assert_eq!(db.get_call(id)?.unwrap().cost, 0.1);
        Ok(())
    }

    #[test]
    fn test_totals_equal_sum_of_appended_entries() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let run = db.create_run(&sample_item(), &sample_plan(), None)?;
        let entries = [(0.1, 100u64), (0.25, 2500), (0.05, 40)];
        for (cost, tokens) in entries {
            db.insert_call(&new_call(run.id, cost, tokens))?;
        }
        let mut skipped = new_call(run.id, 0.0, 0);
        skipped.status = CallStatus::Skipped;
        db.insert_call(&skipped)?;

        let totals = db.ledger_totals(run.id)?;
        assert_eq!(totals.calls, 4);
        assert_eq!(totals.messages, 3);
        assert_eq!(totals.tokens, 2640);
        assert!((totals.cost - 0.4).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_correction_supersedes_original_in_totals() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let run = db.create_run(&sample_item(), &sample_plan(), None)?;
        let original = db.insert_call(&new_call(run.id, 0.5, 1000))?;
        let mut fixed = new_call(run.id, 0.3, 800);
        fixed.corrects = Some(original);
        db.insert_call(&fixed)?;

        let totals = db.ledger_totals(run.id)?;
        assert_eq!(totals.messages, 1);
        assert_eq!(totals.tokens, 800);
        assert!((totals.cost - 0.3).abs() < 1e-9);
        // Both rows are still on record.
        assert_eq!(db.calls_for_run(run.id)?.len(), 2);
        Ok(())
    }

    #[test]
    fn test_totals_after_counts_only_newer_calls() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let run = db.create_run(&sample_item(), &sample_plan(), None)?;
        let first = db.insert_call(&new_call(run.id, 0.1, 100))?;
        db.insert_call(&new_call(run.id, 0.2, 200))?;

        let after = db.totals_after(run.id, Some(first))?;
        assert_eq!(after.messages, 1);
        assert_eq!(after.tokens, 200);
        assert_eq!(db.last_call_id(run.id)?, Some(first + 1));
        Ok(())
    }

    #[test]
    fn test_correction_after_checkpoint_withdraws_original() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let run = db.create_run(&sample_item(), &sample_plan(), None)?;
        let original = db.insert_call(&new_call(run.id, 0.5, 1_000))?;
        let checkpointed = db.insert_call(&new_call(run.id, 0.2, 200))?;

        let mut fix = new_call(run.id, 0.3, 600);
        fix.corrects = Some(original);
        db.insert_call(&fix)?;

        let added = db.totals_after(run.id, Some(checkpointed))?;
        let withdrawn = db.superseded_through(run.id, checkpointed)?;
        assert_eq!(added.calls, 1);
        assert_eq!(withdrawn.calls, 1);
        assert_eq!(withdrawn.tokens, 1_000);
        assert!((withdrawn.cost - 0.5).abs() < 1e-9);

        // Already replaced before the checkpoint: nothing to withdraw.
        assert_eq!(db.superseded_through(run.id, checkpointed + 1)?, LedgerTotals::default());
        Ok(())
    }

    #[test]
    fn test_query_calls_filters_sorts_and_pages() -> Result<()> {
        let db = StewardDb::new_in_memory()?;
        let run = db.create_run(&sample_item(), &sample_plan(), None)?;
        let other = db.create_run(&sample_item(), &sample_plan(), None)?;
        for (i, cost) in [0.3, 0.1, 0.2].into_iter().enumerate() {
            let mut call = new_call(run.id, cost, 100 * (i as u64 + 1));
            call.prompt_preview = format!("step {} review", i);
            db.insert_call(&call)?;
        }
        db.insert_call(&new_call(other.id, 9.0, 10))?;

        let page = db.query_calls(&CallQuery {
            run_id: Some(run.id),
            sort: crate::ledger::query::CallSort::Cost,
            order: crate::ledger::query::SortOrder::Asc,
            per_page: 2,
            ..CallQuery::default()
        })?;
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].cost, 0.1);
        assert_eq!(page.items[1].cost, 0.2);
        assert!(page.has_next());

        let search = db.query_calls(&CallQuery {
            text: Some("step 2".into()),
            ..CallQuery::default()
        })?;
        assert_eq!(search.total, 1);
        assert_eq!(search.items[0].cost, 0.2);

        let future = db.query_calls(&CallQuery {
            since: Some(Utc::now() + chrono::Duration::hours(1)),
            ..CallQuery::default()
        })?;
        assert_eq!(future.total, 0);
        Ok(())
    }
}
