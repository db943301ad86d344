//! One overwrite-in-place checkpoint row per run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use steward_common::BudgetSnapshot;

use super::StewardDb;
use crate::checkpoint::{Checkpoint, StepSummary};

impl StewardDb {
    /// Insert or overwrite the checkpoint for `checkpoint.run_id`.
    ///
    /// Only pending or running runs accept a write; returns false when the run
    /// is already terminal (or missing) and nothing was stored.
    pub fn upsert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<bool> {
        let summaries = serde_json::to_string(&checkpoint.summaries)
            .context("Failed to encode step summaries")?;
        let changed = self
            .conn
            .execute(
                "INSERT INTO checkpoints (
                    run_id, last_completed_step, last_call_id, summaries, running_summary,
                    messages_remaining, cost_remaining, tokens_remaining, updated_at
                 )
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
                 WHERE EXISTS (
                    SELECT 1 FROM workflow_runs
                    WHERE id = ?1 AND status IN ('pending', 'running')
                 )
                 ON CONFLICT(run_id) DO UPDATE SET
                    last_completed_step = excluded.last_completed_step,
                    last_call_id = excluded.last_call_id,
                    summaries = excluded.summaries,
                    running_summary = excluded.running_summary,
                    messages_remaining = excluded.messages_remaining,
                    cost_remaining = excluded.cost_remaining,
                    tokens_remaining = excluded.tokens_remaining,
                    updated_at = excluded.updated_at",
                params![
                    checkpoint.run_id,
                    checkpoint.last_completed_step as i64,
                    checkpoint.last_call_id,
                    summaries,
                    checkpoint.running_summary,
                    checkpoint.remaining.messages_remaining,
                    checkpoint.remaining.cost_remaining,
                    checkpoint.remaining.tokens_remaining,
                    checkpoint.updated_at
                ],
            )
            .context("Failed to upsert checkpoint")?;
        Ok(changed > 0)
    }

    pub fn get_checkpoint(&self, run_id: i64) -> Result<Option<Checkpoint>> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, last_completed_step, last_call_id, summaries, running_summary,
                        messages_remaining, cost_remaining, tokens_remaining, updated_at
                 FROM checkpoints WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(CheckpointRow {
                        run_id: row.get(0)?,
                        last_completed_step: row.get(1)?,
                        last_call_id: row.get(2)?,
                        summaries: row.get(3)?,
                        running_summary: row.get(4)?,
                        messages_remaining: row.get(5)?,
                        cost_remaining: row.get(6)?,
                        tokens_remaining: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                },
            )
            .optional()
            .context("Failed to query checkpoint")?;
        row.map(CheckpointRow::into_checkpoint).transpose()
    }
}

/// Intermediate row struct for checkpoints.
struct CheckpointRow {
    run_id: i64,
    last_completed_step: i64,
    last_call_id: Option<i64>,
    summaries: String,
    running_summary: String,
    messages_remaining: i64,
    cost_remaining: f64,
    tokens_remaining: i64,
    updated_at: DateTime<Utc>,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> Result<Checkpoint> {
        let summaries: Vec<StepSummary> = serde_json::from_str(&self.summaries)
            .context("Failed to parse step summaries JSON")?;
        Ok(Checkpoint {
            run_id: self.run_id,
            last_completed_step: self.last_completed_step.max(0) as usize,
            last_call_id: self.last_call_id,
            summaries,
            running_summary: self.running_summary,
            remaining: BudgetSnapshot {
                messages_remaining: self.messages_remaining,
                cost_remaining: self.cost_remaining,
                tokens_remaining: self.tokens_remaining,
            },
            updated_at: self.updated_at,
        })
    }
}
