//! Usage Ledger
//!
//! Append-only record of every model call: who asked, how much it used, what
//! it cost, and what the budget looked like at that moment. The ledger is the
//! source of truth for audit queries and for reconstructing totals on resume.

pub mod query;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use steward_common::{ModelCall, NewModelCall};

use crate::budget::BudgetTotals;
use crate::errors::LedgerError;
use crate::store::DbHandle;

pub use query::{CallQuery, CallSort, Page, SortOrder};

/// Aggregates over a run's effective ledger records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerTotals {
    /// Every effective record, skipped calls included.
    pub calls: u64,
    /// Records that consumed a message (everything but skipped calls).
    pub messages: u64,
    pub tokens: u64,
    pub cost: f64,
}

impl From<LedgerTotals> for BudgetTotals {
    fn from(totals: LedgerTotals) -> Self {
        Self {
            messages: totals.messages,
            tokens: totals.tokens,
            cost: totals.cost,
        }
    }
}

/// Ledger movement since a checkpoint.
///
/// `added` covers effective records newer than the checkpoint's last call.
/// `withdrawn` covers records the checkpoint already counted that a newer
/// correction has since replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LedgerDelta {
    pub added: LedgerTotals,
    pub withdrawn: LedgerTotals,
}

/// Storage seam for model-call records.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Append one record and return its id. Ids increase monotonically.
    async fn append(&self, call: NewModelCall) -> Result<i64, LedgerError>;

    /// Append a record that supersedes `original` in totals. The original row is kept.
    async fn append_correction(&self, original: i64, call: NewModelCall)
    -> Result<i64, LedgerError>;

    async fn totals(&self, run_id: i64) -> Result<LedgerTotals, LedgerError>;

    /// Usage recorded after record `after` (everything when `None`), with the
    /// older records those newer corrections replaced.
    async fn usage_since(&self, run_id: i64, after: Option<i64>)
    -> Result<LedgerDelta, LedgerError>;

    async fn calls_for_step(&self, step_id: i64) -> Result<Vec<ModelCall>, LedgerError>;

    async fn query(&self, query: CallQuery) -> Result<Page<ModelCall>, LedgerError>;
}

#[async_trait]
impl UsageLedger for DbHandle {
    async fn append(&self, call: NewModelCall) -> Result<i64, LedgerError> {
        let run_id = call.run_id;
        self.call(move |db| db.insert_call(&call))
            .await
            .map_err(|source| LedgerError::AppendFailed { run_id, source })
    }

    async fn append_correction(
        &self,
        original: i64,
        mut call: NewModelCall,
    ) -> Result<i64, LedgerError> {
        let exists = self
            .call(move |db| db.get_call(original))
            .await
            .map_err(LedgerError::Query)?
            .is_some();
        if !exists {
            return Err(LedgerError::UnknownCall { id: original });
        }
        call.corrects = Some(original);
        self.append(call).await
    }

    async fn totals(&self, run_id: i64) -> Result<LedgerTotals, LedgerError> {
        self.call(move |db| db.ledger_totals(run_id))
            .await
            .map_err(LedgerError::Query)
    }

    async fn usage_since(
        &self,
        run_id: i64,
        after: Option<i64>,
    ) -> Result<LedgerDelta, LedgerError> {
        self.call(move |db| {
            let added = db.totals_after(run_id, after)?;
            let withdrawn = match after {
                Some(through) => db.superseded_through(run_id, through)?,
                None => LedgerTotals::default(),
            };
            Ok(LedgerDelta { added, withdrawn })
        })
        .await
        .map_err(LedgerError::Query)
    }

    async fn calls_for_step(&self, step_id: i64) -> Result<Vec<ModelCall>, LedgerError> {
        self.call(move |db| db.calls_for_step(step_id))
            .await
            .map_err(LedgerError::Query)
    }

    async fn query(&self, query: CallQuery) -> Result<Page<ModelCall>, LedgerError> {
        self.call(move |db| db.query_calls(&query))
            .await
            .map_err(LedgerError::Query)
    }
}

/// Hex-encoded SHA-256 of `content`, used for prompt and response dedup.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ledger::tests::new_call;
    use crate::store::runs::tests::{sample_item, sample_plan};

    async fn handle_with_run() -> (DbHandle, i64) {
        let handle = DbHandle::in_memory().unwrap();
        let run = handle
            .call(|db| db.create_run(&sample_item(), &sample_plan(), None))
            .await
            .unwrap();
        (handle, run.id)
    }

    #[test]
    fn content_hash_is_stable_sha256() {
        assert_eq!(
            content_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(content_hash("x").len(), 64);
    }

    #[tokio::test]
    async fn append_ids_are_monotonic() {
        let (ledger, run_id) = handle_with_run().await;
        let a = ledger.append(new_call(run_id, 0.1, 10)).await.unwrap();
        let b = ledger.append(new_call(run_id, 0.1, 10)).await.unwrap();
        assert!(b > a);
        let totals = ledger.totals(run_id).await.unwrap();
        assert_eq!(totals.messages, 2);
    }

    #[tokio::test]
    async fn correction_of_unknown_call_is_rejected() {
        let (ledger, run_id) = handle_with_run().await;
        let err = ledger
            .append_correction(77, new_call(run_id, 0.1, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownCall { id: 77 }));
    }

    #[tokio::test]
    async fn correction_references_original() {
        let (ledger, run_id) = handle_with_run().await;
        let original = ledger.append(new_call(run_id, 0.4, 10)).await.unwrap();
        let fixed = ledger
            .append_correction(original, new_call(run_id, 0.2, 10))
            .await
            .unwrap();
        let page = ledger.query(CallQuery::for_run(run_id)).await.unwrap();
        let record = page.items.iter().find(|c| c.id == fixed).unwrap();
        assert_eq!(record.corrects, Some(original));
        let totals = ledger.totals(run_id).await.unwrap();
        assert!((totals.cost - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn append_for_missing_run_fails_with_append_error() {
        let ledger = DbHandle::in_memory().unwrap();
        let err = ledger.append(new_call(404, 0.1, 10)).await.unwrap_err();
        assert!(matches!(err, LedgerError::AppendFailed { run_id: 404, .. }));
    }
}
