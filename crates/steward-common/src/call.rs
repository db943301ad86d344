use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::CallStatus;

/// Token usage reported by the model transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Remaining budget at the moment a call was authorized.
///
/// Values are signed: a call that pushes a total past its ceiling leaves a
/// negative remainder, which is what resume needs to reconstruct the totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub messages_remaining: i64,
    pub cost_remaining: f64,
    pub tokens_remaining: i64,
}

/// What the context governor did to one prompt section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShrinkAction {
    /// Replaced by a head/tail excerpt.
    Summarized,
    /// Cut down to its most recent portion.
    Truncated,
    /// Removed entirely.
    Dropped,
}

/// Audit entry for a single shrink decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShrinkRecord {
    pub section_id: String,
    pub action: ShrinkAction,
    pub original_tokens: usize,
    pub reduced_tokens: usize,
}

/// A model call ready to be appended to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewModelCall {
    pub run_id: i64,
    pub step_id: Option<i64>,
    pub model: String,
    pub usage: Usage,
    pub max_tokens: u64,
    pub latency_ms: u64,
    pub cost: f64,
    pub status: CallStatus,
    pub error_code: Option<String>,
    pub prompt_hash: String,
    pub response_hash: Option<String>,
    pub prompt_preview: String,
    pub response_preview: String,
    pub budget_snapshot: BudgetSnapshot,
    pub shrink_log: Vec<ShrinkRecord>,
    /// Earlier call this record corrects. The original row is never modified.
    pub corrects: Option<i64>,
}

/// Immutable ledger record of one model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCall {
    pub id: i64,
    pub run_id: i64,
    pub step_id: Option<i64>,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub max_tokens: u64,
    pub latency_ms: u64,
    pub cost: f64,
    pub status: CallStatus,
    pub error_code: Option<String>,
    pub prompt_hash: String,
    pub response_hash: Option<String>,
    pub prompt_preview: String,
    pub response_preview: String,
    pub budget_snapshot: BudgetSnapshot,
    pub shrink_log: Vec<ShrinkRecord>,
    pub corrects: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl ModelCall {
    pub fn usage(&self) -> Usage {
        Usage::new(self.prompt_tokens, self.completion_tokens)
    }

    /// Whether the call consumed a message from the budget. Skipped calls were never sent.
    pub fn counts_as_message(&self) -> bool {
        self.status != CallStatus::Skipped
    }
}
