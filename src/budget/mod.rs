//! Budget Monitor
//!
//! Tracks the cumulative message count, token count, and cost of one run
//! against the ceilings of its bound execution plan.
//!
//! The monitor answers two questions:
//!
//! - **Before a call** - [`BudgetMonitor::would_exceed`] refuses to authorize a
//!   call whose estimate would push any total past its ceiling.
//! - **After a call** - [`BudgetMonitor::record`] adds the actual usage
//!   unconditionally (the call already happened) and reports the post-hoc
//!   status; [`BudgetMonitor::should_terminate`] is the single must-stop decision.
//!
//! Exceeding any one ceiling is sufficient; ceilings are never combined.

use std::fmt;

use serde::{Deserialize, Serialize};
use steward_common::{BudgetSnapshot, ExecutionPlan};

/// Tolerance for floating-point cost accumulation.
const COST_EPSILON: f64 = 1e-9;

/// Hard upper bounds for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetCeilings {
    pub max_messages: u32,
    pub max_cost: f64,
    pub max_tokens: u64,
}

impl BudgetCeilings {
    pub fn from_plan(plan: &ExecutionPlan) -> Self {
        Self {
            max_messages: plan.max_messages,
            max_cost: plan.max_cost,
            max_tokens: plan.max_tokens,
        }
    }
}

/// Outcome of a budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    WithinBudget,
    CostExceeded,
    MessageLimitExceeded,
    TokenLimitExceeded,
}

impl BudgetStatus {
    pub fn is_exceeded(&self) -> bool {
        *self != BudgetStatus::WithinBudget
    }
}

impl fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BudgetStatus::WithinBudget => "within budget",
            BudgetStatus::CostExceeded => "cost ceiling exceeded",
            BudgetStatus::MessageLimitExceeded => "message limit exceeded",
            BudgetStatus::TokenLimitExceeded => "token limit exceeded",
        };
        f.write_str(s)
    }
}

/// Worst-case figures for a call that has not been sent yet.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CallEstimate {
    pub tokens: u64,
    pub cost: f64,
}

/// Running totals consumed by a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetTotals {
    pub messages: u64,
    pub tokens: u64,
    pub cost: f64,
}

/// In-memory budget state for a single live run.
#[derive(Debug, Clone)]
pub struct BudgetMonitor {
    ceilings: BudgetCeilings,
    totals: BudgetTotals,
}

impl BudgetMonitor {
    pub fn new(ceilings: BudgetCeilings) -> Self {
        Self {
            ceilings,
            totals: BudgetTotals::default(),
        }
    }

    pub fn for_plan(plan: &ExecutionPlan) -> Self {
        Self::new(BudgetCeilings::from_plan(plan))
    }

    /// Start from totals already consumed, e.g. when resuming from a checkpoint.
    pub fn with_totals(ceilings: BudgetCeilings, totals: BudgetTotals) -> Self {
        Self { ceilings, totals }
    }

    /// Rebuild totals from a remaining-budget snapshot taken under `original` ceilings.
    pub fn from_remaining(
        original: BudgetCeilings,
        remaining: &BudgetSnapshot,
        ceilings: BudgetCeilings,
    ) -> Self {
        let totals = BudgetTotals {
            messages: (original.max_messages as i64 - remaining.messages_remaining).max(0) as u64,
            tokens: (original.max_tokens as i64 - remaining.tokens_remaining).max(0) as u64,
            cost: (original.max_cost - remaining.cost_remaining).max(0.0),
        };
        Self::with_totals(ceilings, totals)
    }

    pub fn ceilings(&self) -> BudgetCeilings {
        self.ceilings
    }

    pub fn totals(&self) -> BudgetTotals {
        self.totals
    }

    /// Record a call that has already happened. Totals are updated unconditionally.
    pub fn record(&mut self, call_cost: f64, call_tokens: u64) -> BudgetStatus {
        self.totals.messages += 1;
        self.totals.tokens += call_tokens;
        self.totals.cost += call_cost.max(0.0);
        self.status()
    }

    /// Fold in usage recorded outside the live run, such as calls made after
    /// the last checkpoint of a crashed run. `withdrawn` is usage already
    /// counted here that a later correction replaced.
    pub fn absorb(&mut self, added: BudgetTotals, withdrawn: BudgetTotals) {
        self.totals.messages =
            (self.totals.messages + added.messages).saturating_sub(withdrawn.messages);
        self.totals.tokens = (self.totals.tokens + added.tokens).saturating_sub(withdrawn.tokens);
        self.totals.cost = (self.totals.cost + added.cost - withdrawn.cost).max(0.0);
    }

    /// Pre-call authorization: would one more message with this estimate cross a ceiling?
    pub fn would_exceed(&self, estimate: &CallEstimate) -> BudgetStatus {
        Self::classify(
            &self.ceilings,
            self.totals.cost + estimate.cost,
            self.totals.messages + 1,
            self.totals.tokens + estimate.tokens,
        )
    }

    /// Current status of the totals against the ceilings.
    pub fn status(&self) -> BudgetStatus {
        Self::classify(
            &self.ceilings,
            self.totals.cost,
            self.totals.messages,
            self.totals.tokens,
        )
    }

    /// True iff at least one ceiling has been exceeded.
    pub fn should_terminate(&self) -> bool {
        self.status().is_exceeded()
    }

    /// Remaining figures, negative once a ceiling has been crossed.
    pub fn remaining(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            messages_remaining: self.ceilings.max_messages as i64 - self.totals.messages as i64,
            cost_remaining: self.ceilings.max_cost - self.totals.cost,
            tokens_remaining: self.ceilings.max_tokens as i64 - self.totals.tokens as i64,
        }
    }

    /// Human-readable explanation of an exceeded ceiling with the figures involved.
    pub fn describe(&self, status: BudgetStatus) -> String {
        let t = &self.totals;
        let c = &self.ceilings;
        match status {
            BudgetStatus::WithinBudget => format!(
                "within budget: {} / {} messages, {} / {} tokens, ${:.4} / ${:.2}",
                t.messages, c.max_messages, t.tokens, c.max_tokens, t.cost, c.max_cost
            ),
            BudgetStatus::CostExceeded => format!(
                "cost ceiling exceeded: ${:.4} spent of ${:.2} allowed",
                t.cost, c.max_cost
            ),
            BudgetStatus::MessageLimitExceeded => format!(
                "message limit exceeded: {} messages of {} allowed",
                t.messages, c.max_messages
            ),
            BudgetStatus::TokenLimitExceeded => format!(
                "token limit exceeded: {} tokens of {} allowed",
                t.tokens, c.max_tokens
            ),
        }
    }

    /// Explanation for a call refused by [`BudgetMonitor::would_exceed`].
    pub fn describe_rejection(&self, status: BudgetStatus, estimate: &CallEstimate) -> String {
        let t = &self.totals;
        let c = &self.ceilings;
        match status {
            BudgetStatus::WithinBudget => "call authorized".to_string(),
            BudgetStatus::CostExceeded => format!(
                "call refused, cost ceiling would be exceeded: ${:.4} spent + ${:.4} estimated > ${:.2}",
                t.cost, estimate.cost, c.max_cost
            ),
            BudgetStatus::MessageLimitExceeded => format!(
                "call refused, message limit reached: {} of {} messages used",
                t.messages, c.max_messages
            ),
            BudgetStatus::TokenLimitExceeded => format!(
                "call refused, token limit would be exceeded: {} used + {} estimated > {}",
                t.tokens, estimate.tokens, c.max_tokens
            ),
        }
    }

    // Cost is checked first, then messages, then tokens.
    fn classify(ceilings: &BudgetCeilings, cost: f64, messages: u64, tokens: u64) -> BudgetStatus {
        if cost > ceilings.max_cost + COST_EPSILON {
            BudgetStatus::CostExceeded
        } else if messages > ceilings.max_messages as u64 {
            BudgetStatus::MessageLimitExceeded
        } else if tokens > ceilings.max_tokens {
            BudgetStatus::TokenLimitExceeded
        } else {
            BudgetStatus::WithinBudget
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ceilings() -> BudgetCeilings {
        BudgetCeilings {
            max_messages: 3,
            max_cost: 1.0,
            max_tokens: 10_000,
        }
    }

    #[test]
    fn fresh_monitor_is_within_budget() {
        let monitor = BudgetMonitor::new(ceilings());
        assert_eq!(monitor.status(), BudgetStatus::WithinBudget);
        assert!(!monitor.should_terminate());
        assert_eq!(monitor.remaining().messages_remaining, 3);
    }

    #[test]
    fn reaching_a_ceiling_exactly_does_not_terminate() {
        let mut monitor = BudgetMonitor::new(ceilings());
        monitor.record(0.5, 5_000);
        assert_eq!(monitor.record(0.5, 5_000), BudgetStatus::WithinBudget);
        assert!(!monitor.should_terminate());
    }

    #[test]
    fn cost_over_ceiling_terminates() {
        let mut monitor = BudgetMonitor::new(ceilings());
        assert_eq!(monitor.record(0.6, 10), BudgetStatus::WithinBudget);
        assert_eq!(monitor.record(0.41, 10), BudgetStatus::CostExceeded);
        assert!(monitor.should_terminate());
        assert!(monitor.describe(monitor.status()).contains("$1.0100"));
    }

    #[test]
    fn each_ceiling_alone_is_sufficient() {
        let mut messages = BudgetMonitor::new(ceilings());
        for _ in 0..4 {
            messages.record(0.0, 0);
        }
        assert_eq!(messages.status(), BudgetStatus::MessageLimitExceeded);

        let mut tokens = BudgetMonitor::new(ceilings());
        assert_eq!(tokens.record(0.0, 10_001), BudgetStatus::TokenLimitExceeded);
        assert!(tokens.should_terminate());
    }

    #[test]
    fn should_terminate_iff_some_ceiling_exceeded() {
        // Walk a sequence of calls and compare against an independent oracle.
        let calls = [(0.2, 2_000), (0.3, 3_000), (0.1, 4_000), (0.5, 100)];
        let mut monitor = BudgetMonitor::new(ceilings());
        let (mut cost, mut tokens, mut messages) = (0.0f64, 0u64, 0u64);
        for (c, t) in calls {
            monitor.record(c, t);
            cost += c;
            tokens += t;
            messages += 1;
            let oracle = cost > 1.0 + 1e-9 || messages > 3 || tokens > 10_000;
            assert_eq!(monitor.should_terminate(), oracle);
        }
        assert!(monitor.should_terminate());
    }

    #[test]
    fn record_updates_totals_even_when_exceeded() {
        let mut monitor = BudgetMonitor::new(ceilings());
        monitor.record(2.0, 50);
        monitor.record(2.0, 50);
        let totals = monitor.totals();
        assert_eq!(totals.messages, 2);
        assert_eq!(totals.tokens, 100);
        assert!((totals.cost - 4.0).abs() < 1e-9);
        assert!(monitor.remaining().cost_remaining < 0.0);
    }

    #[test]
    fn would_exceed_rejects_before_the_call() {
        let mut monitor = BudgetMonitor::new(ceilings());
        monitor.record(0.9, 100);
        let estimate = CallEstimate {
            tokens: 500,
            cost: 0.2,
        };
        assert_eq!(monitor.would_exceed(&estimate), BudgetStatus::CostExceeded);
        assert!(!monitor.should_terminate());
        let reason = monitor.describe_rejection(BudgetStatus::CostExceeded, &estimate);
        assert!(reason.contains("call refused"));
    }

    #[test]
    fn would_exceed_counts_the_next_message() {
        let mut monitor = BudgetMonitor::new(ceilings());
        for _ in 0..3 {
            monitor.record(0.0, 0);
        }
        assert_eq!(
            monitor.would_exceed(&CallEstimate::default()),
            BudgetStatus::MessageLimitExceeded
        );
    }

    #[test]
    fn from_remaining_reconstructs_totals() {
        let original = ceilings();
        let snapshot = BudgetSnapshot {
            messages_remaining: 1,
            cost_remaining: 0.25,
            tokens_remaining: 4_000,
        };
        let monitor = BudgetMonitor::from_remaining(original, &snapshot, original);
        let totals = monitor.totals();
        assert_eq!(totals.messages, 2);
        assert_eq!(totals.tokens, 6_000);
        assert!((totals.cost - 0.75).abs() < 1e-9);
        assert_eq!(monitor.remaining(), snapshot);
    }

    #[test]
    fn absorb_adds_later_usage_and_withdraws_corrected() {
        let mut monitor = BudgetMonitor::with_totals(
            ceilings(),
            BudgetTotals {
                messages: 2,
                tokens: 6_000,
                cost: 0.75,
            },
        );
        monitor.absorb(
            BudgetTotals {
                messages: 1,
                tokens: 600,
                cost: 0.3,
            },
            BudgetTotals {
                messages: 1,
                tokens: 1_000,
                cost: 0.5,
            },
        );
        let totals = monitor.totals();
        assert_eq!(totals.messages, 2);
        assert_eq!(totals.tokens, 5_600);
        assert!((totals.cost - 0.55).abs() < 1e-9);
    }

    #[test]
    fn from_remaining_with_raised_ceilings_keeps_consumption() {
        let original = ceilings();
        let snapshot = BudgetSnapshot {
            messages_remaining: 0,
            cost_remaining: -0.01,
            tokens_remaining: 0,
        };
        let raised = BudgetCeilings {
            max_cost: 2.0,
            ..original
        };
        let monitor = BudgetMonitor::from_remaining(original, &snapshot, raised);
        assert!((monitor.totals().cost - 1.01).abs() < 1e-9);
        assert!(!monitor.should_terminate());
    }
}
