//! Model transport seam.
//!
//! The orchestrator only needs one capability from a language model: send a
//! prompt with an output cap and get back text plus usage. [`ModelClient`]
//! is that capability; [`ClaudeCliClient`] implements it over the Claude CLI.

mod claude;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use steward_common::Usage;

use crate::budget::CallEstimate;
use crate::errors::TransportError;

pub use claude::ClaudeCliClient;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    /// Output-token cap for this call.
    pub max_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
    pub latency: Duration,
    /// Cost reported by the provider, when it reports one.
    pub cost: Option<f64>,
    /// The response stopped at the output cap.
    pub truncated: bool,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, TransportError>;
}

/// Per-million-token prices used to cost calls and estimates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        }
    }
}

impl ModelPricing {
    pub fn cost(&self, usage: &Usage) -> f64 {
        (usage.prompt_tokens as f64 * self.input_per_mtok
            + usage.completion_tokens as f64 * self.output_per_mtok)
            / 1_000_000.0
    }

    /// Worst case for a call: the whole prompt plus a full-length response.
    pub fn estimate(&self, prompt_tokens: u64, max_tokens: u64) -> CallEstimate {
        CallEstimate {
            tokens: prompt_tokens + max_tokens,
            cost: self.cost(&Usage::new(prompt_tokens, max_tokens)),
        }
    }

    /// Provider-reported cost if present, otherwise priced from usage.
    pub fn resolve_cost(&self, completion: &Completion) -> f64 {
        completion
            .cost
            .filter(|c| c.is_finite() && *c >= 0.0)
            .unwrap_or_else(|| self.cost(&completion.usage))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted client for orchestrator tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// What the scripted client does for one call.
    #[derive(Debug, Clone)]
    pub(crate) enum Scripted {
        Reply {
            text: String,
            usage: Usage,
            cost: Option<f64>,
        },
        Fail(TransportError),
        /// Replies with the default text after a pause.
        Delayed(Duration),
        /// Never completes; used for deadline tests.
        Hang,
    }

    impl Scripted {
        pub(crate) fn reply(text: &str, cost: f64) -> Self {
            Scripted::Reply {
                text: text.to_string(),
                usage: Usage::new(1_000, 200),
                cost: Some(cost),
            }
        }
    }

    /// Replays a fixed script of outcomes and records every request.
    /// Once the script runs out it keeps answering with `fallback`.
    pub(crate) struct ScriptedClient {
        script: Mutex<VecDeque<Scripted>>,
        fallback: Scripted,
        pub(crate) requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedClient {
        pub(crate) fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback: Scripted::reply("<summary>done</summary>ok", 0.01),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn call_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn complete(
            &self,
            request: &CompletionRequest,
        ) -> Result<Completion, TransportError> {
            self.requests.lock().unwrap().push(request.clone());
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());
            match next {
                Scripted::Reply { text, usage, cost } => Ok(Completion {
                    text,
                    usage,
                    latency: Duration::from_millis(5),
                    cost,
                    truncated: false,
                }),
                Scripted::Fail(err) => Err(err),
                Scripted::Delayed(pause) => {
                    tokio::time::sleep(pause).await;
                    Ok(Completion {
                        text: "<summary>done after a pause</summary>ok".to_string(),
                        usage: Usage::new(1_000, 200),
                        latency: pause,
                        cost: Some(0.01),
                        truncated: false,
                    })
                }
                Scripted::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_costs_both_directions() {
        let pricing = ModelPricing::default();
        let cost = pricing.cost(&Usage::new(1_000_000, 100_000));
        assert!((cost - 4.5).abs() < 1e-9);
    }

    #[test]
    fn estimate_assumes_full_output() {
        let pricing = ModelPricing::default();
        let estimate = pricing.estimate(10_000, 8_192);
        assert_eq!(estimate.tokens, 18_192);
        assert!((estimate.cost - (0.03 + 8_192.0 * 15.0 / 1_000_000.0)).abs() < 1e-9);
    }

    #[test]
    fn reported_cost_wins_over_pricing() {
        let pricing = ModelPricing::default();
        let mut completion = Completion {
            text: String::new(),
            usage: Usage::new(1_000_000, 0),
            latency: Duration::ZERO,
            cost: Some(0.5),
            truncated: false,
        };
        assert_eq!(pricing.resolve_cost(&completion), 0.5);
        completion.cost = None;
        assert!((pricing.resolve_cost(&completion) - 3.0).abs() < 1e-9);
        completion.cost = Some(f64::NAN);
        assert!((pricing.resolve_cost(&completion) - 3.0).abs() < 1e-9);
    }
}
