//! Task routing: execute a task against the selector's chosen model and, on
//! failure, retry against the next-best surviving candidate up to a fixed
//! attempt bound.
//!
//! A task moves Selecting -> Executing(model) -> Succeeded, or through
//! Retrying(exclude set) -> Executing(next model) until it either succeeds
//! or the exclude set reaches the attempt bound. Both terminal states are
//! ordinary [`TaskResult`] values; execution failures never escape as
//! faults.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SwitchboardError};
use crate::ledger::QuotaLedger;
use crate::oracle::DecisionOracle;
use crate::providers::ProviderRegistry;
use crate::selector::CandidateSelector;
use crate::types::{Decision, OutcomeRecord, TaskResult};

/// Routing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingConfig {
    /// Maximum number of distinct models tried per task
    pub max_attempts: usize,

    /// Timeout applied to each individual provider call
    #[serde(with = "humantime_serde")]
    pub provider_timeout: Duration,

    /// Sampling temperature passed through to providers
    pub temperature: Option<f32>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            provider_timeout: Duration::from_secs(120),
            temperature: None,
        }
    }
}

/// Executes tasks against providers, recording usage and outcomes in the
/// ledger and falling back across candidates on failure.
pub struct TaskRouter<L, O: ?Sized> {
    ledger: Arc<L>,
    registry: Arc<ProviderRegistry>,
    selector: CandidateSelector<L, O>,
    config: RoutingConfig,
}

impl<L, O> TaskRouter<L, O>
where
    L: QuotaLedger,
    O: DecisionOracle + ?Sized,
{
    pub fn new(
        ledger: Arc<L>,
        registry: Arc<ProviderRegistry>,
        selector: CandidateSelector<L, O>,
        config: RoutingConfig,
    ) -> Self {
        Self {
            ledger,
            registry,
            selector,
            config,
        }
    }

    pub fn selector(&self) -> &CandidateSelector<L, O> {
        &self.selector
    }

    /// Execute `task`, retrying across candidates up to the attempt bound.
    ///
    /// # Errors
    /// - `CapacityExhausted` / `NoProvidersAvailable` when selection finds
    ///   nothing to route to. Execution failures are returned as a
    ///   `TaskResult` with `success = false`, not as errors.
    #[tracing::instrument(skip(self, task), fields(task_id = tracing::field::Empty, task_type = %task_type))]
    pub async fn execute(&self, task: &str, task_type: &str) -> Result<TaskResult> {
        let task_id = Uuid::new_v4();
        tracing::Span::current().record("task_id", tracing::field::display(task_id));

        let decision = self.selector.select(task).await?;
        tracing::info!(
            model = %decision.model,
            estimated_tokens = decision.estimated_tokens,
            "selected model for task"
        );

        let mut excluded: HashSet<String> = HashSet::new();
        let mut current = decision.clone();
        let mut last_failure: Option<(String, SwitchboardError)> = None;

        loop {
            match self
                .attempt_execution(task_id, task, task_type, &current, &decision)
                .await
            {
                Ok(result) => return Ok(result),
                Err(err) => {
                    tracing::warn!(model = %current.model, error = %err, "attempt failed");
                    excluded.insert(current.model.clone());
                    last_failure = Some((current.model.clone(), err));

                    if excluded.len() >= self.config.max_attempts {
                        tracing::warn!(
                            attempts = excluded.len(),
                            "attempt budget exhausted, giving up on task"
                        );
                        break;
                    }

                    match self.next_candidate(&decision, &mut excluded).await {
                        Ok(Some(next)) => {
                            tracing::info!(model = %next, "falling back to next candidate");
                            current = Decision {
                                model: next,
                                reasoning: format!(
                                    "fallback after failure of {}",
                                    current.model
                                ),
                                estimated_tokens: decision.estimated_tokens,
                                complexity: decision.complexity,
                            };
                        }
                        Ok(None) => {
                            tracing::warn!("no surviving fallback candidates, giving up on task");
                            break;
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "fallback candidate lookup failed");
                            break;
                        }
                    }
                }
            }
        }

        let (model_used, error) = match last_failure {
            Some((model, err)) => (model, err.to_string()),
            None => (decision.model.clone(), "task execution failed".to_string()),
        };

        Ok(TaskResult {
            task_id,
            success: false,
            response: None,
            error: Some(error),
            model_used,
            tokens_used: 0,
            decision,
        })
    }

    /// One execution attempt against one model. Records usage and a
    /// successful outcome on success, a failed outcome on any error.
    async fn attempt_execution(
        &self,
        task_id: Uuid,
        task: &str,
        task_type: &str,
        current: &Decision,
        original: &Decision,
    ) -> Result<TaskResult> {
        let model = self
            .ledger
            .get_model(&current.model)
            .await?
            .ok_or_else(|| SwitchboardError::ModelNotFound(current.model.clone()))?;

        let provider = match self.registry.get(&model.origin) {
            Ok(provider) => provider,
            Err(err) => {
                self.record_failure(&current.model, task_type, &err).await;
                return Err(err);
            }
        };

        let outcome = tokio::time::timeout(
            self.config.provider_timeout,
            provider.generate(&current.model, task, self.config.temperature),
        )
        .await;

        let generation = match outcome {
            Ok(Ok(generation)) => generation,
            Ok(Err(err)) => {
                self.record_failure(&current.model, task_type, &err).await;
                return Err(err);
            }
            Err(_) => {
                let err = SwitchboardError::ProviderTimeout {
                    model: current.model.clone(),
                    timeout_ms: self.config.provider_timeout.as_millis() as u64,
                };
                self.record_failure(&current.model, task_type, &err).await;
                return Err(err);
            }
        };

        let tokens_used = generation
            .tokens_used
            .unwrap_or_else(|| estimate_tokens(task, &generation.text));

        // Best effort: a ledger hiccup after a successful generation should
        // not fail the task or trigger a duplicate provider call.
        if let Err(err) = self.ledger.record_usage(&current.model, 1, tokens_used).await {
            tracing::error!(model = %current.model, error = %err, "failed to record usage");
        }
        if let Err(err) = self
            .ledger
            .record_outcome(OutcomeRecord {
                model: current.model.clone(),
                task_type: task_type.to_string(),
                success: true,
                tokens_used,
                error_message: None,
            })
            .await
        {
            tracing::error!(model = %current.model, error = %err, "failed to record outcome");
        }

        tracing::info!(
            model = %current.model,
            tokens_used,
            "task executed successfully"
        );

        Ok(TaskResult {
            task_id,
            success: true,
            response: Some(generation.text),
            error: None,
            model_used: current.model.clone(),
            tokens_used,
            decision: original.clone(),
        })
    }

    /// Next fallback candidate in rank order: recompute availability at the
    /// original estimate, drop excluded models and failure-rate violators
    /// (fallback candidates satisfy the same eligibility rule as the
    /// original candidate set), skip-and-exclude origins with no provider.
    async fn next_candidate(
        &self,
        original: &Decision,
        excluded: &mut HashSet<String>,
    ) -> Result<Option<String>> {
        let selection = self.selector.config();
        let available = self
            .ledger
            .list_available(original.estimated_tokens)
            .await?;

        for availability in available {
            let name = &availability.model.name;
            if excluded.contains(name) {
                continue;
            }

            let rate = self
                .ledger
                .failure_rate(name, selection.failure_window)
                .await?;
            if rate > selection.failure_rate_threshold {
                tracing::debug!(
                    model = %name,
                    failure_rate = rate,
                    "skipping fallback candidate over failure-rate threshold"
                );
                continue;
            }

            if !self.registry.contains(&availability.model.origin) {
                tracing::debug!(
                    model = %name,
                    origin = %availability.model.origin,
                    "skipping fallback candidate, origin has no provider"
                );
                excluded.insert(name.clone());
                continue;
            }

            return Ok(Some(name.clone()));
        }

        Ok(None)
    }

    async fn record_failure(&self, model: &str, task_type: &str, err: &SwitchboardError) {
        let record = OutcomeRecord {
            model: model.to_string(),
            task_type: task_type.to_string(),
            success: false,
            tokens_used: 0,
            error_message: Some(err.to_string()),
        };
        if let Err(record_err) = self.ledger.record_outcome(record).await {
            tracing::error!(model = %model, error = %record_err, "failed to record outcome");
        }
    }
}

/// Length-derived token estimate for providers that report no usage: roughly
/// four characters per token across prompt and completion.
fn estimate_tokens(prompt: &str, completion: &str) -> u64 {
    (((prompt.len() + completion.len()) / 4).max(1)) as u64
}
