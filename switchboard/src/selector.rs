//! Candidate selection: build the eligible model set, consult the decision
//! oracle, validate its answer against real-time capacity, and repair with a
//! deterministic fallback whenever the answer is missing, malformed or
//! infeasible. The fallback path never re-invokes the oracle, so selection
//! always terminates.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwitchboardError};
use crate::ledger::QuotaLedger;
use crate::oracle::{DecisionOracle, ORACLE_SYSTEM_PROMPT};
use crate::providers::ProviderRegistry;
use crate::types::{Complexity, Decision, ModelAvailability};

/// Selection-strategy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelectionConfig {
    /// Models whose recent failure rate exceeds this percentage are excluded
    /// from the candidate set
    pub failure_rate_threshold: f64,

    /// Window over which the recent failure rate is computed
    #[serde(with = "humantime_serde")]
    pub failure_window: Duration,

    /// Headroom added to the oracle's token estimate when validating and
    /// when filtering fallback candidates
    pub token_buffer: u64,

    /// Minimum token capacity a model must have to appear in the candidate
    /// set at all
    pub floor_tokens: u64,

    /// Token estimate synthesized when no oracle estimate is usable
    pub default_estimated_tokens: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            failure_window: Duration::from_secs(300),
            token_buffer: 500,
            floor_tokens: 256,
            default_estimated_tokens: 1_000,
        }
    }
}

/// A model that survived enabled/capacity/origin/failure-rate filtering.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub availability: ModelAvailability,
    pub failure_rate: f64,
}

impl Candidate {
    pub fn name(&self) -> &str {
        &self.availability.model.name
    }
}

/// Selects the model a task should execute on.
///
/// Constructed from explicit services (no singletons) so tests can substitute
/// an in-memory ledger, a mock registry and a scripted oracle.
pub struct CandidateSelector<L, O: ?Sized> {
    ledger: Arc<L>,
    registry: Arc<ProviderRegistry>,
    oracle: Arc<O>,
    config: SelectionConfig,
}

impl<L, O> CandidateSelector<L, O>
where
    L: QuotaLedger,
    O: DecisionOracle + ?Sized,
{
    pub fn new(
        ledger: Arc<L>,
        registry: Arc<ProviderRegistry>,
        oracle: Arc<O>,
        config: SelectionConfig,
    ) -> Self {
        Self {
            ledger,
            registry,
            oracle,
            config,
        }
    }

    pub fn config(&self) -> &SelectionConfig {
        &self.config
    }

    /// Select a model for `task`.
    ///
    /// # Errors
    /// - `CapacityExhausted` when the candidate set is empty
    /// - `NoProvidersAvailable` when even the emergency fallback finds
    ///   nothing
    #[tracing::instrument(skip(self, task), fields(task_len = task.len()))]
    pub async fn select(&self, task: &str) -> Result<Decision> {
        match self.select_from_candidates(task).await {
            Ok(decision) => Ok(decision),
            Err(SwitchboardError::CapacityExhausted) => {
                Err(SwitchboardError::CapacityExhausted)
            }
            Err(err) => self.emergency_fallback(err).await,
        }
    }

    async fn select_from_candidates(&self, task: &str) -> Result<Decision> {
        let candidates = self.candidates().await?;
        if candidates.is_empty() {
            return Err(SwitchboardError::CapacityExhausted);
        }

        tracing::debug!(count = candidates.len(), "built candidate set");

        let rendered = render_candidates(&candidates);
        let oracle_answer = match self
            .oracle
            .consult(ORACLE_SYSTEM_PROMPT, &rendered, task)
            .await
        {
            Ok(decision) => Some(decision),
            Err(err) => {
                tracing::debug!(error = %err, "oracle consultation failed, falling back");
                None
            }
        };

        let mut estimated_tokens = self.config.default_estimated_tokens;
        if let Some(decision) = oracle_answer {
            estimated_tokens = decision.estimated_tokens;
            if self.validate(&decision, &candidates).await? {
                tracing::info!(
                    model = %decision.model,
                    estimated_tokens = decision.estimated_tokens,
                    "accepted oracle recommendation"
                );
                return Ok(decision);
            }
            tracing::info!(model = %decision.model, "discarding infeasible oracle recommendation");
        }

        Ok(self.fallback_decision(&candidates, estimated_tokens))
    }

    /// Build the ranked candidate set: available models, minus origins with
    /// no registered provider, minus models over the failure-rate threshold.
    pub(crate) async fn candidates(&self) -> Result<Vec<Candidate>> {
        let available = self.ledger.list_available(self.config.floor_tokens).await?;

        let routable: Vec<ModelAvailability> = available
            .into_iter()
            .filter(|a| {
                let routable = self.registry.contains(&a.model.origin);
                if !routable {
                    tracing::debug!(
                        model = %a.model.name,
                        origin = %a.model.origin,
                        "excluding model, origin has no provider"
                    );
                }
                routable
            })
            .collect();

        let rates = futures::future::try_join_all(
            routable
                .iter()
                .map(|a| self.ledger.failure_rate(&a.model.name, self.config.failure_window)),
        )
        .await?;

        Ok(routable
            .into_iter()
            .zip(rates)
            .filter(|(availability, rate)| {
                let healthy = *rate <= self.config.failure_rate_threshold;
                if !healthy {
                    tracing::debug!(
                        model = %availability.model.name,
                        failure_rate = rate,
                        "excluding model over failure-rate threshold"
                    );
                }
                healthy
            })
            .map(|(availability, failure_rate)| Candidate {
                availability,
                failure_rate,
            })
            .collect())
    }

    /// The oracle's answer is kept only if it names a candidate that still
    /// has real-time capacity for the estimate plus the configured buffer.
    async fn validate(&self, decision: &Decision, candidates: &[Candidate]) -> Result<bool> {
        let Some(candidate) = candidates.iter().find(|c| c.name() == decision.model) else {
            tracing::debug!(model = %decision.model, "oracle named a model outside the candidate set");
            return Ok(false);
        };

        let usage = self.ledger.get_usage(&decision.model).await?;
        let fresh = ModelAvailability {
            model: candidate.availability.model.clone(),
            usage,
        };
        let needed = decision.estimated_tokens.saturating_add(self.config.token_buffer);
        Ok(fresh.has_capacity_for(needed))
    }

    /// Deterministic, oracle-free selection from an already-built candidate
    /// set. `candidates` must be non-empty.
    fn fallback_decision(&self, candidates: &[Candidate], estimated_tokens: u64) -> Decision {
        let needed = estimated_tokens.saturating_add(self.config.token_buffer);

        if let Some(candidate) = candidates
            .iter()
            .find(|c| c.availability.token_headroom() >= needed)
        {
            tracing::info!(model = %candidate.name(), "deterministic fallback selection");
            return Decision {
                model: candidate.name().to_string(),
                reasoning: format!(
                    "rank-order fallback: best-ranked candidate with {needed} tokens of headroom"
                ),
                estimated_tokens,
                complexity: Complexity::Medium,
            };
        }

        // Nothing clears the buffer; take the best-ranked candidate anyway
        // with a synthesized generic estimate.
        let first = &candidates[0];
        tracing::warn!(
            model = %first.name(),
            "no candidate clears the token buffer, selecting best-ranked unconditionally"
        );
        Decision {
            model: first.name().to_string(),
            reasoning: "rank-order fallback: no candidate clears the token buffer".to_string(),
            estimated_tokens: self.config.default_estimated_tokens,
            complexity: Complexity::Medium,
        }
    }

    /// Last resort when selection itself failed unexpectedly: first model
    /// from an unfiltered availability listing.
    async fn emergency_fallback(&self, cause: SwitchboardError) -> Result<Decision> {
        tracing::warn!(error = %cause, "selection failed, attempting emergency fallback");

        let available = self
            .ledger
            .list_available(self.config.floor_tokens)
            .await
            .unwrap_or_default();

        match available.into_iter().next() {
            Some(availability) => Ok(Decision {
                model: availability.model.name,
                reasoning: "emergency fallback: first available model".to_string(),
                estimated_tokens: self.config.default_estimated_tokens,
                complexity: Complexity::Medium,
            }),
            None => Err(SwitchboardError::NoProvidersAvailable),
        }
    }
}

/// Render the candidate set as the compact description passed to the oracle.
pub(crate) fn render_candidates(candidates: &[Candidate]) -> String {
    let mut out = String::from("Candidates:\n");
    for candidate in candidates {
        let a = &candidate.availability;
        let m = &a.model;
        out.push_str(&format!(
            "- {} (origin {}, rank {}): {} | remaining rpm {}/{} tpm {}/{} rpd {}/{} tpd {}/{} | lifetime success {:.1}% | recent failures {:.1}%\n",
            m.name,
            m.origin,
            m.rank,
            if m.description.is_empty() { "no description" } else { &m.description },
            a.remaining_rpm(),
            m.rpm_allowed,
            a.remaining_tpm(),
            m.tpm_total,
            a.remaining_rpd(),
            m.rpd_total,
            a.remaining_tpd(),
            m.tpd_total,
            m.lifetime_success_rate(),
            candidate.failure_rate,
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::in_memory::InMemoryLedger;
    use crate::oracle::MockOracle;
    use crate::providers::MockProvider;
    use crate::types::ModelDescriptor;
    use crate::types::OutcomeRecord;

    fn descriptor(name: &str, origin: &str, rank: i32, rpm: u32) -> ModelDescriptor {
        ModelDescriptor {
            name: name.to_string(),
            origin: origin.to_string(),
            rank,
            description: format!("{name} test model"),
            enabled: true,
            rpm_allowed: rpm,
            tpm_total: 100_000,
            rpd_total: 1_000,
            tpd_total: 1_000_000,
        }
    }

    async fn fixture(oracle: MockOracle) -> (Arc<InMemoryLedger>, CandidateSelector<InMemoryLedger, MockOracle>) {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger
            .upsert_models(vec![
                descriptor("model-a", "alpha", 1, 1),
                descriptor("model-b", "alpha", 2, 5),
            ])
            .await
            .unwrap();

        let registry = Arc::new(ProviderRegistry::new());
        registry.register("alpha", Arc::new(MockProvider::new()));

        let selector = CandidateSelector::new(
            ledger.clone(),
            registry,
            Arc::new(oracle),
            SelectionConfig::default(),
        );
        (ledger, selector)
    }

    #[tokio::test]
    async fn test_accepts_valid_oracle_recommendation() {
        let oracle = MockOracle::new();
        oracle.push_recommendation("model-b", 400);
        let (_ledger, selector) = fixture(oracle).await;

        let decision = selector.select("summarize this").await.unwrap();
        assert_eq!(decision.model, "model-b");
        assert_eq!(decision.estimated_tokens, 400);
    }

    #[tokio::test]
    async fn test_discards_recommendation_without_capacity() {
        let oracle = MockOracle::new();
        oracle.push_recommendation("model-a", 400);
        let (ledger, selector) = fixture(oracle).await;

        // model-a has rpm_allowed = 1 and is already at 1/1 this minute.
        ledger.record_usage("model-a", 1, 10).await.unwrap();

        let decision = selector.select("summarize this").await.unwrap();
        assert_eq!(decision.model, "model-b");
    }

    #[tokio::test]
    async fn test_malformed_oracle_output_falls_back_deterministically() {
        for text in [
            "use model-a, roughly 500 tokens",
            r#"{"model": "model-a"}"#,
            r#"{"estimated_tokens": 10, "reasoning": "r"}"#,
            "{\"model\": \"model-a\", \"estimated_tokens\":",
        ] {
            let oracle = MockOracle::new();
            oracle.push_text(text);
            let (_ledger, selector) = fixture(oracle).await;

            let decision = selector.select("task").await.unwrap();
            // Deterministic fallback: rank order puts model-a first.
            assert_eq!(decision.model, "model-a");
            assert_eq!(
                decision.estimated_tokens,
                SelectionConfig::default().default_estimated_tokens
            );
        }
    }

    #[tokio::test]
    async fn test_oracle_naming_unknown_model_falls_back() {
        let oracle = MockOracle::new();
        oracle.push_recommendation("model-z", 100);
        let (_ledger, selector) = fixture(oracle).await;

        let decision = selector.select("task").await.unwrap();
        assert_eq!(decision.model, "model-a");
        // The oracle's estimate survives into the fallback.
        assert_eq!(decision.estimated_tokens, 100);
    }

    #[tokio::test]
    async fn test_empty_candidate_set_is_capacity_exhausted() {
        let oracle = MockOracle::new();
        let ledger = Arc::new(InMemoryLedger::new());
        let registry = Arc::new(ProviderRegistry::new());
        let selector = CandidateSelector::new(
            ledger,
            registry,
            Arc::new(oracle),
            SelectionConfig::default(),
        );

        let err = selector.select("task").await.unwrap_err();
        assert!(matches!(err, SwitchboardError::CapacityExhausted));
    }

    #[tokio::test]
    async fn test_unroutable_origin_is_filtered() {
        let oracle = MockOracle::new();
        let ledger = Arc::new(InMemoryLedger::new());
        ledger
            .upsert_models(vec![
                descriptor("model-a", "alpha", 1, 5),
                descriptor("model-x", "ghost", 0, 5),
            ])
            .await
            .unwrap();

        let registry = Arc::new(ProviderRegistry::new());
        registry.register("alpha", Arc::new(MockProvider::new()));

        let selector = CandidateSelector::new(
            ledger,
            registry,
            Arc::new(oracle),
            SelectionConfig::default(),
        );

        let candidates = selector.candidates().await.unwrap();
        let names: Vec<&str> = candidates.iter().map(|c| c.name()).collect();
        // model-x outranks model-a but its origin has no provider.
        assert_eq!(names, vec!["model-a"]);
    }

    #[tokio::test]
    async fn test_failure_rate_threshold_filters_candidates() {
        let oracle = MockOracle::new();
        let (ledger, selector) = fixture(oracle).await;

        for _ in 0..3 {
            ledger
                .record_outcome(OutcomeRecord {
                    model: "model-a".to_string(),
                    task_type: "chat".to_string(),
                    success: false,
                    tokens_used: 0,
                    error_message: Some("boom".to_string()),
                })
                .await
                .unwrap();
        }

        let candidates = selector.candidates().await.unwrap();
        let names: Vec<&str> = candidates.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["model-b"]);
    }

    #[tokio::test]
    async fn test_candidate_rendering_reaches_oracle() {
        let oracle = MockOracle::new();
        oracle.push_recommendation("model-b", 100);
        let (_ledger, selector) = fixture(oracle.clone()).await;

        selector.select("task").await.unwrap();

        let consultations = oracle.consultations();
        assert_eq!(consultations.len(), 1);
        assert!(consultations[0].contains("model-a (origin alpha, rank 1)"));
        assert!(consultations[0].contains("lifetime success 100.0%"));
    }

    #[tokio::test]
    async fn test_fallback_skips_candidates_without_headroom() {
        let oracle = MockOracle::new();
        // Estimate so large that model-a's minute window cannot hold it.
        oracle.push_text(
            r#"{"model": "model-z", "estimated_tokens": 120000, "reasoning": "r"}"#,
        );

        let ledger = Arc::new(InMemoryLedger::new());
        let mut big = descriptor("model-big", "alpha", 2, 5);
        big.tpm_total = 200_000;
        big.tpd_total = 2_000_000;
        ledger
            .upsert_models(vec![descriptor("model-a", "alpha", 1, 5), big])
            .await
            .unwrap();

        let registry = Arc::new(ProviderRegistry::new());
        registry.register("alpha", Arc::new(MockProvider::new()));
        let selector = CandidateSelector::new(
            ledger,
            registry,
            Arc::new(oracle),
            SelectionConfig::default(),
        );

        // model-z is unknown, so the fallback runs with the 120k estimate;
        // only model-big clears estimate + buffer.
        let decision = selector.select("task").await.unwrap();
        assert_eq!(decision.model, "model-big");
        assert_eq!(decision.estimated_tokens, 120_000);
    }
}
