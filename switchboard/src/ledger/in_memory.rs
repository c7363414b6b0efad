//! In-memory ledger implementation.
//!
//! Stores model records and event logs behind a single `RwLock`, which makes
//! `record_outcome` atomic by construction: the event append and the counter
//! bump happen inside one write-lock critical section. Suitable for tests
//! and single-process deployments. History is lost on restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::{Result, SwitchboardError};
use crate::types::{
    Model, ModelAvailability, ModelDescriptor, OutcomeEvent, OutcomeRecord, PruneReport,
    UsageEvent, UsageSnapshot, DAY_WINDOW_SECS, MINUTE_WINDOW_SECS, OUTCOME_RETENTION_SECS,
    USAGE_RETENTION_SECS,
};

use super::QuotaLedger;

#[derive(Default)]
struct LedgerInner {
    models: HashMap<String, Model>,
    usage: Vec<UsageEvent>,
    outcomes: Vec<OutcomeEvent>,
}

impl LedgerInner {
    fn usage_snapshot(&self, model: &str, now: DateTime<Utc>) -> UsageSnapshot {
        let minute_cutoff = now - chrono::Duration::seconds(MINUTE_WINDOW_SECS);
        let day_cutoff = now - chrono::Duration::seconds(DAY_WINDOW_SECS);

        let mut snapshot = UsageSnapshot::default();
        for event in self.usage.iter().filter(|e| e.model == model) {
            if event.recorded_at >= day_cutoff {
                snapshot.requests_day += event.requests;
                snapshot.tokens_day += event.tokens;
                if event.recorded_at >= minute_cutoff {
                    snapshot.requests_minute += event.requests;
                    snapshot.tokens_minute += event.tokens;
                }
            }
        }
        snapshot
    }
}

/// In-memory implementation of the [`QuotaLedger`] trait.
///
/// # Example
/// ```ignore
/// let ledger = InMemoryLedger::new();
/// ledger.upsert_models(catalog).await?;
/// ledger.record_usage("gpt-4o", 1, 350).await?;
/// let available = ledger.list_available(500).await?;
/// ```
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    inner: Arc<RwLock<LedgerInner>>,
}

impl InMemoryLedger {
    /// Create a new, empty in-memory ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// All usage events currently retained, oldest first.
    ///
    /// Diagnostic view; the quota math never reads events outside the
    /// sliding windows.
    pub fn usage_events(&self) -> Vec<UsageEvent> {
        self.inner.read().usage.clone()
    }

    /// All outcome events currently retained, oldest first.
    pub fn outcome_events(&self) -> Vec<OutcomeEvent> {
        self.inner.read().outcomes.clone()
    }
}

#[cfg(test)]
impl InMemoryLedger {
    /// Rewrite the timestamps of every stored event for `model` to `age`
    /// before now, simulating the passage of time.
    pub(crate) fn backdate_events(&self, model: &str, age: chrono::Duration) {
        let stamp = Utc::now() - age;
        let mut inner = self.inner.write();
        for event in inner.usage.iter_mut().filter(|e| e.model == model) {
            event.recorded_at = stamp;
        }
        for event in inner.outcomes.iter_mut().filter(|e| e.model == model) {
            event.recorded_at = stamp;
        }
    }
}

impl QuotaLedger for InMemoryLedger {
    async fn upsert_models(&self, descriptors: Vec<ModelDescriptor>) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.write();

        for descriptor in descriptors {
            match inner.models.get_mut(&descriptor.name) {
                Some(existing) => {
                    existing.origin = descriptor.origin;
                    existing.rank = descriptor.rank;
                    existing.description = descriptor.description;
                    existing.enabled = descriptor.enabled;
                    existing.rpm_allowed = descriptor.rpm_allowed;
                    existing.tpm_total = descriptor.tpm_total;
                    existing.rpd_total = descriptor.rpd_total;
                    existing.tpd_total = descriptor.tpd_total;
                    existing.updated_at = now;
                }
                None => {
                    inner.models.insert(
                        descriptor.name.clone(),
                        Model {
                            name: descriptor.name,
                            origin: descriptor.origin,
                            rank: descriptor.rank,
                            description: descriptor.description,
                            enabled: descriptor.enabled,
                            rpm_allowed: descriptor.rpm_allowed,
                            tpm_total: descriptor.tpm_total,
                            rpd_total: descriptor.rpd_total,
                            tpd_total: descriptor.tpd_total,
                            successful_tasks: 0,
                            failed_tasks: 0,
                            created_at: now,
                            updated_at: now,
                        },
                    );
                }
            }
        }

        Ok(())
    }

    async fn record_usage(&self, model: &str, requests: u32, tokens: u64) -> Result<()> {
        let event = UsageEvent {
            model: model.to_string(),
            requests,
            tokens,
            recorded_at: Utc::now(),
        };
        self.inner.write().usage.push(event);
        Ok(())
    }

    async fn record_outcome(&self, outcome: OutcomeRecord) -> Result<()> {
        let mut inner = self.inner.write();

        let Some(model) = inner.models.get_mut(&outcome.model) else {
            return Err(SwitchboardError::ModelNotFound(outcome.model));
        };

        if outcome.success {
            model.successful_tasks += 1;
        } else {
            model.failed_tasks += 1;
        }
        model.updated_at = Utc::now();

        inner.outcomes.push(OutcomeEvent {
            model: outcome.model,
            task_type: outcome.task_type,
            success: outcome.success,
            error_message: outcome.error_message,
            tokens_used: outcome.tokens_used,
            recorded_at: Utc::now(),
        });

        Ok(())
    }

    async fn get_usage(&self, model: &str) -> Result<UsageSnapshot> {
        Ok(self.inner.read().usage_snapshot(model, Utc::now()))
    }

    async fn list_available(&self, min_tokens: u64) -> Result<Vec<ModelAvailability>> {
        let now = Utc::now();
        let inner = self.inner.read();

        let mut available: Vec<ModelAvailability> = inner
            .models
            .values()
            .filter(|m| m.enabled)
            .map(|m| ModelAvailability {
                model: m.clone(),
                usage: inner.usage_snapshot(&m.name, now),
            })
            .filter(|a| a.has_capacity_for(min_tokens))
            .collect();

        available.sort_by(|a, b| {
            (a.model.rank, &a.model.name).cmp(&(b.model.rank, &b.model.name))
        });

        Ok(available)
    }

    async fn failure_rate(&self, model: &str, window: Duration) -> Result<f64> {
        let cutoff = Utc::now() - chrono::Duration::seconds(window.as_secs() as i64);
        let inner = self.inner.read();

        let mut total = 0u64;
        let mut failed = 0u64;
        for event in inner
            .outcomes
            .iter()
            .filter(|e| e.model == model && e.recorded_at >= cutoff)
        {
            total += 1;
            if !event.success {
                failed += 1;
            }
        }

        if total == 0 {
            return Ok(0.0);
        }
        Ok(failed as f64 / total as f64 * 100.0)
    }

    async fn get_model(&self, name: &str) -> Result<Option<Model>> {
        Ok(self.inner.read().models.get(name).cloned())
    }

    async fn list_models(&self) -> Result<Vec<Model>> {
        let inner = self.inner.read();
        let mut models: Vec<Model> = inner.models.values().cloned().collect();
        models.sort_by(|a, b| (a.rank, &a.name).cmp(&(b.rank, &b.name)));
        Ok(models)
    }

    async fn prune_expired(&self) -> Result<PruneReport> {
        let now = Utc::now();
        let usage_cutoff = now - chrono::Duration::seconds(USAGE_RETENTION_SECS);
        let outcome_cutoff = now - chrono::Duration::seconds(OUTCOME_RETENTION_SECS);

        let mut inner = self.inner.write();

        let usage_before = inner.usage.len();
        inner.usage.retain(|e| e.recorded_at >= usage_cutoff);
        let outcomes_before = inner.outcomes.len();
        inner.outcomes.retain(|e| e.recorded_at >= outcome_cutoff);

        Ok(PruneReport {
            usage_events_removed: (usage_before - inner.usage.len()) as u64,
            outcome_events_removed: (outcomes_before - inner.outcomes.len()) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn descriptor(name: &str, rank: i32) -> ModelDescriptor {
        ModelDescriptor {
            name: name.to_string(),
            origin: "test-origin".to_string(),
            rank,
            description: String::new(),
            enabled: true,
            rpm_allowed: 10,
            tpm_total: 10_000,
            rpd_total: 100,
            tpd_total: 100_000,
        }
    }

    fn outcome(model: &str, success: bool) -> OutcomeRecord {
        OutcomeRecord {
            model: model.to_string(),
            task_type: "chat".to_string(),
            success,
            tokens_used: 100,
            error_message: (!success).then(|| "upstream error".to_string()),
        }
    }

    async fn seeded_ledger() -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        ledger
            .upsert_models(vec![descriptor("model-a", 1), descriptor("model-b", 2)])
            .await
            .unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_usage_sums_within_windows() {
        let ledger = seeded_ledger().await;

        ledger.record_usage("model-a", 1, 100).await.unwrap();
        ledger.record_usage("model-a", 2, 250).await.unwrap();
        ledger.record_usage("model-b", 1, 999).await.unwrap();

        let usage = ledger.get_usage("model-a").await.unwrap();
        assert_eq!(usage.requests_minute, 3);
        assert_eq!(usage.tokens_minute, 350);
        assert_eq!(usage.requests_day, 3);
        assert_eq!(usage.tokens_day, 350);
    }

    #[tokio::test]
    async fn test_minute_window_expires_day_window_persists() {
        let ledger = seeded_ledger().await;

        ledger.record_usage("model-a", 2, 400).await.unwrap();
        ledger.backdate_events("model-a", chrono::Duration::seconds(120));

        let usage = ledger.get_usage("model-a").await.unwrap();
        assert_eq!(usage.requests_minute, 0);
        assert_eq!(usage.tokens_minute, 0);
        assert_eq!(usage.requests_day, 2);
        assert_eq!(usage.tokens_day, 400);
    }

    #[tokio::test]
    async fn test_day_window_expires() {
        let ledger = seeded_ledger().await;

        ledger.record_usage("model-a", 2, 400).await.unwrap();
        ledger.backdate_events("model-a", chrono::Duration::seconds(DAY_WINDOW_SECS + 60));

        let usage = ledger.get_usage("model-a").await.unwrap();
        assert_eq!(usage, UsageSnapshot::default());
    }

    #[tokio::test]
    async fn test_list_available_excludes_disabled() {
        let ledger = seeded_ledger().await;

        let mut disabled = descriptor("model-a", 1);
        disabled.enabled = false;
        ledger.upsert_models(vec![disabled]).await.unwrap();

        let available = ledger.list_available(1).await.unwrap();
        let names: Vec<&str> = available.iter().map(|a| a.model.name.as_str()).collect();
        assert_eq!(names, vec!["model-b"]);
    }

    #[rstest]
    #[case::rpm_exhausted(10, 0)]
    #[case::tpm_exhausted(1, 10_000)]
    #[tokio::test]
    async fn test_list_available_excludes_minute_quota_exhaustion(
        #[case] requests: u32,
        #[case] tokens: u64,
    ) {
        let ledger = seeded_ledger().await;
        ledger.record_usage("model-a", requests, tokens).await.unwrap();

        let available = ledger.list_available(1).await.unwrap();
        let names: Vec<&str> = available.iter().map(|a| a.model.name.as_str()).collect();
        assert_eq!(names, vec!["model-b"]);
    }

    #[rstest]
    #[case::rpd_exhausted(100, 0)]
    #[case::tpd_exhausted(1, 100_000)]
    #[tokio::test]
    async fn test_list_available_excludes_day_quota_exhaustion(
        #[case] requests: u32,
        #[case] tokens: u64,
    ) {
        let ledger = seeded_ledger().await;

        // Old enough to fall out of the minute window but not the day window.
        ledger.record_usage("model-a", requests, tokens).await.unwrap();
        ledger.backdate_events("model-a", chrono::Duration::seconds(300));

        let available = ledger.list_available(1).await.unwrap();
        let names: Vec<&str> = available.iter().map(|a| a.model.name.as_str()).collect();
        assert_eq!(names, vec!["model-b"]);
    }

    #[tokio::test]
    async fn test_list_available_token_threshold() {
        let ledger = seeded_ledger().await;

        // 9_500 tokens left this minute on model-a.
        ledger.record_usage("model-a", 1, 500).await.unwrap();

        let available = ledger.list_available(9_500).await.unwrap();
        assert_eq!(available.len(), 2);

        let available = ledger.list_available(9_501).await.unwrap();
        let names: Vec<&str> = available.iter().map(|a| a.model.name.as_str()).collect();
        assert_eq!(names, vec!["model-b"]);
    }

    #[tokio::test]
    async fn test_list_available_sorted_by_rank() {
        let ledger = InMemoryLedger::new();
        ledger
            .upsert_models(vec![
                descriptor("model-c", 3),
                descriptor("model-a", 1),
                descriptor("model-b", 2),
            ])
            .await
            .unwrap();

        let available = ledger.list_available(1).await.unwrap();
        let names: Vec<&str> = available.iter().map(|a| a.model.name.as_str()).collect();
        assert_eq!(names, vec!["model-a", "model-b", "model-c"]);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let ledger = seeded_ledger().await;

        ledger.record_outcome(outcome("model-a", true)).await.unwrap();
        ledger.record_outcome(outcome("model-a", false)).await.unwrap();
        ledger.record_usage("model-a", 1, 100).await.unwrap();

        let catalog = vec![descriptor("model-a", 1), descriptor("model-b", 2)];
        ledger.upsert_models(catalog.clone()).await.unwrap();
        ledger.upsert_models(catalog).await.unwrap();

        let model = ledger.get_model("model-a").await.unwrap().unwrap();
        assert_eq!(model.successful_tasks, 1);
        assert_eq!(model.failed_tasks, 1);
        assert_eq!(model.rank, 1);

        let usage = ledger.get_usage("model-a").await.unwrap();
        assert_eq!(usage.requests_day, 1);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_configuration() {
        let ledger = seeded_ledger().await;

        let mut updated = descriptor("model-a", 5);
        updated.description = "updated".to_string();
        updated.tpm_total = 99;
        ledger.upsert_models(vec![updated]).await.unwrap();

        let model = ledger.get_model("model-a").await.unwrap().unwrap();
        assert_eq!(model.rank, 5);
        assert_eq!(model.description, "updated");
        assert_eq!(model.tpm_total, 99);
    }

    #[tokio::test]
    async fn test_record_outcome_updates_counters_atomically() {
        let ledger = seeded_ledger().await;

        ledger.record_outcome(outcome("model-a", true)).await.unwrap();
        ledger.record_outcome(outcome("model-a", true)).await.unwrap();
        ledger.record_outcome(outcome("model-a", false)).await.unwrap();

        let model = ledger.get_model("model-a").await.unwrap().unwrap();
        assert_eq!(model.successful_tasks, 2);
        assert_eq!(model.failed_tasks, 1);
        assert_eq!(ledger.outcome_events().len(), 3);
    }

    #[tokio::test]
    async fn test_record_outcome_unknown_model() {
        let ledger = seeded_ledger().await;

        let result = ledger.record_outcome(outcome("nope", true)).await;
        assert!(matches!(result, Err(SwitchboardError::ModelNotFound(_))));
        assert!(ledger.outcome_events().is_empty());
    }

    #[tokio::test]
    async fn test_failure_rate_empty_window_is_zero() {
        let ledger = seeded_ledger().await;
        let rate = ledger
            .failure_rate("model-a", Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(rate, 0.0);
    }

    #[tokio::test]
    async fn test_failure_rate_all_failures_is_hundred() {
        let ledger = seeded_ledger().await;

        ledger.record_outcome(outcome("model-a", false)).await.unwrap();
        ledger.record_outcome(outcome("model-a", false)).await.unwrap();

        let rate = ledger
            .failure_rate("model-a", Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(rate, 100.0);
    }

    #[tokio::test]
    async fn test_failure_rate_mixed_and_windowed() {
        let ledger = seeded_ledger().await;

        // Two old failures that should age out of the window below.
        ledger.record_outcome(outcome("model-a", false)).await.unwrap();
        ledger.record_outcome(outcome("model-a", false)).await.unwrap();
        ledger.backdate_events("model-a", chrono::Duration::seconds(600));

        ledger.record_outcome(outcome("model-a", true)).await.unwrap();
        ledger.record_outcome(outcome("model-a", false)).await.unwrap();

        let rate = ledger
            .failure_rate("model-a", Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(rate, 50.0);

        let rate = ledger
            .failure_rate("model-a", Duration::from_secs(3_600))
            .await
            .unwrap();
        assert_eq!(rate, 75.0);
    }

    #[tokio::test]
    async fn test_prune_expired_respects_retention() {
        let ledger = seeded_ledger().await;

        // model-a history will be pushed past both retention horizons;
        // model-b history stays fresh.
        ledger.record_usage("model-a", 1, 100).await.unwrap();
        ledger.record_outcome(outcome("model-a", true)).await.unwrap();
        ledger.backdate_events("model-a", chrono::Duration::days(8));

        ledger.record_usage("model-b", 1, 200).await.unwrap();
        ledger.record_outcome(outcome("model-b", true)).await.unwrap();

        let report = ledger.prune_expired().await.unwrap();
        assert_eq!(report.usage_events_removed, 1);
        assert_eq!(report.outcome_events_removed, 1);

        let usage = ledger.get_usage("model-b").await.unwrap();
        assert_eq!(usage.tokens_day, 200);
        assert_eq!(ledger.usage_events().len(), 1);
        assert_eq!(ledger.outcome_events().len(), 1);
    }

    #[tokio::test]
    async fn test_prune_keeps_outcomes_longer_than_usage() {
        let ledger = seeded_ledger().await;

        // Two days old: past usage retention, inside outcome retention.
        ledger.record_usage("model-a", 1, 100).await.unwrap();
        ledger.record_outcome(outcome("model-a", true)).await.unwrap();
        ledger.backdate_events("model-a", chrono::Duration::days(2));

        let report = ledger.prune_expired().await.unwrap();
        assert_eq!(report.usage_events_removed, 1);
        assert_eq!(report.outcome_events_removed, 0);
        assert_eq!(ledger.outcome_events().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_usage_appends() {
        let ledger = Arc::new(seeded_ledger().await);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    ledger.record_usage("model-a", 1, 10).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let usage = ledger.get_usage("model-a").await.unwrap();
        assert_eq!(usage.requests_day, 400);
        assert_eq!(usage.tokens_day, 4_000);
    }
}
