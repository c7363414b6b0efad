//! Persistent quota ledger: model configuration plus append-only usage and
//! outcome events, queried over sliding time windows.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;
use crate::types::{
    Model, ModelAvailability, ModelDescriptor, OutcomeRecord, PruneReport, UsageSnapshot,
};

pub mod in_memory;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Storage contract for the quota ledger.
///
/// The ledger is the only shared mutable resource in the engine. Mutations
/// are atomic and isolated; reads operate on a consistent snapshot at call
/// time but are deliberately not linearized against concurrent writes: a
/// capacity check taken during selection may be stale by the time execution
/// records usage, and the next read simply observes the updated numbers.
pub trait QuotaLedger: Send + Sync {
    /// Idempotently merge model configuration by unique name.
    ///
    /// Overwrites rank, description, enabled flag and quota ceilings; leaves
    /// usage/outcome history and the aggregate counters untouched. Models are
    /// never deleted at runtime.
    fn upsert_models(
        &self,
        descriptors: Vec<ModelDescriptor>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Append one usage event stamped with the current time.
    ///
    /// Pure append, no read-before-write; safe under concurrent callers.
    fn record_usage(
        &self,
        model: &str,
        requests: u32,
        tokens: u64,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Append one outcome event and bump the matching aggregate counter.
    ///
    /// Both effects commit together or not at all.
    ///
    /// # Errors
    /// - `ModelNotFound` if the model was never seeded
    fn record_outcome(&self, outcome: OutcomeRecord) -> impl Future<Output = Result<()>> + Send;

    /// The four windowed sums for a model: requests and tokens over the
    /// trailing 60 seconds, requests and tokens over the trailing 24 hours.
    fn get_usage(&self, model: &str) -> impl Future<Output = Result<UsageSnapshot>> + Send;

    /// Enabled models with remaining capacity on all four quotas, sorted
    /// ascending by rank (ties broken by name).
    ///
    /// The capacity threshold is 1 for the request quotas and `min_tokens`
    /// for the token quotas. Each model is paired with the usage snapshot the
    /// check was made against.
    fn list_available(
        &self,
        min_tokens: u64,
    ) -> impl Future<Output = Result<Vec<ModelAvailability>>> + Send;

    /// Percentage of failed outcomes among all outcomes for the model within
    /// the window; 0.0 when the window holds no events.
    fn failure_rate(
        &self,
        model: &str,
        window: Duration,
    ) -> impl Future<Output = Result<f64>> + Send;

    /// Look up one model record by name.
    fn get_model(&self, name: &str) -> impl Future<Output = Result<Option<Model>>> + Send;

    /// All model records, sorted ascending by rank.
    fn list_models(&self) -> impl Future<Output = Result<Vec<Model>>> + Send;

    /// Delete usage events older than 24 hours and outcome events older than
    /// 7 days, returning how many rows each pass removed.
    fn prune_expired(&self) -> impl Future<Output = Result<PruneReport>> + Send;
}
