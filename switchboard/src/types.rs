//! Core domain types for the routing engine.
//!
//! Models are seeded from configuration as [`ModelDescriptor`]s and persisted
//! as [`Model`] records. Usage and outcomes are append-only events; windowed
//! "used" values are always recomputed from events inside the current sliding
//! window, never stored as resettable counters. Fixed-interval counters admit
//! a boundary burst (a full quota spent twice straddling a bucket edge);
//! event summation rules it out by construction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Short quota window: usage summed over the trailing 60 seconds.
pub const MINUTE_WINDOW_SECS: i64 = 60;

/// Long quota window: usage summed over the trailing 24 hours.
pub const DAY_WINDOW_SECS: i64 = 86_400;

/// Usage events older than this are eligible for pruning.
pub const USAGE_RETENTION_SECS: i64 = DAY_WINDOW_SECS;

/// Outcome events are retained longer than usage events because they feed
/// failure-rate history.
pub const OUTCOME_RETENTION_SECS: i64 = 7 * 86_400;

/// Seed/upsert form of a model's configuration.
///
/// Created and updated only through [`QuotaLedger::upsert_models`], which
/// merges by unique name; models are never deleted at runtime.
///
/// [`QuotaLedger::upsert_models`]: crate::ledger::QuotaLedger::upsert_models
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Unique model name, e.g. "gpt-4o"
    pub name: String,

    /// Owning origin (upstream vendor), e.g. "openai"
    pub origin: String,

    /// Priority within the origin; lower is preferred
    pub rank: i32,

    /// Free-text description shown to the decision oracle
    #[serde(default)]
    pub description: String,

    /// Disabled models are never execution targets
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Requests allowed per minute
    pub rpm_allowed: u32,

    /// Tokens allowed per minute
    pub tpm_total: u64,

    /// Requests allowed per day
    pub rpd_total: u32,

    /// Tokens allowed per day
    pub tpd_total: u64,
}

fn default_enabled() -> bool {
    true
}

/// A persisted model record: descriptor fields plus derived lifetime
/// aggregates, updated transactionally alongside each outcome insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    pub origin: String,
    pub rank: i32,
    pub description: String,
    pub enabled: bool,
    pub rpm_allowed: u32,
    pub tpm_total: u64,
    pub rpd_total: u32,
    pub tpd_total: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Lifetime success percentage over the aggregate counters.
    ///
    /// A model with no recorded outcomes reports 100 so that fresh models are
    /// not penalized in the candidate description.
    pub fn lifetime_success_rate(&self) -> f64 {
        let total = self.successful_tasks + self.failed_tasks;
        if total == 0 {
            return 100.0;
        }
        self.successful_tasks as f64 / total as f64 * 100.0
    }
}

/// One append-only usage record: a request hit the model, consuming tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub model: String,
    pub requests: u32,
    pub tokens: u64,
    pub recorded_at: DateTime<Utc>,
}

/// One append-only outcome record: a task attempt finished, well or badly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub model: String,
    pub task_type: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub tokens_used: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Input form of an outcome, stamped by the ledger on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeRecord {
    pub model: String,
    pub task_type: String,
    pub success: bool,
    pub tokens_used: u64,
    pub error_message: Option<String>,
}

/// The four windowed sums for a model at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub requests_minute: u32,
    pub tokens_minute: u64,
    pub requests_day: u32,
    pub tokens_day: u64,
}

/// A model paired with its usage snapshot, as returned by `list_available`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelAvailability {
    pub model: Model,
    pub usage: UsageSnapshot,
}

impl ModelAvailability {
    pub fn remaining_rpm(&self) -> u32 {
        self.model.rpm_allowed.saturating_sub(self.usage.requests_minute)
    }

    pub fn remaining_tpm(&self) -> u64 {
        self.model.tpm_total.saturating_sub(self.usage.tokens_minute)
    }

    pub fn remaining_rpd(&self) -> u32 {
        self.model.rpd_total.saturating_sub(self.usage.requests_day)
    }

    pub fn remaining_tpd(&self) -> u64 {
        self.model.tpd_total.saturating_sub(self.usage.tokens_day)
    }

    /// Smallest remaining token allowance across both token windows.
    pub fn token_headroom(&self) -> u64 {
        self.remaining_tpm().min(self.remaining_tpd())
    }

    /// Whether all four quotas can absorb one more request of `min_tokens`
    /// tokens: at least one request left on both request windows, at least
    /// `min_tokens` left on both token windows.
    pub fn has_capacity_for(&self, min_tokens: u64) -> bool {
        self.remaining_rpm() >= 1
            && self.remaining_rpd() >= 1
            && self.remaining_tpm() >= min_tokens
            && self.remaining_tpd() >= min_tokens
    }
}

/// Task complexity as judged by the decision oracle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    #[default]
    Medium,
    Complex,
}

/// The selector's answer: which model to run a task on, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Name of the selected model
    pub model: String,

    /// Why this model was selected
    pub reasoning: String,

    /// Expected token consumption for the task
    pub estimated_tokens: u64,

    /// Task complexity estimate
    #[serde(default)]
    pub complexity: Complexity,
}

/// Terminal result of routing one task.
///
/// Both success and exhaustion are ordinary values; the router never lets a
/// single task's failure escape as an uncaught fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Correlation ID for this execution, present in all related log lines
    pub task_id: Uuid,
    pub success: bool,
    /// Provider response text when `success` is true
    pub response: Option<String>,
    /// Last error message when `success` is false
    pub error: Option<String>,
    /// The model that produced the response, or the last one attempted
    pub model_used: String,
    pub tokens_used: u64,
    /// The original selection decision this execution started from
    pub decision: Decision,
}

/// Row counts removed by a prune pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub usage_events_removed: u64,
    pub outcome_events_removed: u64,
}

impl PruneReport {
    pub fn total(&self) -> u64 {
        self.usage_events_removed + self.outcome_events_removed
    }
}
