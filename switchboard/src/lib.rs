//! Quota-aware routing engine for generative-model providers.
//!
//! This crate routes incoming tasks to one of several interchangeable
//! providers:
//! - Tracks per-model quotas over sliding time windows in a persistent
//!   ledger (in-memory, or PostgreSQL behind the `postgres` feature)
//! - Builds a ranked candidate set filtered by capacity, origin
//!   routability and recent failure rate
//! - Consults a pluggable decision oracle and repairs its answer with a
//!   deterministic fallback when it is missing, malformed or infeasible
//! - Executes with bounded retry-with-fallback: at most three distinct
//!   models are tried per task
//!
//! # Example
//! ```ignore
//! use switchboard::{Config, InMemoryLedger, MockOracle, Switchboard};
//!
//! let config = Config::load("config.yaml")?;
//! let engine = Switchboard::new(config, InMemoryLedger::new(), oracle).await?;
//!
//! let handle = engine.run_maintenance();
//! let result = engine.execute_task("summarize this report", "chat").await?;
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;

pub mod config;
pub mod error;
pub mod ledger;
pub mod maintenance;
pub mod oracle;
pub mod providers;
pub mod router;
pub mod selector;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ModelSeed, OriginConfig};
pub use error::{Result, SwitchboardError};
pub use ledger::in_memory::InMemoryLedger;
#[cfg(feature = "postgres")]
pub use ledger::postgres::PostgresLedger;
pub use ledger::QuotaLedger;
pub use maintenance::{MaintenanceConfig, MaintenanceDaemon};
pub use oracle::{DecisionOracle, MockOracle, ProviderOracle, ORACLE_SYSTEM_PROMPT};
pub use providers::{Generation, HttpProvider, MockProvider, Provider, ProviderRegistry};
pub use router::{RoutingConfig, TaskRouter};
pub use selector::{CandidateSelector, SelectionConfig};
pub use types::*;

/// Wiring facade: builds the registry from configuration, seeds the model
/// catalog, and exposes task execution plus background maintenance.
///
/// The ledger and oracle are passed in explicitly so deployments can choose
/// backends and tests can substitute fakes.
pub struct Switchboard<L, O: ?Sized> {
    ledger: Arc<L>,
    registry: Arc<ProviderRegistry>,
    router: TaskRouter<L, O>,
    maintenance: MaintenanceConfig,
}

impl<L, O> Switchboard<L, O>
where
    L: QuotaLedger + 'static,
    O: DecisionOracle + ?Sized,
{
    /// Wire up the engine: register providers for configured origins, apply
    /// the seed catalog, and construct the selector and router.
    pub async fn new(config: Config, ledger: L, oracle: Arc<O>) -> Result<Self> {
        let ledger = Arc::new(ledger);
        let registry = Arc::new(ProviderRegistry::from_config(&config.origins));

        let catalog = config.seed_catalog();
        tracing::info!(models = catalog.len(), "seeding model catalog");
        ledger.upsert_models(catalog).await?;

        for model in ledger.list_models().await? {
            if !registry.contains(&model.origin) {
                tracing::warn!(
                    model = %model.name,
                    origin = %model.origin,
                    "model's origin has no provider and will not be routable"
                );
            }
        }

        let selector = CandidateSelector::new(
            ledger.clone(),
            registry.clone(),
            oracle,
            config.selection.clone(),
        );
        let router = TaskRouter::new(
            ledger.clone(),
            registry.clone(),
            selector,
            config.routing.clone(),
        );

        Ok(Self {
            ledger,
            registry,
            router,
            maintenance: config.maintenance,
        })
    }

    /// Execute one task. See [`TaskRouter::execute`].
    pub async fn execute_task(&self, task: &str, task_type: &str) -> Result<TaskResult> {
        self.router.execute(task, task_type).await
    }

    /// Spawn the background prune loop, if maintenance is enabled.
    pub fn run_maintenance(&self) -> Option<JoinHandle<()>> {
        if !self.maintenance.enabled {
            tracing::info!("maintenance daemon disabled by configuration");
            return None;
        }
        Some(MaintenanceDaemon::new(self.ledger.clone(), self.maintenance.clone()).run())
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &TaskRouter<L, O> {
        &self.router
    }
}
