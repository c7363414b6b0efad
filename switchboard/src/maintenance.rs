//! Background maintenance: periodic pruning of expired ledger events.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::ledger::QuotaLedger;

/// Configuration for the maintenance daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaintenanceConfig {
    /// Whether the prune loop runs at all
    pub enabled: bool,

    /// How often to prune expired events
    #[serde(with = "humantime_serde")]
    pub prune_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prune_interval: Duration::from_secs(3_600),
        }
    }
}

/// Daemon that prunes usage events past 24 hours and outcome events past
/// 7 days on a fixed interval.
pub struct MaintenanceDaemon<L> {
    ledger: Arc<L>,
    config: MaintenanceConfig,
}

impl<L> MaintenanceDaemon<L>
where
    L: QuotaLedger + 'static,
{
    pub fn new(ledger: Arc<L>, config: MaintenanceConfig) -> Self {
        Self { ledger, config }
    }

    /// Spawn the prune loop. The first prune runs immediately.
    pub fn run(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.prune_interval);
            loop {
                interval.tick().await;
                match self.ledger.prune_expired().await {
                    Ok(report) if report.total() > 0 => {
                        tracing::info!(
                            usage_events_removed = report.usage_events_removed,
                            outcome_events_removed = report.outcome_events_removed,
                            "pruned expired ledger events"
                        );
                    }
                    Ok(_) => {
                        tracing::trace!("prune pass found nothing to remove");
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "prune pass failed");
                    }
                }
            }
        })
    }
}
