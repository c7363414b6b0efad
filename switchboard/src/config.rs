//! Application configuration.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides: variables prefixed with `SWITCHBOARD_` override YAML values,
//! with double underscores for nesting (`SWITCHBOARD_ROUTING__MAX_ATTEMPTS=2`
//! sets `routing.max_attempts`).
//!
//! The seed catalog of models is grouped by origin; each origin carries the
//! endpoint and credentials its provider needs, and each model its rank,
//! description and quota ceilings. The catalog is applied once at startup
//! via `upsert_models`.
//!
//! ```yaml
//! selection:
//!   failure_rate_threshold: 50.0
//!   failure_window: 5m
//! routing:
//!   provider_timeout: 2m
//! origins:
//!   - name: openai
//!     endpoint: https://api.openai.com
//!     api_key: sk-...
//!     models:
//!       - name: gpt-4o
//!         rank: 1
//!         description: strongest general model
//!         rpm_allowed: 60
//!         tpm_total: 100000
//!         rpd_total: 5000
//!         tpd_total: 2000000
//! ```

use anyhow::anyhow;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SwitchboardError};
use crate::maintenance::MaintenanceConfig;
use crate::router::RoutingConfig;
use crate::selector::SelectionConfig;
use crate::types::ModelDescriptor;

/// Root configuration for the routing engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Selection-strategy parameters
    pub selection: SelectionConfig,

    /// Routing and retry parameters
    pub routing: RoutingConfig,

    /// Background prune settings
    pub maintenance: MaintenanceConfig,

    /// Seed catalog, grouped by origin
    pub origins: Vec<OriginConfig>,
}

/// One upstream origin and the models it serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OriginConfig {
    /// Origin name, referenced by model records
    pub name: String,

    /// Base URL of the origin's API
    pub endpoint: String,

    /// API key; an empty key leaves the origin unregistered and its models
    /// unroutable
    #[serde(default)]
    pub api_key: String,

    /// Models served by this origin
    #[serde(default)]
    pub models: Vec<ModelSeed>,
}

/// A model entry in the seed catalog. The owning origin is implied by the
/// enclosing [`OriginConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSeed {
    pub name: String,
    pub rank: i32,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub rpm_allowed: u32,
    pub tpm_total: u64,
    pub rpd_total: u32,
    pub tpd_total: u64,
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file merged with `SWITCHBOARD_`
    /// environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("SWITCHBOARD_").split("__"))
            .extract()
            .map_err(|e| SwitchboardError::Other(anyhow!("failed to load configuration: {e}")))
    }

    /// Flatten the origin-grouped catalog into upsertable descriptors.
    pub fn seed_catalog(&self) -> Vec<ModelDescriptor> {
        self.origins
            .iter()
            .flat_map(|origin| {
                origin.models.iter().map(|seed| ModelDescriptor {
                    name: seed.name.clone(),
                    origin: origin.name.clone(),
                    rank: seed.rank,
                    description: seed.description.clone(),
                    enabled: seed.enabled,
                    rpm_allowed: seed.rpm_allowed,
                    tpm_total: seed.tpm_total,
                    rpd_total: seed.rpd_total,
                    tpd_total: seed.tpd_total,
                })
            })
            .collect()
    }
}
