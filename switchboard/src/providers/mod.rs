//! Provider abstraction and registry.
//!
//! A [`Provider`] turns a prompt into generated content for one origin's
//! models. The [`ProviderRegistry`] is an explicit origin-keyed capability
//! map, built and validated once at startup. Origins without usable
//! credentials are simply never registered, so their models never become
//! routing candidates while every other origin keeps working.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::OriginConfig;
use crate::error::{Result, SwitchboardError};

pub mod http;
pub mod mock;

pub use http::HttpProvider;
pub use mock::{MockGenerateCall, MockProvider};

/// Generated content returned by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    /// The generated text
    pub text: String,

    /// Token count reported by the provider, when it reports one.
    ///
    /// Absent for providers that do not return usage accounting; callers
    /// fall back to a length-based estimate.
    pub tokens_used: Option<u64>,
}

/// Content-generation capability for one origin.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Generate content for `prompt` on the named model.
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        temperature: Option<f32>,
    ) -> Result<Generation>;
}

/// Origin-keyed map of registered providers.
///
/// Resolution is by origin string against providers registered up front;
/// there is no reflective or lazy lookup at routing time.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: Arc<DashMap<String, Arc<dyn Provider>>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configured origins.
    ///
    /// Origins without an API key are skipped with a warning; their models
    /// stay out of every candidate set but do not affect other origins.
    pub fn from_config(origins: &[OriginConfig]) -> Self {
        let registry = Self::new();

        for origin in origins {
            if origin.api_key.is_empty() {
                tracing::warn!(
                    origin = %origin.name,
                    "origin has no API key, its models will not be routable"
                );
                continue;
            }
            registry.register(
                &origin.name,
                Arc::new(HttpProvider::new(&origin.endpoint, &origin.api_key)),
            );
            tracing::info!(origin = %origin.name, endpoint = %origin.endpoint, "registered provider");
        }

        registry
    }

    /// Register a provider for an origin, replacing any existing entry.
    pub fn register(&self, origin: &str, provider: Arc<dyn Provider>) {
        self.providers.insert(origin.to_string(), provider);
    }

    /// Resolve the provider for an origin.
    ///
    /// # Errors
    /// - `Configuration` if the origin has no registered provider
    pub fn get(&self, origin: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(origin)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SwitchboardError::Configuration(origin.to_string()))
    }

    /// Whether an origin has a registered provider.
    pub fn contains(&self, origin: &str) -> bool {
        self.providers.contains_key(origin)
    }

    /// Names of all registered origins.
    pub fn origins(&self) -> Vec<String> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
