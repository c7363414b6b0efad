use thiserror::Error;

/// Result type for switchboard operations.
pub type Result<T> = std::result::Result<T, SwitchboardError>;

/// Errors that can occur in the routing engine.
#[derive(Debug, Error)]
pub enum SwitchboardError {
    /// An origin has no registered provider (missing or unusable credentials)
    #[error("no provider configured for origin: {0}")]
    Configuration(String),

    /// No enabled model has any remaining quota
    #[error("all enabled models are at capacity")]
    CapacityExhausted,

    /// The emergency fallback also found nothing to route to
    #[error("no providers available")]
    NoProvidersAvailable,

    /// The oracle's answer was missing required fields or unparseable.
    ///
    /// Absorbed inside selection; triggers the deterministic fallback and is
    /// never surfaced to the caller of `select`.
    #[error("unparseable oracle decision: {0}")]
    DecisionParse(String),

    /// A provider call failed with a provider-reported error
    #[error("provider execution failed for {model}: {message}")]
    ProviderExecution { model: String, message: String },

    /// A provider call exceeded the configured timeout.
    ///
    /// Distinct from `ProviderExecution` so callers can tell a slow upstream
    /// apart from one that rejected the request.
    #[error("provider call for {model} timed out after {timeout_ms}ms")]
    ProviderTimeout { model: String, timeout_ms: u64 },

    /// Ledger operation against a model that was never seeded
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
