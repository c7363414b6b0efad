//! Mock provider for testing.
//!
//! Replays scripted results in FIFO order per model and records every call,
//! so tests can assert on attempt ordering without real network traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Result, SwitchboardError};

use super::{Generation, Provider};

/// Record of a call made to the mock provider.
#[derive(Debug, Clone)]
pub struct MockGenerateCall {
    pub model: String,
    pub prompt: String,
    pub temperature: Option<f32>,
}

/// Mock implementation of [`Provider`].
///
/// # Example
/// ```ignore
/// let mock = MockProvider::new();
/// mock.succeed_with("gpt-4o", "the answer", Some(42));
/// mock.fail_with("gpt-4o", "rate limited");
/// ```
#[derive(Clone, Default)]
pub struct MockProvider {
    responses: Arc<Mutex<HashMap<String, Vec<Result<Generation>>>>>,
    calls: Arc<Mutex<Vec<MockGenerateCall>>>,
    delay: Arc<Mutex<Option<Duration>>>,
}

impl MockProvider {
    /// Create a new mock provider with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted result for a model. Results are replayed FIFO.
    pub fn add_response(&self, model: &str, response: Result<Generation>) {
        self.responses
            .lock()
            .entry(model.to_string())
            .or_default()
            .push(response);
    }

    /// Queue a successful generation.
    pub fn succeed_with(&self, model: &str, text: &str, tokens_used: Option<u64>) {
        self.add_response(
            model,
            Ok(Generation {
                text: text.to_string(),
                tokens_used,
            }),
        );
    }

    /// Queue a provider-reported failure.
    pub fn fail_with(&self, model: &str, message: &str) {
        self.add_response(
            model,
            Err(SwitchboardError::ProviderExecution {
                model: model.to_string(),
                message: message.to_string(),
            }),
        );
    }

    /// Delay every call by `delay` before answering, to exercise timeouts.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// All calls made to this provider, in order.
    pub fn calls(&self) -> Vec<MockGenerateCall> {
        self.calls.lock().clone()
    }

    /// Number of calls made.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        temperature: Option<f32>,
    ) -> Result<Generation> {
        self.calls.lock().push(MockGenerateCall {
            model: model.to_string(),
            prompt: prompt.to_string(),
            temperature,
        });

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut responses = self.responses.lock();
        if let Some(queue) = responses.get_mut(model) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }

        Err(SwitchboardError::ProviderExecution {
            model: model.to_string(),
            message: format!("no mock response configured for model {model}"),
        })
    }
}
