//! Decision oracle: the pluggable capability that recommends a model for a
//! task.
//!
//! The oracle is a black box: its answer arrives as loosely structured text
//! and is extracted by [`parse_decision`] under a strict required-field
//! contract. Anything short of that contract is a [`DecisionParse`] error,
//! which the selector absorbs into its deterministic fallback; extraction is
//! never a best-effort scrape.
//!
//! [`DecisionParse`]: crate::error::SwitchboardError::DecisionParse

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Result, SwitchboardError};
use crate::providers::Provider;
use crate::types::{Complexity, Decision};

/// Instructions sent to the oracle ahead of the candidate description.
pub const ORACLE_SYSTEM_PROMPT: &str = "\
You select the best generative model for a task from a list of candidates.
Weigh rank (lower is preferred), remaining capacity, description and recent
reliability. Answer with a single JSON object and nothing else:
{\"model\": \"<candidate name>\", \"estimated_tokens\": <integer>, \
\"reasoning\": \"<one sentence>\", \"complexity\": \"simple|medium|complex\"}";

/// Capability that recommends a model for a task.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    /// Ask for a recommendation given the rendered candidate set and task.
    ///
    /// # Errors
    /// - `DecisionParse` if the answer violates the required-field contract
    async fn consult(
        &self,
        system_prompt: &str,
        candidates: &str,
        task: &str,
    ) -> Result<Decision>;
}

/// Extract a [`Decision`] from loosely structured oracle output.
///
/// Tolerates surrounding prose and fenced code blocks, but requires the
/// embedded JSON object to carry `model`, `estimated_tokens` and `reasoning`.
/// `complexity` defaults to medium when absent or unrecognized.
pub fn parse_decision(text: &str) -> Result<Decision> {
    let json = extract_json_object(text).ok_or_else(|| {
        SwitchboardError::DecisionParse("no JSON object in oracle answer".to_string())
    })?;

    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| SwitchboardError::DecisionParse(format!("invalid JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| SwitchboardError::DecisionParse("answer is not an object".to_string()))?;

    let model = object
        .get("model")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| missing_field("model"))?;
    let estimated_tokens = object
        .get("estimated_tokens")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| missing_field("estimated_tokens"))?;
    let reasoning = object
        .get("reasoning")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| missing_field("reasoning"))?;
    let complexity = object
        .get("complexity")
        .and_then(serde_json::Value::as_str)
        .map(parse_complexity)
        .unwrap_or_default();

    Ok(Decision {
        model: model.to_string(),
        reasoning: reasoning.to_string(),
        estimated_tokens,
        complexity,
    })
}

fn missing_field(field: &str) -> SwitchboardError {
    SwitchboardError::DecisionParse(format!("missing required field: {field}"))
}

fn parse_complexity(raw: &str) -> Complexity {
    match raw.to_ascii_lowercase().as_str() {
        "simple" | "low" => Complexity::Simple,
        "complex" | "high" => Complexity::Complex,
        _ => Complexity::Medium,
    }
}

/// Locate the first balanced JSON object in `text`, skipping braces inside
/// string literals.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Oracle backed by a registered provider.
///
/// Consults the named model with the system prompt, candidate description
/// and task concatenated, then parses the completion under the strict
/// contract.
pub struct ProviderOracle {
    provider: Arc<dyn Provider>,
    model: String,
}

impl ProviderOracle {
    pub fn new(provider: Arc<dyn Provider>, model: &str) -> Self {
        Self {
            provider,
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl DecisionOracle for ProviderOracle {
    #[tracing::instrument(skip_all, fields(oracle_model = %self.model))]
    async fn consult(
        &self,
        system_prompt: &str,
        candidates: &str,
        task: &str,
    ) -> Result<Decision> {
        let prompt = format!("{system_prompt}\n\n{candidates}\n\nTask:\n{task}");
        let generation = self.provider.generate(&self.model, &prompt, Some(0.0)).await?;
        parse_decision(&generation.text)
    }
}

/// Mock oracle replaying scripted raw answers in FIFO order.
///
/// Answers go through [`parse_decision`] exactly like real oracle output, so
/// malformed-answer paths are exercised end to end.
#[derive(Clone, Default)]
pub struct MockOracle {
    answers: Arc<Mutex<Vec<String>>>,
    consultations: Arc<Mutex<Vec<String>>>,
}

impl MockOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a raw answer text.
    pub fn push_text(&self, text: &str) {
        self.answers.lock().push(text.to_string());
    }

    /// Queue a well-formed answer recommending `model`.
    pub fn push_recommendation(&self, model: &str, estimated_tokens: u64) {
        self.push_text(&format!(
            r#"{{"model": "{model}", "estimated_tokens": {estimated_tokens}, "reasoning": "scripted recommendation", "complexity": "medium"}}"#
        ));
    }

    /// Candidate descriptions from every consultation, in order.
    pub fn consultations(&self) -> Vec<String> {
        self.consultations.lock().clone()
    }
}

#[async_trait]
impl DecisionOracle for MockOracle {
    async fn consult(
        &self,
        _system_prompt: &str,
        candidates: &str,
        _task: &str,
    ) -> Result<Decision> {
        self.consultations.lock().push(candidates.to_string());

        let text = {
            let mut answers = self.answers.lock();
            if answers.is_empty() {
                return Err(SwitchboardError::Other(anyhow::anyhow!(
                    "no scripted oracle answer"
                )));
            }
            answers.remove(0)
        };

        parse_decision(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let decision = parse_decision(
            r#"{"model": "gpt-4o", "estimated_tokens": 800, "reasoning": "fits", "complexity": "complex"}"#,
        )
        .unwrap();

        assert_eq!(decision.model, "gpt-4o");
        assert_eq!(decision.estimated_tokens, 800);
        assert_eq!(decision.complexity, Complexity::Complex);
    }

    #[test]
    fn test_parse_fenced_answer_with_prose() {
        let text = "Looking at the candidates, I recommend:\n```json\n{\"model\": \"small\", \"estimated_tokens\": 120, \"reasoning\": \"cheap and sufficient\"}\n```\nLet me know if that works.";
        let decision = parse_decision(text).unwrap();

        assert_eq!(decision.model, "small");
        assert_eq!(decision.complexity, Complexity::Medium);
    }

    #[test]
    fn test_parse_ignores_braces_inside_strings() {
        let text = r#"{"model": "m", "estimated_tokens": 5, "reasoning": "handles {nested} braces"}"#;
        let decision = parse_decision(text).unwrap();
        assert_eq!(decision.reasoning, "handles {nested} braces");
    }

    #[test]
    fn test_parse_rejects_missing_model() {
        let err = parse_decision(r#"{"estimated_tokens": 5, "reasoning": "r"}"#).unwrap_err();
        assert!(matches!(err, SwitchboardError::DecisionParse(_)));
    }

    #[test]
    fn test_parse_rejects_missing_estimate() {
        let err = parse_decision(r#"{"model": "m", "reasoning": "r"}"#).unwrap_err();
        assert!(matches!(err, SwitchboardError::DecisionParse(_)));
    }

    #[test]
    fn test_parse_rejects_missing_reasoning() {
        let err = parse_decision(r#"{"model": "m", "estimated_tokens": 5}"#).unwrap_err();
        assert!(matches!(err, SwitchboardError::DecisionParse(_)));
    }

    #[test]
    fn test_parse_rejects_non_json() {
        let err = parse_decision("use gpt-4o, it should take about 500 tokens").unwrap_err();
        assert!(matches!(err, SwitchboardError::DecisionParse(_)));
    }

    #[test]
    fn test_parse_rejects_wrong_estimate_type() {
        let err =
            parse_decision(r#"{"model": "m", "estimated_tokens": "lots", "reasoning": "r"}"#)
                .unwrap_err();
        assert!(matches!(err, SwitchboardError::DecisionParse(_)));
    }

    #[test]
    fn test_unrecognized_complexity_defaults_to_medium() {
        let decision = parse_decision(
            r#"{"model": "m", "estimated_tokens": 5, "reasoning": "r", "complexity": "extreme"}"#,
        )
        .unwrap();
        assert_eq!(decision.complexity, Complexity::Medium);
    }

    #[tokio::test]
    async fn test_mock_oracle_parses_scripted_answers() {
        let oracle = MockOracle::new();
        oracle.push_recommendation("gpt-4o", 300);
        oracle.push_text("garbage");

        let decision = oracle.consult("sys", "candidates", "task").await.unwrap();
        assert_eq!(decision.model, "gpt-4o");

        let err = oracle.consult("sys", "candidates", "task").await.unwrap_err();
        assert!(matches!(err, SwitchboardError::DecisionParse(_)));

        assert_eq!(oracle.consultations().len(), 2);
    }
}
