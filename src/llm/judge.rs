//! Best-effort judgment of whether results answer the question.
//!
//! The judge asks the model for a strict JSON verdict but parses leniently,
//! since models like to wrap JSON in fences or prose. Callers treat every
//! failure here as "unjudged" and substitute a default confidence.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{GatewayError, GatewayResult};
use crate::llm::client::LlmClient;
use crate::llm::prompts;

/// The model's assessment of how well results answer the question.
#[derive(Debug, Clone)]
pub struct JudgeVerdict {
    /// 0..=100; clamped during parsing.
    pub confidence: u8,
    pub is_acceptable: bool,
    pub explanation: Option<String>,
}

/// Capability to score executed results against the original question.
#[async_trait]
pub trait ResultJudge: Send + Sync {
    async fn judge(
        &self,
        question: &str,
        sql: &str,
        sample_rows: &[Map<String, Value>],
        total_count: usize,
    ) -> GatewayResult<JudgeVerdict>;
}

/// [`ResultJudge`] backed by an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct LlmResultJudge {
    client: Arc<LlmClient>,
}

impl LlmResultJudge {
    pub fn new(client: Arc<LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResultJudge for LlmResultJudge {
    async fn judge(
        &self,
        question: &str,
        sql: &str,
        sample_rows: &[Map<String, Value>],
        total_count: usize,
    ) -> GatewayResult<JudgeVerdict> {
        let user = prompts::result_judgment_user(question, sql, sample_rows, total_count);
        let completion = self
            .client
            .complete(prompts::RESULT_JUDGMENT_SYSTEM, &user)
            .await?;
        parse_verdict(&completion.content)
    }
}

/// What the model is asked to return. `is_acceptable` is derived from the
/// confidence when the model omits it.
#[derive(Debug, Deserialize)]
struct RawVerdict {
    confidence: f64,
    #[serde(default)]
    is_acceptable: Option<bool>,
    #[serde(default)]
    explanation: Option<String>,
}

/// Parses a verdict out of a completion, tolerating fences and surrounding
/// prose. Fails only when no JSON object with a `confidence` field is found.
pub fn parse_verdict(content: &str) -> GatewayResult<JudgeVerdict> {
    let json = extract_json_object(content).ok_or_else(|| {
        GatewayError::llm_error("Judgment response contained no JSON object")
    })?;
    let raw: RawVerdict = serde_json::from_str(json).map_err(|e| {
        GatewayError::llm_error(format!("Failed to parse judgment JSON: {e}"))
    })?;

    let confidence = raw.confidence.clamp(0.0, 100.0).round() as u8;
    Ok(JudgeVerdict {
        confidence,
        is_acceptable: raw.is_acceptable.unwrap_or(confidence >= 70),
        explanation: raw.explanation.filter(|e| !e.trim().is_empty()),
    })
}

/// The outermost `{...}` span of the text, if any.
fn extract_json_object(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&content[start..=end])
}
