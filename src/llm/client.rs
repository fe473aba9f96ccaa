//! Minimal OpenAI-compatible chat-completions client.
//!
//! One system + one user message in, assistant text out. Transport and HTTP
//! failures are mapped onto the gateway error taxonomy here so callers only
//! ever see `llm_timeout` / `llm_unavailable` / `llm_error`.

use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{GatewayError, GatewayResult};

/// One completed chat turn.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    /// Total tokens billed for the call, when the provider reports usage.
    pub tokens_used: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: u32,
}

/// Chat-completions client shared by the generator and the judge.
#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GatewayError::llm_error(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Sends one system + user prompt pair and returns the assistant reply.
    pub async fn complete(&self, system: &str, user: &str) -> GatewayResult<Completion> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(&e, self.config.timeout_seconds))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(map_status_error(status, &text));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            GatewayError::llm_error(format!("Failed to parse LLM response: {e}"))
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| GatewayError::llm_error("LLM response contained no content"))?;

        Ok(Completion {
            content,
            tokens_used: parsed.usage.map(|u| u.total_tokens),
        })
    }
}

fn map_transport_error(err: &reqwest::Error, timeout_seconds: f64) -> GatewayError {
    if err.is_timeout() {
        GatewayError::llm_timeout(format!("LLM call timed out after {timeout_seconds} seconds"))
            .with_detail("timeout_seconds", timeout_seconds)
    } else if err.is_connect() {
        GatewayError::llm_unavailable(format!("Cannot reach LLM provider: {err}"))
    } else {
        GatewayError::llm_error(format!("LLM request failed: {err}"))
    }
}

fn map_status_error(status: reqwest::StatusCode, body: &str) -> GatewayError {
    let truncated: String = body.chars().take(200).collect();
    match status.as_u16() {
        // Auth failures and throttling both mean the provider cannot serve
        // us right now; the breaker should see these as unavailability.
        401 | 403 | 429 => GatewayError::llm_unavailable(format!(
            "LLM provider rejected the request with status {status}"
        ))
        .with_detail("status", status.as_u16())
        .with_detail("body", truncated),
        _ => GatewayError::llm_error(format!("LLM provider returned status {status}"))
            .with_detail("status", status.as_u16())
            .with_detail("body", truncated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn status_mapping() {
        assert_eq!(
            map_status_error(reqwest::StatusCode::UNAUTHORIZED, "nope").code,
            ErrorCode::LlmUnavailable
        );
        assert_eq!(
            map_status_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down").code,
            ErrorCode::LlmUnavailable
        );
        let err = map_status_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(err.code, ErrorCode::LlmError);
        assert_eq!(err.details["status"], 500);
        assert_eq!(err.details["body"], "boom");
    }

    #[test]
    fn status_error_truncates_body() {
        let body = "x".repeat(500);
        let err = map_status_error(reqwest::StatusCode::BAD_GATEWAY, &body);
        assert_eq!(err.details["body"].as_str().unwrap().len(), 200);
    }

    #[test]
    fn chat_request_wire_shape() {
        let body = ChatRequest {
            model: "gpt-4o-mini",
            messages: [
                ChatMessage {
                    role: "system",
                    content: "be terse",
                },
                ChatMessage {
                    role: "user",
                    content: "hi",
                },
            ],
            temperature: 0.0,
            max_tokens: 100,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
    }

    #[test]
    fn chat_response_parses_with_and_without_usage() {
        let with_usage: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"SELECT 1"}}],
                "usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
        )
        .unwrap();
        assert_eq!(with_usage.usage.map(|u| u.total_tokens), Some(15));

        let without: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"SELECT 1"}}]}"#).unwrap();
        assert!(without.usage.is_none());
        assert_eq!(
            without.choices[0].message.content.as_deref(),
            Some("SELECT 1")
        );
    }

    #[test]
    fn client_builds_from_default_config() {
        let client = LlmClient::new(LlmConfig::default()).unwrap();
        assert_eq!(client.model(), "gpt-4o-mini");
    }
}
