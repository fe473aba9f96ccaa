//! SQL generation over the chat client.
//!
//! Completions rarely come back as bare SQL; models wrap them in markdown
//! fences or prose. Extraction prefers a ```sql fence, then a plain fence,
//! then raw text that already starts with SELECT or WITH.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::error::{GatewayError, GatewayResult};
use crate::llm::client::LlmClient;
use crate::llm::prompts;

/// A generated statement plus the tokens the call consumed.
#[derive(Debug, Clone)]
pub struct GeneratedSql {
    pub sql: String,
    pub tokens_used: Option<u32>,
}

/// Capability to turn a question plus schema context into a SQL statement.
///
/// The orchestrator retries through this trait with the rejected statement
/// and the rejection reason as feedback.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate_sql(
        &self,
        question: &str,
        schema_context: &str,
        context: Option<&str>,
        previous_sql: Option<&str>,
        error_feedback: Option<&str>,
    ) -> GatewayResult<GeneratedSql>;
}

/// [`SqlGenerator`] backed by an OpenAI-compatible endpoint.
#[derive(Debug, Clone)]
pub struct LlmSqlGenerator {
    client: Arc<LlmClient>,
}

impl LlmSqlGenerator {
    pub fn new(client: Arc<LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    async fn generate_sql(
        &self,
        question: &str,
        schema_context: &str,
        context: Option<&str>,
        previous_sql: Option<&str>,
        error_feedback: Option<&str>,
    ) -> GatewayResult<GeneratedSql> {
        let user = prompts::sql_generation_user(
            question,
            schema_context,
            context,
            previous_sql,
            error_feedback,
        );
        let completion = self
            .client
            .complete(prompts::SQL_GENERATION_SYSTEM, &user)
            .await?;

        let sql = extract_sql(&completion.content).ok_or_else(|| {
            GatewayError::llm_error("Could not extract SQL from LLM response")
                .with_detail("response_preview", preview(&completion.content))
        })?;

        tracing::debug!(
            model = %self.client.model(),
            sql_length = sql.len(),
            tokens = completion.tokens_used,
            "SQL generated"
        );
        Ok(GeneratedSql {
            sql,
            tokens_used: completion.tokens_used,
        })
    }
}

fn preview(content: &str) -> String {
    content.chars().take(120).collect()
}

/// Pulls the SQL statement out of a model completion, or `None` when the
/// completion contains nothing that looks like a query.
pub fn extract_sql(content: &str) -> Option<String> {
    // ```sql fence first: the model explicitly marked the block as SQL, so
    // take it as-is and let the validator judge the content.
    let sql_fence = Regex::new(r"(?is)```sql\s*\n?(.*?)```").expect("valid regex");
    if let Some(captures) = sql_fence.captures(content) {
        return normalize(captures.get(1).map_or("", |m| m.as_str()));
    }

    // An untagged fence only counts when its content reads like a query.
    let any_fence = Regex::new(r"(?s)```\s*\n?(.*?)```").expect("valid regex");
    if let Some(captures) = any_fence.captures(content) {
        let body = captures.get(1).map_or("", |m| m.as_str());
        if starts_like_query(body) {
            return normalize(body);
        }
        return None;
    }

    // No fence at all: accept prose-free completions and completions where
    // the query follows some lead-in text.
    if starts_like_query(content) {
        return normalize(content);
    }
    if let Some(idx) = find_query_start(content) {
        return normalize(&content[idx..]);
    }
    None
}

fn starts_like_query(text: &str) -> bool {
    let trimmed = text.trim_start();
    let upper = trimmed.get(..6).map(str::to_uppercase);
    matches!(upper.as_deref(), Some("SELECT")) || {
        let upper = trimmed.get(..5).map(str::to_uppercase);
        matches!(upper.as_deref(), Some("WITH ") | Some("WITH\n") | Some("WITH\t"))
    }
}

/// Byte offset of a line starting with SELECT or WITH, for completions that
/// prefix the query with an explanation.
fn find_query_start(content: &str) -> Option<usize> {
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        if starts_like_query(line) {
            let leading = line.len() - line.trim_start().len();
            return Some(offset + leading);
        }
        offset += line.len();
    }
    None
}

fn normalize(sql: &str) -> Option<String> {
    let cleaned = sql.trim().replace(";;", ";");
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}
