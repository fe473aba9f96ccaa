//! Request and response types for the query pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::GatewayError;

/// What the caller wants back: just the generated SQL, or executed results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnType {
    /// Generate and validate only; skip execution.
    Sql,
    /// Generate, validate, execute, and judge.
    #[default]
    Result,
}

/// One natural-language question headed for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// The natural-language question. Must be non-empty after trimming.
    pub question: String,
    /// Target database name. May be omitted when exactly one is configured.
    #[serde(default)]
    pub database: Option<String>,
    /// Free-form hints appended to the generation prompt.
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub return_type: ReturnType,
}

impl QueryRequest {
    /// A plain question against the default database, asking for results.
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            database: None,
            context: None,
            return_type: ReturnType::Result,
        }
    }

    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    #[must_use]
    pub fn with_return_type(mut self, return_type: ReturnType) -> Self {
        self.return_type = return_type;
        self
    }
}

/// Outcome of running a statement through the security validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    /// Whether the statement is a pure read (SELECT / WITH ... SELECT).
    pub is_select: bool,
    /// Whether the statement would write data if executed.
    pub allows_data_modification: bool,
    /// Blocked functions the statement invokes, if any.
    #[serde(default)]
    pub used_blocked_functions: Vec<String>,
    /// Rejection reason; `None` when valid.
    #[serde(default)]
    pub error: Option<String>,
}

impl ValidationResult {
    /// The result attached to every statement that passed validation.
    pub fn accepted() -> Self {
        Self {
            is_valid: true,
            is_select: true,
            allows_data_modification: false,
            used_blocked_functions: Vec::new(),
            error: None,
        }
    }
}

/// Executed query output, already normalized to JSON values and capped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names in result-set order, deduplicated (first occurrence wins).
    pub columns: Vec<String>,
    /// One map per returned row. Values are normalized: timestamps as
    /// ISO-8601 strings, numerics as floats, byte arrays as hex strings.
    pub rows: Vec<Map<String, Value>>,
    /// Number of rows returned, after the row cap is applied.
    pub row_count: usize,
    pub execution_time_ms: f64,
}

/// The uniform envelope every call to the orchestrator produces.
///
/// `success` decides which side is populated: `data` (with `generated_sql`
/// and `validation`) on success, `error` on failure. The orchestrator never
/// returns an error to its caller directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<QueryResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
    /// Judged answer confidence, 0..=100. Failures are always 0; SQL-only
    /// responses and skipped judgment are 100.
    pub confidence: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
}

impl QueryResponse {
    /// A failure envelope: confidence zero, no SQL, no data.
    pub fn failure(error: GatewayError) -> Self {
        Self {
            success: false,
            generated_sql: None,
            validation: None,
            data: None,
            error: Some(error),
            confidence: 0,
            tokens_used: None,
        }
    }
}
