//! Error taxonomy shared by the library, the orchestrator, and the REST API.
//!
//! Every failure that can surface to a caller is a [`GatewayError`] carrying a
//! stable machine-readable [`ErrorCode`], a human-readable message, and a bag
//! of structured details. Errors serialize directly into API responses, so the
//! wire shape is defined here and nowhere else.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stable error codes exposed on the wire.
///
/// Codes are serialized in `snake_case` and are part of the API contract:
/// clients dispatch on them, so renaming one is a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Malformed or incomplete request.
    InvalidRequest,
    /// Generated SQL failed security validation.
    ValidationFailed,
    /// SQL attempted a forbidden operation or function.
    SecurityViolation,
    /// SQL could not be parsed.
    SqlParseError,
    /// Question exceeds the configured length limit.
    QuestionTooLong,
    /// Unexpected internal failure.
    InternalError,
    /// Database rejected the query.
    DatabaseError,
    /// Could not obtain a database connection.
    DatabaseConnectionError,
    /// LLM provider returned an error.
    LlmError,
    /// LLM call exceeded its timeout.
    LlmTimeout,
    /// LLM provider is unreachable or the circuit breaker is open.
    LlmUnavailable,
    /// Schema introspection failed.
    SchemaLoadError,
    /// Query execution exceeded the configured timeout.
    ExecutionTimeout,
    /// Concurrency limiter rejected the request.
    RateLimitExceeded,
    /// A bounded resource (connection pool, memory) is exhausted.
    ResourceExhausted,
}

impl ErrorCode {
    /// The `snake_case` wire form of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::ValidationFailed => "validation_failed",
            Self::SecurityViolation => "security_violation",
            Self::SqlParseError => "sql_parse_error",
            Self::QuestionTooLong => "question_too_long",
            Self::InternalError => "internal_error",
            Self::DatabaseError => "database_error",
            Self::DatabaseConnectionError => "database_connection_error",
            Self::LlmError => "llm_error",
            Self::LlmTimeout => "llm_timeout",
            Self::LlmUnavailable => "llm_unavailable",
            Self::SchemaLoadError => "schema_load_error",
            Self::ExecutionTimeout => "execution_timeout",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ResourceExhausted => "resource_exhausted",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A gateway failure: stable code, message, and structured context.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct GatewayError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Structured context, e.g. the offending SQL or the list of
    /// available databases. Omitted from the wire when empty.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl GatewayError {
    /// Builds an error with no structured details.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Map::new(),
        }
    }

    /// Attaches a detail entry, replacing any previous value for the key.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn security_violation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SecurityViolation, message)
    }

    pub fn sql_parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SqlParseError, message)
    }

    pub fn question_too_long(length: usize, limit: usize) -> Self {
        Self::new(
            ErrorCode::QuestionTooLong,
            format!("Question length {length} exceeds maximum of {limit} characters"),
        )
        .with_detail("length", length)
        .with_detail("max_length", limit)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn database_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseError, message)
    }

    pub fn database_connection_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DatabaseConnectionError, message)
    }

    pub fn llm_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::LlmError, message)
    }

    pub fn llm_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::LlmTimeout, message)
    }

    pub fn llm_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::LlmUnavailable, message)
    }

    pub fn schema_load_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SchemaLoadError, message)
    }

    pub fn execution_timeout(timeout_seconds: f64, sql: &str) -> Self {
        // The SQL is truncated so huge generated statements cannot bloat
        // error payloads or logs.
        let mut truncated: String = sql.chars().take(200).collect();
        if sql.chars().count() > 200 {
            truncated.push_str("...");
        }
        Self::new(
            ErrorCode::ExecutionTimeout,
            format!("Query execution exceeded timeout of {timeout_seconds} seconds"),
        )
        .with_detail("timeout_seconds", timeout_seconds)
        .with_detail("sql", truncated)
    }

    pub fn rate_limit_exceeded(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        Self::new(
            ErrorCode::RateLimitExceeded,
            format!("Too many concurrent {resource} requests, please retry later"),
        )
        .with_detail("resource", resource)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResourceExhausted, message)
    }

    /// Whether this error class is worth retrying with a corrected query.
    ///
    /// Only validation rejections qualify: the LLM gets the rejection reason
    /// as feedback and may produce a compliant statement on the next attempt.
    pub fn is_retryable_validation(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::ValidationFailed | ErrorCode::SecurityViolation | ErrorCode::SqlParseError
        )
    }
}

/// Convenient alias for fallible gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
