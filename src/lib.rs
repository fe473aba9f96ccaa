//! pg-gateway: a natural-language-to-SQL query gateway for PostgreSQL.
//!
//! The gateway turns plain-language questions into policy-checked, read-only
//! SQL and executes it under strict resource bounds. A question flows through
//! one pipeline:
//!
//! 1. schema context from the TTL cache (introspected on miss),
//! 2. SQL generation via an OpenAI-compatible LLM, behind a circuit breaker
//!    and a concurrency limiter, with validation-driven retry feedback,
//! 3. security validation on the parsed AST (single statement, SELECT-only,
//!    blocked functions, optional table allow-list),
//! 4. execution inside a read-only transaction with statement timeout and
//!    row cap,
//! 5. best-effort LLM judgment of how well the results answer the question.
//!
//! [`orchestrator::QueryOrchestrator`] sequences the pipeline and folds every
//! failure into the uniform [`models::QueryResponse`] envelope. [`server`]
//! exposes it over REST.
//!
//! ```no_run
//! use pg_gateway::config::Config;
//! use pg_gateway::models::QueryRequest;
//! use pg_gateway::orchestrator::QueryOrchestrator;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load()?;
//! let gateway = QueryOrchestrator::from_config(config)?;
//! let response = gateway
//!     .execute_query(QueryRequest::new("How many orders shipped last week?"))
//!     .await;
//! println!("{}", serde_json::to_string_pretty(&response)?);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod observability;
pub mod orchestrator;
pub mod resilience;
pub mod server;
pub mod sql;

pub use config::Config;
pub use error::{ErrorCode, GatewayError, GatewayResult};
pub use models::{QueryRequest, QueryResponse, ReturnType};
pub use orchestrator::QueryOrchestrator;
