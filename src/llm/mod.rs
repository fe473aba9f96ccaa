//! Language-model capabilities: chat client, SQL generation, result judgment.
//!
//! The orchestrator depends only on the [`SqlGenerator`] and [`ResultJudge`]
//! traits; the `Llm*` implementations here back them with an OpenAI-compatible
//! chat-completions endpoint.

pub mod client;
pub mod generator;
pub mod judge;
pub mod prompts;

pub use client::{Completion, LlmClient};
pub use generator::{GeneratedSql, LlmSqlGenerator, SqlGenerator};
pub use judge::{JudgeVerdict, LlmResultJudge, ResultJudge};
