//! SQL validation and execution.

pub mod executor;
pub mod validator;

pub use executor::{ExecutionOutput, SqlExecutor};
pub use validator::SqlValidator;
