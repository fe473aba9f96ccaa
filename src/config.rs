//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - config.toml (default configuration)
//! - config.local.toml (git-ignored local overrides)
//! - Environment variables (PG_GATEWAY_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # config.toml
//! [[databases]]
//! name = "shop"
//! host = "localhost"
//! database = "shop"
//! user = "gateway"
//! password = "secret"
//!
//! [llm]
//! model = "gpt-4o-mini"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! PG_GATEWAY_LLM__API_KEY=sk-...
//! PG_GATEWAY_EXECUTION__MAX_ROWS=500
//! ```

use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Databases the gateway may answer questions against
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub judge: JudgeConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub resilience: ResilienceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub http: HttpConfig,
}

/// Connection settings for one configured database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Name clients use to address this database
    pub name: String,

    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database name on the server (defaults to `name`)
    #[serde(default)]
    pub database: Option<String>,

    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Role to switch to for query execution (SET LOCAL ROLE)
    #[serde(default)]
    pub readonly_role: Option<String>,

    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// Seconds to wait for a pooled connection
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout_seconds: f64,
}

impl DatabaseConfig {
    /// Database name on the server, falling back to the logical name.
    pub fn database_name(&self) -> &str {
        self.database.as_deref().unwrap_or(&self.name)
    }

    pub fn pool_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.pool_timeout_seconds)
    }
}

/// SQL validation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Functions generated SQL must never call
    #[serde(default = "default_blocked_functions")]
    pub blocked_functions: Vec<String>,

    /// Tables queries may touch (None = all tables allowed)
    #[serde(default)]
    pub allowed_tables: Option<Vec<String>>,

    /// Tables queries must never touch, applied even when no allow-list
    /// is configured
    #[serde(default)]
    pub blocked_tables: Vec<String>,

    /// Permit EXPLAIN / EXPLAIN ANALYZE statements
    #[serde(default)]
    pub allow_explain: bool,

    /// Permit INSERT / UPDATE / DELETE (DDL is always rejected)
    #[serde(default)]
    pub allow_write_operations: bool,

    /// Maximum accepted question length in characters
    #[serde(default = "default_max_question_length")]
    pub max_question_length: usize,
}

/// Query execution limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Row cap applied to every result set
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,

    /// Per-statement timeout in seconds
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time_seconds: f64,

    /// search_path set for every query transaction
    #[serde(default = "default_search_path")]
    pub search_path: String,
}

impl ExecutionConfig {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.max_execution_time_seconds)
    }
}

/// Schema cache behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds a cached schema stays fresh
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,

    /// Background refresh period in seconds. 0 = no background refresh.
    #[serde(default)]
    pub refresh_interval_seconds: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        if self.refresh_interval_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.refresh_interval_seconds))
        }
    }
}

/// OpenAI-compatible chat completion provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// API key, usually supplied via PG_GATEWAY_LLM__API_KEY
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub temperature: f32,

    /// Per-call timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_seconds: f64,
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds)
    }
}

/// Best-effort result judgment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Rows sampled into the judgment prompt
    #[serde(default = "default_judge_sample_rows")]
    pub sample_rows: usize,

    /// Judgment call timeout in seconds
    #[serde(default = "default_judge_timeout")]
    pub timeout_seconds: f64,
}

impl JudgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_seconds)
    }
}

/// Generate-validate retry loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt (so max_retries + 1 attempts total)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: f64,

    /// Exponential backoff multiplier applied per attempt
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl RetryConfig {
    /// Delay before retrying after the given zero-based attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let seconds = self.retry_delay_seconds * self.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(seconds)
    }
}

/// Circuit breaker and concurrency limiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// LLM circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the breaker stays open before probing
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_seconds: f64,
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout_seconds)
    }
}

/// Concurrency limits for the database and LLM edges
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,

    #[serde(default = "default_max_concurrent_llm_calls")]
    pub max_concurrent_llm_calls: usize,

    /// Seconds to wait for a slot. 0 = wait indefinitely.
    #[serde(default)]
    pub acquire_timeout_seconds: f64,
}

impl RateLimitConfig {
    pub fn acquire_timeout(&self) -> Option<Duration> {
        if self.acquire_timeout_seconds > 0.0 {
            Some(Duration::from_secs_f64(self.acquire_timeout_seconds))
        } else {
            None
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// HTTP server configuration for the REST API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP server bind address
    #[serde(default = "default_http_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Allowed CORS origins (empty = same-origin only, unless cors_allow_all is true)
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Explicitly allow all CORS origins (dev mode opt-in)
    #[serde(default)]
    pub cors_allow_all: bool,

    /// Maximum accepted request body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

// Default value functions
fn default_db_host() -> String {
    "localhost".to_string()
}
fn default_db_port() -> u16 {
    5432
}
fn default_max_pool_size() -> usize {
    20
}
fn default_pool_timeout() -> f64 {
    30.0
}
fn default_blocked_functions() -> Vec<String> {
    [
        "pg_sleep",
        "pg_read_file",
        "pg_write_file",
        "lo_import",
        "lo_export",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}
fn default_max_question_length() -> usize {
    10_000
}
fn default_max_rows() -> usize {
    10_000
}
fn default_max_execution_time() -> f64 {
    30.0
}
fn default_search_path() -> String {
    "public".to_string()
}
fn default_true() -> bool {
    true
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_max_tokens() -> u32 {
    2000
}
fn default_llm_timeout() -> f64 {
    30.0
}
fn default_judge_sample_rows() -> usize {
    5
}
fn default_judge_timeout() -> f64 {
    10.0
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> f64 {
    1.0
}
fn default_backoff_factor() -> f64 {
    2.0
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout() -> f64 {
    60.0
}
fn default_max_concurrent_queries() -> usize {
    10
}
fn default_max_concurrent_llm_calls() -> usize {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_http_host() -> String {
    "127.0.0.1".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_max_body_bytes() -> usize {
    1_048_576 // 1 MB
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. config.toml (base configuration)
    /// 2. config.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (PG_GATEWAY_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Toml::file("config.local.toml"))
            .merge(Env::prefixed("PG_GATEWAY_").split("__"))
            .extract()
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("PG_GATEWAY_").split("__"))
            .extract()
    }

    /// Checks cross-field rules that serde defaults cannot express.
    ///
    /// Returns the first problem found as a human-readable message.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for db in &self.databases {
            if !seen.insert(db.name.as_str()) {
                return Err(format!("Duplicate database name '{}'", db.name));
            }
            if db.max_pool_size == 0 {
                return Err(format!("databases.{}.max_pool_size must be >= 1", db.name));
            }
        }
        if self.resilience.circuit_breaker.failure_threshold < 1 {
            return Err("resilience.circuit_breaker.failure_threshold must be >= 1".to_string());
        }
        if self.resilience.rate_limit.max_concurrent_queries < 1 {
            return Err("resilience.rate_limit.max_concurrent_queries must be >= 1".to_string());
        }
        if self.resilience.rate_limit.max_concurrent_llm_calls < 1 {
            return Err("resilience.rate_limit.max_concurrent_llm_calls must be >= 1".to_string());
        }
        if self.retry.backoff_factor < 1.0 {
            return Err("retry.backoff_factor must be >= 1.0".to_string());
        }
        if self.execution.max_rows == 0 {
            return Err("execution.max_rows must be >= 1".to_string());
        }
        if self.security.max_question_length == 0 {
            return Err("security.max_question_length must be >= 1".to_string());
        }
        Ok(())
    }

    /// Names of all configured databases, in configuration order.
    pub fn database_names(&self) -> Vec<String> {
        self.databases.iter().map(|d| d.name.clone()).collect()
    }

    /// Looks up a database section by its logical name.
    pub fn database(&self, name: &str) -> Option<&DatabaseConfig> {
        self.databases.iter().find(|d| d.name == name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            databases: Vec::new(),
            security: SecurityConfig::default(),
            execution: ExecutionConfig::default(),
            cache: CacheConfig::default(),
            llm: LlmConfig::default(),
            judge: JudgeConfig::default(),
            retry: RetryConfig::default(),
            resilience: ResilienceConfig::default(),
            logging: LoggingConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig {
            blocked_functions: default_blocked_functions(),
            allowed_tables: None,
            blocked_tables: Vec::new(),
            allow_explain: false,
            allow_write_operations: false,
            max_question_length: default_max_question_length(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            max_rows: default_max_rows(),
            max_execution_time_seconds: default_max_execution_time(),
            search_path: default_search_path(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            ttl_seconds: default_cache_ttl(),
            refresh_interval_seconds: 0,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            api_key: String::new(),
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            max_tokens: default_llm_max_tokens(),
            temperature: 0.0,
            timeout_seconds: default_llm_timeout(),
        }
    }
}

impl Default for JudgeConfig {
    fn default() -> Self {
        JudgeConfig {
            enabled: true,
            sample_rows: default_judge_sample_rows(),
            timeout_seconds: default_judge_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        ResilienceConfig {
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_seconds: default_recovery_timeout(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            max_concurrent_queries: default_max_concurrent_queries(),
            max_concurrent_llm_calls: default_max_concurrent_llm_calls(),
            acquire_timeout_seconds: 0.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            enabled: true,
            host: default_http_host(),
            port: default_http_port(),
            cors_origins: Vec::new(),
            cors_allow_all: false,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}
