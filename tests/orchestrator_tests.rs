//! End-to-end orchestrator behavior with mocked LLM and schema capabilities.
//!
//! Execution against a live PostgreSQL server is out of scope here; requests
//! use `return_type = sql` so the pipeline stops after validation, which is
//! where all the orchestration logic lives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use pg_gateway::cache::SchemaCache;
use pg_gateway::config::{Config, DatabaseConfig};
use pg_gateway::db::{ConnectionManager, SchemaLoader};
use pg_gateway::error::{ErrorCode, GatewayError, GatewayResult};
use pg_gateway::llm::{GeneratedSql, JudgeVerdict, ResultJudge, SqlGenerator};
use pg_gateway::models::{DatabaseSchema, QueryRequest, ReturnType, TableInfo};
use pg_gateway::observability::GatewayMetrics;
use pg_gateway::orchestrator::QueryOrchestrator;
use pg_gateway::resilience::{CircuitBreaker, CircuitState, MultiRateLimiter};

/// Replays a fixed script of generation outcomes and records what the
/// orchestrator asked for.
struct ScriptedGenerator {
    script: Mutex<VecDeque<GatewayResult<GeneratedSql>>>,
    calls: AtomicUsize,
    feedback_seen: Mutex<Vec<(Option<String>, Option<String>)>>,
}

impl ScriptedGenerator {
    fn new(script: Vec<GatewayResult<GeneratedSql>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            feedback_seen: Mutex::new(Vec::new()),
        })
    }

    fn always(sql: &str) -> Arc<Self> {
        let mut script = Vec::new();
        for _ in 0..16 {
            script.push(Ok(GeneratedSql {
                sql: sql.to_string(),
                tokens_used: Some(10),
            }));
        }
        Self::new(script)
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SqlGenerator for ScriptedGenerator {
    async fn generate_sql(
        &self,
        _question: &str,
        _schema_context: &str,
        _context: Option<&str>,
        previous_sql: Option<&str>,
        error_feedback: Option<&str>,
    ) -> GatewayResult<GeneratedSql> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.feedback_seen.lock().push((
            previous_sql.map(str::to_string),
            error_feedback.map(str::to_string),
        ));
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(GatewayError::llm_error("script exhausted")))
    }
}

struct FixedJudge;

#[async_trait]
impl ResultJudge for FixedJudge {
    async fn judge(
        &self,
        _question: &str,
        _sql: &str,
        _sample_rows: &[Map<String, Value>],
        _total_count: usize,
    ) -> GatewayResult<JudgeVerdict> {
        Ok(JudgeVerdict {
            confidence: 88,
            is_acceptable: true,
            explanation: None,
        })
    }
}

struct StaticLoader {
    loads: AtomicUsize,
    fail: bool,
}

impl StaticLoader {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            loads: AtomicUsize::new(0),
            fail: true,
        })
    }
}

#[async_trait]
impl SchemaLoader for StaticLoader {
    async fn load_schema(&self, database: &str) -> GatewayResult<DatabaseSchema> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(GatewayError::schema_load_error("introspection refused"));
        }
        Ok(DatabaseSchema {
            database_name: database.to_string(),
            tables: vec![TableInfo {
                schema_name: "public".to_string(),
                table_name: "users".to_string(),
                columns: Vec::new(),
                foreign_keys: Vec::new(),
                indexes: Vec::new(),
                comment: None,
                row_count_estimate: Some(100),
            }],
            enum_types: Vec::new(),
            version: Some("16.3".to_string()),
        })
    }
}

struct Harness {
    gateway: QueryOrchestrator,
    generator: Arc<ScriptedGenerator>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<MultiRateLimiter>,
}

fn db(name: &str) -> DatabaseConfig {
    DatabaseConfig {
        name: name.to_string(),
        host: "localhost".to_string(),
        port: 5432,
        database: None,
        user: "gateway".to_string(),
        password: String::new(),
        readonly_role: None,
        max_pool_size: 4,
        pool_timeout_seconds: 1.0,
    }
}

fn harness_with(
    databases: Vec<DatabaseConfig>,
    generator: Arc<ScriptedGenerator>,
    loader: Arc<dyn SchemaLoader>,
    mutate: impl FnOnce(&mut Config),
) -> Harness {
    let mut config = Config::default();
    config.databases = databases;
    // No waiting between scripted attempts.
    config.retry.retry_delay_seconds = 0.0;
    mutate(&mut config);

    let connections = Arc::new(ConnectionManager::new(&config.databases));
    let schema_cache = Arc::new(SchemaCache::new(&config.cache));
    let breaker = Arc::new(CircuitBreaker::new(
        "llm",
        config.resilience.circuit_breaker.failure_threshold,
        config.resilience.circuit_breaker.recovery_timeout(),
    ));
    let limiter = Arc::new(MultiRateLimiter::new(
        config.resilience.rate_limit.max_concurrent_queries,
        config.resilience.rate_limit.max_concurrent_llm_calls,
    ));
    let gateway = QueryOrchestrator::new(
        config,
        connections,
        schema_cache,
        loader,
        generator.clone(),
        Arc::new(FixedJudge),
        Arc::clone(&breaker),
        Arc::clone(&limiter),
        Arc::new(GatewayMetrics::new()),
    );
    Harness {
        gateway,
        generator,
        breaker,
        limiter,
    }
}

fn harness(generator: Arc<ScriptedGenerator>) -> Harness {
    harness_with(vec![db("shop")], generator, StaticLoader::new(), |_| {})
}

fn sql_request(question: &str) -> QueryRequest {
    QueryRequest::new(question).with_return_type(ReturnType::Sql)
}

#[tokio::test]
async fn sql_only_request_succeeds_without_execution() {
    let h = harness(ScriptedGenerator::always("SELECT COUNT(*) FROM users"));
    let response = h.gateway.execute_query(sql_request("How many users?")).await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(
        response.generated_sql.as_deref(),
        Some("SELECT COUNT(*) FROM users")
    );
    assert_eq!(response.confidence, 100);
    assert_eq!(response.tokens_used, Some(10));
    assert!(response.data.is_none());
    assert!(response.validation.as_ref().is_some_and(|v| v.is_valid));
    assert_eq!(h.generator.call_count(), 1);
    assert_eq!(h.breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn rejected_sql_is_retried_with_feedback() {
    let generator = ScriptedGenerator::new(vec![
        Ok(GeneratedSql {
            sql: "DELETE FROM users".to_string(),
            tokens_used: Some(5),
        }),
        Ok(GeneratedSql {
            sql: "SELECT * FROM users".to_string(),
            tokens_used: Some(7),
        }),
    ]);
    let h = harness(generator);
    let response = h.gateway.execute_query(sql_request("Show all users")).await;

    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.generated_sql.as_deref(), Some("SELECT * FROM users"));
    assert_eq!(h.generator.call_count(), 2);

    let feedback = h.generator.feedback_seen.lock().clone();
    assert_eq!(feedback[0], (None, None));
    assert_eq!(feedback[1].0.as_deref(), Some("DELETE FROM users"));
    assert_eq!(
        feedback[1].1.as_deref(),
        Some("DELETE statements are not allowed")
    );
    // A successful attempt resets the breaker.
    assert_eq!(h.breaker.failure_count(), 0);
}

#[tokio::test]
async fn exhausted_retries_surface_last_rejection() {
    let h = harness(ScriptedGenerator::always("DROP TABLE users"));
    let response = h.gateway.execute_query(sql_request("Drop everything")).await;

    assert!(!response.success);
    assert_eq!(response.confidence, 0);
    let error = response.error.unwrap();
    assert_eq!(error.code, ErrorCode::SecurityViolation);
    // max_retries defaults to 3, so 4 attempts in total.
    assert_eq!(h.generator.call_count(), 4);
    assert_eq!(h.breaker.failure_count(), 1);
}

#[tokio::test]
async fn generation_failure_is_not_retried() {
    let generator = ScriptedGenerator::new(vec![Err(GatewayError::llm_timeout(
        "provider timed out",
    ))]);
    let h = harness(generator);
    let response = h.gateway.execute_query(sql_request("anything")).await;

    assert!(!response.success);
    assert_eq!(response.error.unwrap().code, ErrorCode::LlmTimeout);
    assert_eq!(h.generator.call_count(), 1);
    assert_eq!(h.breaker.failure_count(), 1);
}

#[tokio::test]
async fn open_breaker_short_circuits_before_any_call() {
    let h = harness_with(
        vec![db("shop")],
        ScriptedGenerator::always("SELECT 1"),
        StaticLoader::new(),
        |c| c.resilience.circuit_breaker.failure_threshold = 1,
    );
    h.breaker.record_failure();
    assert_eq!(h.breaker.state(), CircuitState::Open);

    let response = h.gateway.execute_query(sql_request("anything")).await;
    assert!(!response.success);
    let error = response.error.unwrap();
    assert_eq!(error.code, ErrorCode::LlmUnavailable);
    assert_eq!(error.details["circuit_state"], "open");
    assert_eq!(h.generator.call_count(), 0);
}

#[tokio::test]
async fn unknown_database_is_rejected_with_listing() {
    let h = harness(ScriptedGenerator::always("SELECT 1"));
    let request = sql_request("anything").with_database("warehouse");
    let response = h.gateway.execute_query(request).await;

    assert!(!response.success);
    let error = response.error.unwrap();
    assert_eq!(error.code, ErrorCode::DatabaseError);
    assert_eq!(error.message, "Database 'warehouse' not found");
    assert_eq!(error.details["available_databases"], serde_json::json!(["shop"]));
    assert_eq!(h.generator.call_count(), 0);
}

#[tokio::test]
async fn ambiguous_database_requires_explicit_choice() {
    let h = harness_with(
        vec![db("shop"), db("analytics")],
        ScriptedGenerator::always("SELECT 1"),
        StaticLoader::new(),
        |_| {},
    );
    let response = h.gateway.execute_query(sql_request("anything")).await;

    assert!(!response.success);
    let error = response.error.unwrap();
    assert_eq!(
        error.message,
        "Multiple databases available, please specify which to query"
    );
    assert_eq!(
        error.details["available_databases"],
        serde_json::json!(["shop", "analytics"])
    );

    // Naming one of them unblocks the request.
    let request = sql_request("anything").with_database("analytics");
    let response = h.gateway.execute_query(request).await;
    assert!(response.success, "{:?}", response.error);
}

#[tokio::test]
async fn no_configured_databases_is_an_error() {
    let h = harness_with(
        Vec::new(),
        ScriptedGenerator::always("SELECT 1"),
        StaticLoader::new(),
        |_| {},
    );
    let response = h.gateway.execute_query(sql_request("anything")).await;
    assert!(!response.success);
    assert_eq!(response.error.unwrap().message, "No databases configured");
}

#[tokio::test]
async fn empty_question_is_rejected() {
    let h = harness(ScriptedGenerator::always("SELECT 1"));
    let response = h.gateway.execute_query(sql_request("   ")).await;
    assert!(!response.success);
    let error = response.error.unwrap();
    assert_eq!(error.code, ErrorCode::InvalidRequest);
    assert_eq!(error.message, "Question must not be empty");
    assert_eq!(h.generator.call_count(), 0);
}

#[tokio::test]
async fn oversized_question_is_rejected() {
    let h = harness_with(
        vec![db("shop")],
        ScriptedGenerator::always("SELECT 1"),
        StaticLoader::new(),
        |c| c.security.max_question_length = 20,
    );
    let question = "x".repeat(21);
    let response = h.gateway.execute_query(sql_request(&question)).await;
    assert!(!response.success);
    let error = response.error.unwrap();
    assert_eq!(error.code, ErrorCode::QuestionTooLong);
    assert_eq!(error.details["max_length"], 20);
}

#[tokio::test]
async fn schema_load_failure_fails_the_request() {
    let h = harness_with(
        vec![db("shop")],
        ScriptedGenerator::always("SELECT 1"),
        StaticLoader::failing(),
        |_| {},
    );
    let response = h.gateway.execute_query(sql_request("anything")).await;
    assert!(!response.success);
    assert_eq!(response.error.unwrap().code, ErrorCode::SchemaLoadError);
    assert_eq!(h.generator.call_count(), 0);
}

#[tokio::test]
async fn schema_is_cached_across_requests() {
    let loader = StaticLoader::new();
    let h = harness_with(
        vec![db("shop")],
        ScriptedGenerator::always("SELECT 1"),
        loader.clone(),
        |_| {},
    );
    for _ in 0..3 {
        let response = h.gateway.execute_query(sql_request("anything")).await;
        assert!(response.success, "{:?}", response.error);
    }
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn saturated_llm_limiter_rejects_after_timeout() {
    let h = harness_with(
        vec![db("shop")],
        ScriptedGenerator::always("SELECT 1"),
        StaticLoader::new(),
        |c| {
            c.resilience.rate_limit.max_concurrent_llm_calls = 1;
            c.resilience.rate_limit.acquire_timeout_seconds = 0.05;
        },
    );
    // Hold the only LLM slot so the request cannot acquire one.
    let _held = h
        .limiter
        .acquire_llm_slot(Some(Duration::from_secs(1)))
        .await
        .unwrap();

    let response = h.gateway.execute_query(sql_request("anything")).await;
    assert!(!response.success);
    assert_eq!(response.error.unwrap().code, ErrorCode::RateLimitExceeded);
    assert_eq!(h.generator.call_count(), 0);
}

#[tokio::test]
async fn stats_reflect_request_outcomes() {
    let h = harness(ScriptedGenerator::always("SELECT COUNT(*) FROM users"));
    let ok = h.gateway.execute_query(sql_request("How many users?")).await;
    assert!(ok.success);
    let failed = h
        .gateway
        .execute_query(sql_request("x").with_database("nope"))
        .await;
    assert!(!failed.success);

    let stats = h.gateway.stats();
    assert_eq!(stats.metrics.requests_total, 2);
    assert_eq!(stats.metrics.requests_succeeded, 1);
    assert_eq!(stats.metrics.requests_failed, 1);
    assert_eq!(stats.circuit_breaker.failure_count, 0);
}
