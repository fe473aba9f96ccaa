//! End-to-end coordination of one query request.
//!
//! The orchestrator sequences the pipeline: resolve the target database, get
//! schema context, drive the bounded generate-validate retry loop under the
//! circuit breaker and the LLM rate limiter, execute under the query rate
//! limiter, then ask the judge to score the results. Every failure is folded
//! into the uniform [`QueryResponse`] envelope; `execute_query` never returns
//! an error to its caller.
//!
//! Only the generate-validate step retries: a rejection reason can be fed
//! back to the model as corrective feedback, while execution and judgment
//! failures cannot be fixed by trying again with the same inputs.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::cache::{SchemaCache, SchemaCacheSnapshot};
use crate::config::Config;
use crate::db::{ConnectionManager, SchemaIntrospector, SchemaLoader};
use crate::error::{GatewayError, GatewayResult};
use crate::llm::{LlmClient, LlmResultJudge, LlmSqlGenerator, ResultJudge, SqlGenerator};
use crate::models::{
    DatabaseSchema, QueryRequest, QueryResponse, QueryResult, ReturnType, ValidationResult,
};
use crate::observability::{GatewayMetrics, MetricsSnapshot};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerSnapshot, MultiRateLimiter, MultiRateLimiterSnapshot,
};
use crate::sql::{SqlExecutor, SqlValidator};

/// Combined runtime state for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub metrics: MetricsSnapshot,
    pub circuit_breaker: CircuitBreakerSnapshot,
    pub rate_limiters: MultiRateLimiterSnapshot,
    pub schema_cache: SchemaCacheSnapshot,
}

/// Drives one question through generation, validation, execution and
/// judgment. One instance serves all concurrent requests.
pub struct QueryOrchestrator {
    config: Config,
    connections: Arc<ConnectionManager>,
    schema_cache: Arc<SchemaCache>,
    schema_loader: Arc<dyn SchemaLoader>,
    validator: SqlValidator,
    executor: SqlExecutor,
    generator: Arc<dyn SqlGenerator>,
    judge: Arc<dyn ResultJudge>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<MultiRateLimiter>,
    metrics: Arc<GatewayMetrics>,
}

impl QueryOrchestrator {
    /// Wires an orchestrator from pre-built components. Tests use this to
    /// substitute mock capabilities; production goes through
    /// [`from_config`](Self::from_config).
    pub fn new(
        config: Config,
        connections: Arc<ConnectionManager>,
        schema_cache: Arc<SchemaCache>,
        schema_loader: Arc<dyn SchemaLoader>,
        generator: Arc<dyn SqlGenerator>,
        judge: Arc<dyn ResultJudge>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<MultiRateLimiter>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let validator = SqlValidator::new(config.security.clone());
        let executor = SqlExecutor::new(config.execution.clone());
        Self {
            config,
            connections,
            schema_cache,
            schema_loader,
            validator,
            executor,
            generator,
            judge,
            breaker,
            limiter,
            metrics,
        }
    }

    /// Builds the full production wiring: pools, introspector, LLM-backed
    /// generator and judge, breaker, limiters, metrics.
    pub fn from_config(config: Config) -> GatewayResult<Arc<Self>> {
        config.validate().map_err(GatewayError::invalid_request)?;

        let connections = Arc::new(ConnectionManager::new(&config.databases));
        let schema_cache = Arc::new(SchemaCache::new(&config.cache));
        let introspector = Arc::new(SchemaIntrospector::new(Arc::clone(&connections)));
        let client = Arc::new(LlmClient::new(config.llm.clone())?);
        let generator = Arc::new(LlmSqlGenerator::new(Arc::clone(&client)));
        let judge = Arc::new(LlmResultJudge::new(client));
        let breaker = Arc::new(CircuitBreaker::new(
            "llm",
            config.resilience.circuit_breaker.failure_threshold,
            config.resilience.circuit_breaker.recovery_timeout(),
        ));
        let limiter = Arc::new(MultiRateLimiter::new(
            config.resilience.rate_limit.max_concurrent_queries,
            config.resilience.rate_limit.max_concurrent_llm_calls,
        ));
        let metrics = Arc::new(GatewayMetrics::new());

        Ok(Arc::new(Self::new(
            config,
            connections,
            schema_cache,
            introspector,
            generator,
            judge,
            breaker,
            limiter,
            metrics,
        )))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database_names(&self) -> Vec<String> {
        self.connections.database_names()
    }

    /// The database an unqualified request targets, when unambiguous.
    pub fn default_database(&self) -> Option<String> {
        if self.connections.database_count() == 1 {
            self.connections.default_database().map(str::to_string)
        } else {
            None
        }
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            metrics: self.metrics.snapshot(),
            circuit_breaker: self.breaker.snapshot(),
            rate_limiters: self.limiter.snapshot(),
            schema_cache: self.schema_cache.snapshot(),
        }
    }

    /// Starts the schema auto-refresh loop when an interval is configured.
    /// Returns whether a loop was started.
    pub fn start_auto_refresh(self: &Arc<Self>) -> bool {
        let Some(interval) = self.config.cache.refresh_interval() else {
            return false;
        };
        let loaders = self
            .connections
            .database_names()
            .into_iter()
            .map(|name| (name, Arc::clone(&self.schema_loader)))
            .collect();
        self.schema_cache.start_auto_refresh(interval, loaders);
        true
    }

    /// Stops background work and closes every pool.
    pub async fn shutdown(&self) {
        self.schema_cache.stop_auto_refresh().await;
        self.connections.close_all();
    }

    /// The public operation: one question in, one envelope out.
    ///
    /// Infallible at the signature level; every internal failure becomes a
    /// `success = false` envelope carrying the error taxonomy code.
    pub async fn execute_query(&self, request: QueryRequest) -> QueryResponse {
        let request_id = Uuid::new_v4();
        let started = Instant::now();
        let span = tracing::info_span!("query", request_id = %request_id);

        async move {
            tracing::info!(
                question = %truncate(&request.question, 100),
                database = request.database.as_deref(),
                "query started"
            );

            let mut database_label: Option<String> = None;
            let result = self.run_pipeline(&request, &mut database_label).await;
            let elapsed = started.elapsed();
            let db = database_label.as_deref().unwrap_or("unknown");

            match result {
                Ok(response) => {
                    self.metrics.record_request(true, elapsed);
                    tracing::info!(
                        db = %db,
                        elapsed_ms = elapsed.as_millis() as u64,
                        confidence = response.confidence,
                        "query succeeded"
                    );
                    response
                }
                Err(err) => {
                    self.metrics.record_request(false, elapsed);
                    tracing::warn!(
                        db = %db,
                        code = %err.code,
                        error = %err.message,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "query failed"
                    );
                    QueryResponse::failure(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_pipeline(
        &self,
        request: &QueryRequest,
        database_label: &mut Option<String>,
    ) -> GatewayResult<QueryResponse> {
        let question = self.validate_question(&request.question)?;

        let database = self.resolve_database(request.database.as_deref())?;
        *database_label = Some(database.clone());

        let schema = self.schema(&database).await?;
        let schema_context = schema.to_prompt_context();

        let (sql, validation, tokens_used) = self
            .generate_with_retry(&question, request.context.as_deref(), &schema_context)
            .await?;

        if request.return_type == ReturnType::Sql {
            return Ok(QueryResponse {
                success: true,
                generated_sql: Some(sql),
                validation: Some(validation),
                data: None,
                error: None,
                confidence: 100,
                tokens_used,
            });
        }

        let output = {
            let _slot = self
                .limiter
                .acquire_query_slot(self.config.resilience.rate_limit.acquire_timeout())
                .await?;
            let pool = self.connections.pool(&database)?;
            let db_config = self.connections.config(&database).ok_or_else(|| {
                GatewayError::database_error(format!("Database '{database}' is not configured"))
            })?;
            let exec_started = Instant::now();
            let output = self
                .executor
                .execute(&pool, db_config, &sql, None, None)
                .await?;
            self.metrics.record_query_execution(exec_started.elapsed());
            output
        };

        let confidence = self
            .judge_safely(&question, &sql, &output.rows, output.total_count)
            .await;

        Ok(QueryResponse {
            success: true,
            generated_sql: Some(sql),
            validation: Some(validation),
            data: Some(QueryResult {
                columns: output.columns,
                rows: output.rows,
                row_count: output.row_count,
                execution_time_ms: output.execution_time_ms,
            }),
            error: None,
            confidence,
            tokens_used,
        })
    }

    fn validate_question(&self, question: &str) -> GatewayResult<String> {
        let trimmed = question.trim();
        if trimmed.is_empty() {
            return Err(GatewayError::invalid_request(
                "Question must not be empty",
            ));
        }
        let length = trimmed.chars().count();
        let limit = self.config.security.max_question_length;
        if length > limit {
            return Err(GatewayError::question_too_long(length, limit));
        }
        Ok(trimmed.to_string())
    }

    fn resolve_database(&self, requested: Option<&str>) -> GatewayResult<String> {
        match requested {
            Some(name) => {
                if self.connections.config(name).is_some() {
                    Ok(name.to_string())
                } else {
                    Err(
                        GatewayError::database_error(format!("Database '{name}' not found"))
                            .with_detail("requested_database", name)
                            .with_detail("available_databases", self.connections.database_names()),
                    )
                }
            }
            None => match self.connections.database_count() {
                0 => Err(GatewayError::database_error("No databases configured")),
                1 => Ok(self
                    .connections
                    .default_database()
                    .unwrap_or_default()
                    .to_string()),
                _ => Err(GatewayError::database_error(
                    "Multiple databases available, please specify which to query",
                )
                .with_detail("available_databases", self.connections.database_names())),
            },
        }
    }

    /// Cached schema for `database`, introspecting on a miss.
    pub async fn schema(&self, database: &str) -> GatewayResult<Arc<DatabaseSchema>> {
        if let Some(schema) = self.schema_cache.get(database) {
            self.metrics.record_cache_hit();
            return Ok(schema);
        }
        self.metrics.record_cache_miss();
        let result = self
            .schema_cache
            .load(database, self.schema_loader.as_ref())
            .await;
        self.metrics.record_schema_load(result.is_ok());
        result
    }

    /// The bounded generate-validate loop.
    ///
    /// Validation rejections are retried with the rejected statement and the
    /// rejection reason as feedback, after an exponential-backoff delay.
    /// Generation failures are surfaced immediately; feedback cannot fix a
    /// provider outage.
    async fn generate_with_retry(
        &self,
        question: &str,
        context: Option<&str>,
        schema_context: &str,
    ) -> GatewayResult<(String, ValidationResult, Option<u32>)> {
        let attempts = self.config.retry.max_retries + 1;
        let acquire_timeout = self.config.resilience.rate_limit.acquire_timeout();
        let mut previous_sql: Option<String> = None;
        let mut feedback: Option<String> = None;

        for attempt in 0..attempts {
            if !self.breaker.allow_request() {
                let snap = self.breaker.snapshot();
                return Err(GatewayError::llm_unavailable(
                    "SQL generation is temporarily unavailable (circuit breaker open)",
                )
                .with_detail("circuit_state", snap.state.to_string())
                .with_detail("failure_count", snap.failure_count));
            }

            tracing::debug!(attempt = attempt + 1, max_attempts = attempts, "generating SQL");
            let generated = {
                let _slot = self.limiter.acquire_llm_slot(acquire_timeout).await?;
                let call_started = Instant::now();
                let outcome = self
                    .generator
                    .generate_sql(
                        question,
                        schema_context,
                        context,
                        previous_sql.as_deref(),
                        feedback.as_deref(),
                    )
                    .await;
                self.metrics
                    .record_llm_call(call_started.elapsed(), outcome.is_ok());
                outcome
            };

            let generated = match generated {
                Ok(generated) => generated,
                Err(err) => {
                    self.breaker.record_failure();
                    return Err(err);
                }
            };
            if let Some(tokens) = generated.tokens_used {
                self.metrics.add_tokens_used(u64::from(tokens));
            }

            match self.validator.validate_or_raise(&generated.sql) {
                Ok(validation) => {
                    self.breaker.record_success();
                    tracing::info!(attempt = attempt + 1, "SQL generated and validated");
                    return Ok((generated.sql, validation, generated.tokens_used));
                }
                Err(err) => {
                    self.metrics.record_sql_rejection(err.code);
                    if attempt + 1 < attempts {
                        tracing::warn!(
                            attempt = attempt + 1,
                            error = %err.message,
                            "generated SQL rejected, retrying with feedback"
                        );
                        feedback = Some(err.message.clone());
                        previous_sql = Some(generated.sql);
                        tokio::time::sleep(self.config.retry.delay_after(attempt)).await;
                    } else {
                        self.breaker.record_failure();
                        tracing::error!(
                            attempts,
                            error = %err.message,
                            "SQL rejected on every attempt"
                        );
                        return Err(err);
                    }
                }
            }
        }

        // Unreachable: the loop always returns. Kept as a typed backstop.
        Err(GatewayError::llm_error(
            "SQL generation failed after all retry attempts",
        ))
    }

    /// Scores the results against the question, absorbing every failure.
    ///
    /// Judgment is best-effort by contract: a timeout, a malformed verdict
    /// or a provider error degrades to the default confidence of 100 and
    /// never fails the request.
    async fn judge_safely(
        &self,
        question: &str,
        sql: &str,
        rows: &[serde_json::Map<String, serde_json::Value>],
        total_count: usize,
    ) -> u8 {
        if !self.config.judge.enabled {
            return 100;
        }

        let sample = &rows[..rows.len().min(self.config.judge.sample_rows)];
        let judged = tokio::time::timeout(
            self.config.judge.timeout(),
            self.judge.judge(question, sql, sample, total_count),
        )
        .await;

        match judged {
            Ok(Ok(verdict)) => {
                tracing::info!(
                    confidence = verdict.confidence,
                    is_acceptable = verdict.is_acceptable,
                    explanation = verdict.explanation.as_deref(),
                    "result judgment completed"
                );
                verdict.confidence
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "result judgment failed, using default confidence");
                100
            }
            Err(_) => {
                tracing::warn!(
                    timeout_seconds = self.config.judge.timeout_seconds,
                    "result judgment timed out, using default confidence"
                );
                100
            }
        }
    }
}

impl std::fmt::Debug for QueryOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOrchestrator")
            .field("databases", &self.connections.database_names())
            .finish_non_exhaustive()
    }
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
