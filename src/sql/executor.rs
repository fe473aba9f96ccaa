//! SQL execution against pooled PostgreSQL connections.
//!
//! Every statement runs inside a read-only transaction with a statement
//! timeout, a pinned search_path, and optionally a switched role, all set
//! with `SET LOCAL` so nothing leaks back into the pool. Results are capped
//! and normalized into JSON values.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use deadpool_postgres::{Pool, PoolError};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use tokio_postgres::types::Type;
use tokio_postgres::Row;

use crate::config::{DatabaseConfig, ExecutionConfig};
use crate::error::{GatewayError, GatewayResult};

/// Executed rows plus the counts the pipeline needs downstream.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    /// Column names in result-set order, deduplicated (first occurrence wins).
    pub columns: Vec<String>,
    pub rows: Vec<Map<String, Value>>,
    /// Rows returned after capping.
    pub row_count: usize,
    /// Rows produced by the query before capping.
    pub total_count: usize,
    pub execution_time_ms: f64,
}

/// Executes validated SQL under the configured resource bounds.
#[derive(Debug, Clone)]
pub struct SqlExecutor {
    config: ExecutionConfig,
}

impl SqlExecutor {
    pub fn new(config: ExecutionConfig) -> Self {
        Self { config }
    }

    /// Runs `sql` on a connection from `pool`.
    ///
    /// `timeout` and `max_rows` override the configured defaults for this
    /// call. The statement is assumed to have passed validation already;
    /// the read-only transaction is a second line of defense, not policy.
    pub async fn execute(
        &self,
        pool: &Pool,
        database: &DatabaseConfig,
        sql: &str,
        timeout: Option<Duration>,
        max_rows: Option<usize>,
    ) -> GatewayResult<ExecutionOutput> {
        let timeout = timeout.unwrap_or_else(|| self.config.statement_timeout());
        let max_rows = max_rows.unwrap_or(self.config.max_rows);
        let started = Instant::now();

        let mut client = pool.get().await.map_err(map_pool_error)?;

        let transaction = client
            .build_transaction()
            .read_only(true)
            .start()
            .await
            .map_err(|e| map_db_error(&e, sql))?;

        self.set_session_params(&transaction, database, timeout)
            .await?;

        // Prepare first so column metadata is available even for empty
        // result sets.
        let statement = transaction
            .prepare(sql)
            .await
            .map_err(|e| map_db_error(&e, sql))?;

        let query = transaction.query(&statement, &[]);
        let rows = match tokio::time::timeout(timeout, query).await {
            Ok(result) => result.map_err(|e| map_db_error(&e, sql))?,
            Err(_) => {
                return Err(GatewayError::execution_timeout(timeout.as_secs_f64(), sql));
            }
        };

        transaction
            .commit()
            .await
            .map_err(|e| map_db_error(&e, sql))?;

        let (capped, total_count) = cap_rows(rows, max_rows);

        let mut columns = Vec::new();
        let mut seen = HashSet::new();
        for column in statement.columns() {
            if seen.insert(column.name().to_string()) {
                columns.push(column.name().to_string());
            }
        }

        let mut result_rows = Vec::with_capacity(capped.len());
        for row in &capped {
            result_rows.push(row_to_map(row)?);
        }

        let execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        tracing::debug!(
            database = %database.name,
            rows = result_rows.len(),
            total = total_count,
            elapsed_ms = execution_time_ms,
            "query executed"
        );

        Ok(ExecutionOutput {
            columns,
            row_count: result_rows.len(),
            rows: result_rows,
            total_count,
            execution_time_ms,
        })
    }

    /// Applies SET LOCAL statement_timeout / search_path / ROLE inside the
    /// transaction. The interpolated values are charset-checked because GUC
    /// assignments cannot be parameterized.
    async fn set_session_params(
        &self,
        transaction: &deadpool_postgres::Transaction<'_>,
        database: &DatabaseConfig,
        timeout: Duration,
    ) -> GatewayResult<()> {
        let timeout_ms = timeout.as_millis().max(1);
        let search_path = &self.config.search_path;

        if !is_safe_search_path(search_path) {
            return Err(GatewayError::database_error("Invalid search_path configuration")
                .with_detail("search_path", search_path.clone()));
        }

        let mut statements = format!(
            "SET LOCAL statement_timeout = {timeout_ms}; \
             SET LOCAL search_path = '{search_path}'"
        );

        if let Some(role) = database.readonly_role.as_deref() {
            if !is_safe_identifier(role) {
                return Err(GatewayError::database_error("Invalid readonly_role configuration")
                    .with_detail("readonly_role", role));
            }
            statements.push_str(&format!("; SET LOCAL ROLE {role}"));
        }

        transaction.batch_execute(&statements).await.map_err(|e| {
            let mut err = GatewayError::database_error(format!(
                "Failed to set session parameters: {e}"
            ))
            .with_detail("timeout_ms", timeout_ms as u64)
            .with_detail("search_path", search_path.clone());
            if let Some(role) = database.readonly_role.as_deref() {
                err = err.with_detail("readonly_role", role);
            }
            err
        })
    }
}

/// Letters, digits, underscores, commas and spaces only; enough for a
/// schema list like `public, analytics`.
fn is_safe_search_path(search_path: &str) -> bool {
    !search_path.is_empty()
        && search_path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ',' | ' '))
}

/// Letters, digits and underscores only.
fn is_safe_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn map_pool_error(err: PoolError) -> GatewayError {
    match err {
        PoolError::Timeout(_) => {
            GatewayError::resource_exhausted("Connection pool exhausted, no connection available")
        }
        PoolError::Backend(e) => GatewayError::database_connection_error(format!(
            "Failed to acquire database connection: {e}"
        )),
        other => GatewayError::database_connection_error(format!(
            "Failed to acquire database connection: {other}"
        )),
    }
}

fn map_db_error(err: &tokio_postgres::Error, sql: &str) -> GatewayError {
    let truncated: String = sql.chars().take(200).collect();
    if let Some(db_err) = err.as_db_error() {
        GatewayError::database_error(format!("Database query failed: {}", db_err.message()))
            .with_detail("error_code", db_err.code().code())
            .with_detail("error_message", db_err.message())
            .with_detail("sql", truncated)
    } else {
        GatewayError::database_error(format!("Database query failed: {err}"))
            .with_detail("error_message", err.to_string())
            .with_detail("sql", truncated)
    }
}

/// Converts one row into a JSON object, normalizing driver types.
/// Duplicate column names keep the first value.
fn row_to_map(row: &Row) -> GatewayResult<Map<String, Value>> {
    let mut map = Map::new();
    for (idx, column) in row.columns().iter().enumerate() {
        let value = cell_to_json(row, idx, column.type_()).map_err(|e| {
            GatewayError::database_error(format!("Failed to decode column '{}': {e}", column.name()))
                .with_detail("column", column.name())
                .with_detail("data_type", column.type_().name())
        })?;
        map.entry(column.name().to_string()).or_insert(value);
    }
    Ok(map)
}

fn cell_to_json(row: &Row, idx: usize, ty: &Type) -> Result<Value, tokio_postgres::Error> {
    let value = match *ty {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)?
            .map_or(Value::Null, Value::from),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(idx)?
            .map_or(Value::Null, Value::from),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(idx)?
            .map_or(Value::Null, Value::from),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)?
            .map_or(Value::Null, Value::from),
        Type::OID => row
            .try_get::<_, Option<u32>>(idx)?
            .map_or(Value::Null, Value::from),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map_or(Value::Null, |v| json_f64(f64::from(v))),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)?
            .map_or(Value::Null, json_f64),
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(idx)?
            .map_or(Value::Null, decimal_to_json),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => row
            .try_get::<_, Option<String>>(idx)?
            .map_or(Value::Null, Value::from),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(idx)?
            .map_or(Value::Null, uuid_to_json),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map_or(Value::Null, |b| Value::from(hex_string(&b))),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)?
            .map_or(Value::Null, timestamp_to_json),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)?
            .map_or(Value::Null, timestamptz_to_json),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)?
            .map_or(Value::Null, |d| Value::from(d.to_string())),
        Type::TIME => row
            .try_get::<_, Option<chrono::NaiveTime>>(idx)?
            .map_or(Value::Null, time_to_json),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<Value>>(idx)?
            .unwrap_or(Value::Null),
        Type::BOOL_ARRAY => array_to_json(row.try_get::<_, Option<Vec<Option<bool>>>>(idx)?, Value::from),
        Type::INT2_ARRAY => array_to_json(row.try_get::<_, Option<Vec<Option<i16>>>>(idx)?, Value::from),
        Type::INT4_ARRAY => array_to_json(row.try_get::<_, Option<Vec<Option<i32>>>>(idx)?, Value::from),
        Type::INT8_ARRAY => array_to_json(row.try_get::<_, Option<Vec<Option<i64>>>>(idx)?, Value::from),
        Type::FLOAT4_ARRAY => array_to_json(row.try_get::<_, Option<Vec<Option<f32>>>>(idx)?, |v| {
            json_f64(f64::from(v))
        }),
        Type::FLOAT8_ARRAY => {
            array_to_json(row.try_get::<_, Option<Vec<Option<f64>>>>(idx)?, json_f64)
        }
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => {
            array_to_json(row.try_get::<_, Option<Vec<Option<String>>>>(idx)?, Value::from)
        }
        Type::UUID_ARRAY => {
            array_to_json(row.try_get::<_, Option<Vec<Option<uuid::Uuid>>>>(idx)?, uuid_to_json)
        }
        Type::NUMERIC_ARRAY => {
            array_to_json(row.try_get::<_, Option<Vec<Option<Decimal>>>>(idx)?, decimal_to_json)
        }
        _ => {
            // Anything else falls back to the driver's text form when it
            // has one, otherwise the cell becomes null.
            match row.try_get::<_, Option<String>>(idx) {
                Ok(value) => value.map_or(Value::Null, Value::from),
                Err(_) => {
                    tracing::debug!(
                        data_type = ty.name(),
                        "no JSON mapping for column type, returning null"
                    );
                    Value::Null
                }
            }
        }
    };
    Ok(value)
}

/// Truncates to the row cap, returning the rows kept and the count produced
/// before capping. Order is preserved.
fn cap_rows<T>(mut rows: Vec<T>, max_rows: usize) -> (Vec<T>, usize) {
    let total = rows.len();
    rows.truncate(max_rows);
    (rows, total)
}

/// NUMERIC values outside f64 range (or otherwise unconvertible) become null.
fn decimal_to_json(value: Decimal) -> Value {
    value.to_f64().map_or(Value::Null, json_f64)
}

fn uuid_to_json(value: uuid::Uuid) -> Value {
    Value::from(value.to_string())
}

fn timestamp_to_json(value: chrono::NaiveDateTime) -> Value {
    Value::from(value.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
}

fn timestamptz_to_json(value: chrono::DateTime<chrono::Utc>) -> Value {
    Value::from(value.to_rfc3339())
}

fn time_to_json(value: chrono::NaiveTime) -> Value {
    Value::from(value.format("%H:%M:%S%.f").to_string())
}

fn array_to_json<T>(items: Option<Vec<Option<T>>>, convert: impl Fn(T) -> Value) -> Value {
    match items {
        None => Value::Null,
        Some(items) => Value::Array(
            items
                .into_iter()
                .map(|item| item.map_or(Value::Null, &convert))
                .collect(),
        ),
    }
}

/// Non-finite floats have no JSON representation and become null.
fn json_f64(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
