//! Connection pool management for the configured databases.
//!
//! One deadpool pool per database, created lazily on first use and shared
//! for the process lifetime. Pools hand out connections on demand, so
//! registering a database is cheap until a query actually targets it.

use std::collections::HashMap;

use deadpool_postgres::{ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use parking_lot::RwLock;
use tokio_postgres::NoTls;

use crate::config::DatabaseConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::observability::redact_dsn;

/// Owns the pools for every configured database.
pub struct ConnectionManager {
    configs: HashMap<String, DatabaseConfig>,
    /// Configuration order, used for default selection and error listings.
    names: Vec<String>,
    pools: RwLock<HashMap<String, Pool>>,
}

impl ConnectionManager {
    /// Registers the given databases. The first one becomes the default.
    pub fn new(databases: &[DatabaseConfig]) -> Self {
        let mut configs = HashMap::new();
        let mut names = Vec::new();
        for db in databases {
            if configs.insert(db.name.clone(), db.clone()).is_none() {
                names.push(db.name.clone());
            }
        }
        Self {
            configs,
            names,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Configured database names, in configuration order.
    pub fn database_names(&self) -> Vec<String> {
        self.names.clone()
    }

    /// The database used when a request does not name one. Only meaningful
    /// when exactly one database is configured.
    pub fn default_database(&self) -> Option<&str> {
        self.names.first().map(String::as_str)
    }

    pub fn database_count(&self) -> usize {
        self.names.len()
    }

    pub fn config(&self, name: &str) -> Option<&DatabaseConfig> {
        self.configs.get(name)
    }

    /// Returns the pool for `name`, creating it on first use.
    pub fn pool(&self, name: &str) -> GatewayResult<Pool> {
        if let Some(pool) = self.pools.read().get(name) {
            return Ok(pool.clone());
        }

        let config = self.configs.get(name).ok_or_else(|| {
            GatewayError::database_error(format!("Database '{name}' is not configured"))
                .with_detail("available_databases", self.database_names())
        })?;

        let mut pools = self.pools.write();
        // Another caller may have won the race while the read lock was
        // released.
        if let Some(pool) = pools.get(name) {
            return Ok(pool.clone());
        }

        tracing::info!(
            database = %name,
            dsn = %redact_dsn(&connection_description(config)),
            "initializing connection pool"
        );
        let pool = build_pool(config)?;
        pools.insert(name.to_string(), pool.clone());
        Ok(pool)
    }

    /// Verifies `name` is reachable by running a trivial query.
    pub async fn health_check(&self, name: &str) -> GatewayResult<()> {
        let pool = self.pool(name)?;
        let client = pool.get().await.map_err(|e| {
            GatewayError::database_connection_error(format!(
                "Failed to acquire connection for '{name}': {e}"
            ))
        })?;
        client.simple_query("SELECT 1").await.map_err(|e| {
            GatewayError::database_connection_error(format!(
                "Health check failed for '{name}': {e}"
            ))
        })?;
        Ok(())
    }

    /// Closes every pool. In-flight connections finish their current work;
    /// new acquisitions fail immediately.
    pub fn close_all(&self) {
        let pools = self.pools.write();
        for (name, pool) in pools.iter() {
            tracing::info!(database = %name, "closing connection pool");
            pool.close();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("databases", &self.names)
            .finish_non_exhaustive()
    }
}

/// Key-value connection string for log lines. Always pass the result
/// through [`redact_dsn`] before it reaches a subscriber.
fn connection_description(db: &DatabaseConfig) -> String {
    let mut dsn = format!(
        "host={} port={} dbname={} user={}",
        db.host,
        db.port,
        db.database_name(),
        db.user
    );
    if !db.password.is_empty() {
        dsn.push_str(" password=");
        dsn.push_str(&db.password);
    }
    dsn
}

fn build_pool(db: &DatabaseConfig) -> GatewayResult<Pool> {
    let mut cfg = deadpool_postgres::Config::new();
    cfg.host = Some(db.host.clone());
    cfg.port = Some(db.port);
    cfg.dbname = Some(db.database_name().to_string());
    cfg.user = Some(db.user.clone());
    cfg.password = Some(db.password.clone());
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let mut pool_config = PoolConfig::new(db.max_pool_size);
    pool_config.timeouts.wait = Some(db.pool_timeout());
    pool_config.timeouts.create = Some(db.pool_timeout());
    cfg.pool = Some(pool_config);

    cfg.create_pool(Some(Runtime::Tokio1), NoTls).map_err(|e| {
        GatewayError::database_connection_error(format!(
            "Failed to create connection pool for '{}': {e}",
            db.name
        ))
    })
}
