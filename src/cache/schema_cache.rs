//! TTL cache for introspected database schemas.
//!
//! Schema introspection runs a dozen catalog queries per table, so results
//! are cached per database and reused until the TTL lapses. Stale entries are
//! evicted lazily on read. An optional background task re-introspects every
//! cached database on a fixed interval; stopping it wakes the sleep and waits
//! for the task, so no refresh can race shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::CacheConfig;
use crate::db::SchemaLoader;
use crate::error::GatewayResult;
use crate::models::DatabaseSchema;

#[derive(Debug, Clone)]
struct CacheEntry {
    schema: Arc<DatabaseSchema>,
    loaded_at: Instant,
}

/// Serializable cache state for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaCacheSnapshot {
    pub enabled: bool,
    pub ttl_seconds: u64,
    /// Database name -> seconds since its schema was loaded.
    pub entry_ages: HashMap<String, u64>,
}

/// Per-database schema cache with TTL expiry and optional auto-refresh.
pub struct SchemaCache {
    enabled: bool,
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
    refresh_handle: Mutex<Option<JoinHandle<()>>>,
    stop_requested: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
}

impl SchemaCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_ttl(config.enabled, config.ttl())
    }

    fn with_ttl(enabled: bool, ttl: Duration) -> Self {
        Self {
            enabled,
            ttl,
            entries: RwLock::new(HashMap::new()),
            refresh_handle: Mutex::new(None),
            stop_requested: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
        }
    }

    /// Returns the cached schema if present and fresh. A stale entry is
    /// evicted and reported as a miss.
    pub fn get(&self, database: &str) -> Option<Arc<DatabaseSchema>> {
        if !self.enabled {
            return None;
        }

        {
            let entries = self.entries.read();
            match entries.get(database) {
                Some(entry) if entry.loaded_at.elapsed() < self.ttl => {
                    return Some(Arc::clone(&entry.schema));
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Entry was stale; re-check under the write lock in case a refresh
        // replaced it between the two lock acquisitions.
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(database) {
            if entry.loaded_at.elapsed() < self.ttl {
                return Some(Arc::clone(&entry.schema));
            }
            tracing::debug!(database = %database, "evicting expired schema cache entry");
            entries.remove(database);
        }
        None
    }

    /// Introspects `database` through `loader` and caches the result.
    ///
    /// The fresh schema is returned even when caching is disabled, so the
    /// cache degrades to a pass-through.
    pub async fn load(
        &self,
        database: &str,
        loader: &dyn SchemaLoader,
    ) -> GatewayResult<Arc<DatabaseSchema>> {
        let schema = Arc::new(loader.load_schema(database).await?);
        if self.enabled {
            self.entries.write().insert(
                database.to_string(),
                CacheEntry {
                    schema: Arc::clone(&schema),
                    loaded_at: Instant::now(),
                },
            );
            tracing::debug!(
                database = %database,
                tables = schema.tables.len(),
                "schema cached"
            );
        }
        Ok(schema)
    }

    /// Forces re-introspection of `database`, replacing any cached entry.
    pub async fn refresh(
        &self,
        database: &str,
        loader: &dyn SchemaLoader,
    ) -> GatewayResult<Arc<DatabaseSchema>> {
        self.load(database, loader).await
    }

    /// Evicts one database, or everything when `database` is `None`.
    pub fn clear(&self, database: Option<&str>) {
        let mut entries = self.entries.write();
        match database {
            Some(name) => {
                entries.remove(name);
            }
            None => entries.clear(),
        }
    }

    /// Seconds since the entry was loaded, regardless of freshness.
    pub fn age(&self, database: &str) -> Option<Duration> {
        self.entries
            .read()
            .get(database)
            .map(|entry| entry.loaded_at.elapsed())
    }

    /// Names of every currently cached database.
    pub fn cached_databases(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> SchemaCacheSnapshot {
        let entry_ages = self
            .entries
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.loaded_at.elapsed().as_secs()))
            .collect();
        SchemaCacheSnapshot {
            enabled: self.enabled,
            ttl_seconds: self.ttl.as_secs(),
            entry_ages,
        }
    }

    /// Spawns the background refresh loop.
    ///
    /// Every `interval`, each currently cached database whose name appears
    /// in `loaders` is re-introspected. One database's failure is logged and
    /// does not affect the others or stop the loop. A previous loop, if any,
    /// keeps running; call [`stop_auto_refresh`](Self::stop_auto_refresh)
    /// first to replace it.
    pub fn start_auto_refresh(
        self: &Arc<Self>,
        interval: Duration,
        loaders: HashMap<String, Arc<dyn SchemaLoader>>,
    ) {
        self.stop_requested.store(false, Ordering::SeqCst);
        let cache = Arc::clone(self);
        let stop_requested = Arc::clone(&self.stop_requested);
        let stop_signal = Arc::clone(&self.stop_signal);

        let handle = tokio::spawn(async move {
            tracing::info!(
                interval_secs = interval.as_secs_f64(),
                databases = loaders.len(),
                "schema auto-refresh loop started"
            );
            loop {
                tokio::select! {
                    () = stop_signal.notified() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                if stop_requested.load(Ordering::SeqCst) {
                    break;
                }

                for database in cache.cached_databases() {
                    let Some(loader) = loaders.get(&database) else {
                        continue;
                    };
                    match cache.refresh(&database, loader.as_ref()).await {
                        Ok(schema) => tracing::debug!(
                            database = %database,
                            tables = schema.tables.len(),
                            "schema auto-refreshed"
                        ),
                        Err(err) => tracing::warn!(
                            database = %database,
                            error = %err,
                            "schema auto-refresh failed, keeping previous entry"
                        ),
                    }
                }
            }
            tracing::info!("schema auto-refresh loop stopped");
        });

        *self.refresh_handle.lock() = Some(handle);
    }

    /// Stops the refresh loop and waits for it to finish.
    ///
    /// The stop both wakes an in-progress sleep and is awaited, so no
    /// refresh runs after this returns. A no-op when the loop never started.
    pub async fn stop_auto_refresh(&self) {
        let handle = self.refresh_handle.lock().take();
        if let Some(handle) = handle {
            self.stop_requested.store(true, Ordering::SeqCst);
            self.stop_signal.notify_one();
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "schema auto-refresh task panicked");
            }
        }
    }
}

impl std::fmt::Debug for SchemaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCache")
            .field("enabled", &self.enabled)
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Loader that counts calls and hands out empty schemas.
    struct CountingLoader {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingLoader {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SchemaLoader for CountingLoader {
        async fn load_schema(&self, database: &str) -> GatewayResult<DatabaseSchema> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(crate::error::GatewayError::schema_load_error(
                    "introspection failed",
                ));
            }
            Ok(DatabaseSchema {
                database_name: database.to_string(),
                tables: Vec::new(),
                enum_types: Vec::new(),
                version: None,
            })
        }
    }

    fn cache(ttl: Duration) -> SchemaCache {
        SchemaCache::with_ttl(true, ttl)
    }

    #[tokio::test]
    async fn load_then_get_hits() {
        let cache = cache(Duration::from_secs(60));
        let loader = CountingLoader::new();

        assert!(cache.get("shop").is_none());
        let loaded = cache.load("shop", &loader).await.unwrap();
        assert_eq!(loaded.database_name, "shop");

        let hit = cache.get("shop").unwrap();
        assert_eq!(hit.database_name, "shop");
        assert_eq!(loader.calls(), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_evicted_on_read() {
        let cache = cache(Duration::from_millis(20));
        let loader = CountingLoader::new();
        cache.load("shop", &loader).await.unwrap();
        assert!(cache.get("shop").is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("shop").is_none());
        // The eviction removed the entry entirely.
        assert!(cache.age("shop").is_none());
        assert!(cache.cached_databases().is_empty());
    }

    #[tokio::test]
    async fn disabled_cache_is_pass_through() {
        let cache = SchemaCache::with_ttl(false, Duration::from_secs(60));
        let loader = CountingLoader::new();

        let loaded = cache.load("shop", &loader).await.unwrap();
        assert_eq!(loaded.database_name, "shop");
        // Nothing was stored, so every get misses.
        assert!(cache.get("shop").is_none());
        assert!(cache.cached_databases().is_empty());
    }

    #[tokio::test]
    async fn load_failure_propagates_and_keeps_old_entry() {
        let cache = cache(Duration::from_secs(60));
        let good = CountingLoader::new();
        let bad = CountingLoader::failing();

        cache.load("shop", &good).await.unwrap();
        let err = cache.refresh("shop", &bad).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::SchemaLoadError);
        assert!(cache.get("shop").is_some());
    }

    #[tokio::test]
    async fn clear_evicts_one_or_all() {
        let cache = cache(Duration::from_secs(60));
        let loader = CountingLoader::new();
        cache.load("shop", &loader).await.unwrap();
        cache.load("analytics", &loader).await.unwrap();

        cache.clear(Some("shop"));
        assert!(cache.get("shop").is_none());
        assert!(cache.get("analytics").is_some());

        cache.clear(None);
        assert!(cache.get("analytics").is_none());
    }

    #[tokio::test]
    async fn age_reports_entry_age() {
        let cache = cache(Duration::from_secs(60));
        let loader = CountingLoader::new();
        cache.load("shop", &loader).await.unwrap();

        let age = cache.age("shop").unwrap();
        assert!(age < Duration::from_secs(1));
        assert!(cache.age("missing").is_none());

        let snap = cache.snapshot();
        assert!(snap.enabled);
        assert_eq!(snap.ttl_seconds, 60);
        assert_eq!(snap.entry_ages.len(), 1);
    }

    #[tokio::test]
    async fn auto_refresh_reloads_cached_databases() {
        let cache = Arc::new(cache(Duration::from_secs(60)));
        let loader = Arc::new(CountingLoader::new());
        cache.load("shop", loader.as_ref()).await.unwrap();
        assert_eq!(loader.calls(), 1);

        let mut loaders: HashMap<String, Arc<dyn SchemaLoader>> = HashMap::new();
        loaders.insert("shop".to_string(), Arc::clone(&loader) as Arc<dyn SchemaLoader>);
        cache.start_auto_refresh(Duration::from_millis(20), loaders);

        tokio::time::sleep(Duration::from_millis(70)).await;
        cache.stop_auto_refresh().await;
        assert!(loader.calls() >= 2);

        // No refresh may run after the stop returns.
        let calls_after_stop = loader.calls();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(loader.calls(), calls_after_stop);
    }

    #[tokio::test]
    async fn auto_refresh_survives_loader_failures() {
        let cache = Arc::new(cache(Duration::from_secs(60)));
        let good = Arc::new(CountingLoader::new());
        let bad = Arc::new(CountingLoader::failing());
        cache.load("shop", good.as_ref()).await.unwrap();
        cache.load("broken", good.as_ref()).await.unwrap();

        let mut loaders: HashMap<String, Arc<dyn SchemaLoader>> = HashMap::new();
        loaders.insert("shop".to_string(), Arc::clone(&good) as Arc<dyn SchemaLoader>);
        loaders.insert("broken".to_string(), Arc::clone(&bad) as Arc<dyn SchemaLoader>);
        cache.start_auto_refresh(Duration::from_millis(20), loaders);

        tokio::time::sleep(Duration::from_millis(70)).await;
        cache.stop_auto_refresh().await;

        // The failing database kept failing without stopping the loop.
        assert!(bad.calls() >= 2);
        assert!(good.calls() >= 3);
        assert!(cache.get("shop").is_some());
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let cache = cache(Duration::from_secs(60));
        cache.stop_auto_refresh().await;
    }
}
