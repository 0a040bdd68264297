//! Storage facade: one handle over the durable stores and the fast-state
//! cache.
//!
//! Execution writes go to the durable store first and are then mirrored into
//! the cache. Reads prefer the cache and fall back to the durable store. A
//! failing cache only ever costs latency: its errors are logged, never
//! returned.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::{
    cache::{StateCache, TtlCache},
    models::ExecutionRow,
    repository::executions as exec_repo,
    DbError, DbPool,
};

#[derive(Clone)]
pub struct Storage {
    pool: DbPool,
    cache: Arc<dyn StateCache>,
}

impl Storage {
    pub fn new(pool: DbPool, cache: Arc<dyn StateCache>) -> Self {
        Self { pool, cache }
    }

    /// Storage backed by an in-process [`TtlCache`].
    pub fn with_ttl_cache(pool: DbPool, ttl: Duration) -> Self {
        Self::new(pool, Arc::new(TtlCache::new(ttl)))
    }

    /// Durable pool, for definition and handoff repositories.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Write-through: durable store, then cache.
    pub async fn save_execution(&self, row: &ExecutionRow) -> Result<(), DbError> {
        exec_repo::upsert_execution(&self.pool, row).await?;
        if let Err(e) = self.cache.put(row.clone()) {
            warn!(execution_id = %row.id, error = %e, "cache write failed; invalidating");
            let _ = self.cache.invalidate(&row.id);
        }
        Ok(())
    }

    /// Cache first, durable store on miss or cache failure.
    pub async fn load_execution(&self, execution_id: &str) -> Result<ExecutionRow, DbError> {
        match self.cache.get(execution_id) {
            Ok(Some(row)) => {
                debug!(execution_id, "execution cache hit");
                return Ok(row);
            }
            Ok(None) => {}
            Err(e) => warn!(execution_id, error = %e, "cache read failed; reading durable store"),
        }

        let row = exec_repo::get_execution(&self.pool, execution_id).await?;
        if let Err(e) = self.cache.put(row.clone()) {
            debug!(execution_id, error = %e, "cache refill skipped");
        }
        Ok(row)
    }

    /// Bypass the cache entirely.
    pub async fn load_execution_durable(&self, execution_id: &str) -> Result<ExecutionRow, DbError> {
        exec_repo::get_execution(&self.pool, execution_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheError;
    use crate::pool::migrated_memory_pool;
    use chrono::Utc;

    /// A cache that is permanently down.
    struct BrokenCache;

    impl StateCache for BrokenCache {
        fn get(&self, _: &str) -> Result<Option<ExecutionRow>, CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        fn put(&self, _: ExecutionRow) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
        fn invalidate(&self, _: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".into()))
        }
    }

    fn row(id: &str, status: &str) -> ExecutionRow {
        let now = Utc::now();
        ExecutionRow {
            id: id.into(),
            workflow_id: "wf".into(),
            workflow_version: 1,
            status: status.into(),
            priority: 0,
            snapshot: "{}".into(),
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn reads_prefer_cache() {
        let pool = migrated_memory_pool().await.unwrap();
        let cache = Arc::new(TtlCache::new(Duration::from_secs(60)));
        let storage = Storage::new(pool, cache.clone());

        storage.save_execution(&row("e1", "running")).await.unwrap();
        // Poison the cached copy; a cache hit must return it.
        cache.put(row("e1", "cached")).unwrap();

        assert_eq!(storage.load_execution("e1").await.unwrap().status, "cached");
        assert_eq!(storage.load_execution_durable("e1").await.unwrap().status, "running");
    }

    #[tokio::test]
    async fn cache_outage_degrades_to_durable_store() {
        let pool = migrated_memory_pool().await.unwrap();
        let storage = Storage::new(pool, Arc::new(BrokenCache));

        storage.save_execution(&row("e1", "running")).await.unwrap();
        assert_eq!(storage.load_execution("e1").await.unwrap().status, "running");
    }
}
