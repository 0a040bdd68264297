//! Fast-state cache for execution snapshots.
//!
//! The cache mirrors the latest execution row for low-latency status polls.
//! It is never authoritative: entries expire after a TTL and any error is
//! treated by callers as a miss. Expired entries are dropped lazily on read
//! and swept on write at most once per TTL, so ids that are never read again
//! do not accumulate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;

use crate::models::ExecutionRow;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Key/value cache of execution rows keyed by execution id.
pub trait StateCache: Send + Sync {
    fn get(&self, execution_id: &str) -> Result<Option<ExecutionRow>, CacheError>;
    fn put(&self, row: ExecutionRow) -> Result<(), CacheError>;
    fn invalidate(&self, execution_id: &str) -> Result<(), CacheError>;
}

/// In-process TTL cache.
pub struct TtlCache {
    entries: DashMap<String, (Instant, ExecutionRow)>,
    ttl: Duration,
    origin: Instant,
    /// Milliseconds since `origin` at the last write-side sweep.
    last_sweep_ms: AtomicU64,
}

impl TtlCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            origin: Instant::now(),
            last_sweep_ms: AtomicU64::new(0),
        }
    }

    /// Sweep if a full TTL has passed since the last sweep. Only one writer
    /// wins the swap, the rest skip.
    fn maybe_sweep(&self) {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < self.ttl.as_millis() as u64 {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.purge_expired();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, (inserted, _)| inserted.elapsed() < self.ttl);
        before - self.entries.len()
    }
}

impl StateCache for TtlCache {
    fn get(&self, execution_id: &str) -> Result<Option<ExecutionRow>, CacheError> {
        let hit = match self.entries.get(execution_id) {
            Some(entry) if entry.0.elapsed() < self.ttl => Some(entry.1.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if hit.is_none() {
            self.entries.remove(execution_id);
        }
        Ok(hit)
    }

    fn put(&self, row: ExecutionRow) -> Result<(), CacheError> {
        self.maybe_sweep();
        self.entries.insert(row.id.clone(), (Instant::now(), row));
        Ok(())
    }

    fn invalidate(&self, execution_id: &str) -> Result<(), CacheError> {
        self.entries.remove(execution_id);
        Ok(())
    }
}
