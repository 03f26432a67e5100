//! Request-level cache statistics

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::SystemTime,
};

use serde::{Deserialize, Serialize};

use crate::record::Source;

/// Snapshot of request outcomes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Requests served from memory
    pub memory_hits: u64,
    /// Requests served from persistence
    pub persistence_hits: u64,
    /// Requests served by the loader
    pub cloud_loads: u64,
    /// Records found past their lifetime during lookup
    pub expired_evictions: u64,
    /// Requests served with expired data after the loader was unavailable or failed
    pub fallbacks_served: u64,
    /// Requests that ended in an error
    pub failures: u64,
    /// When counting started
    pub created_at: SystemTime,
}

impl CacheStats {
    /// Requests answered from either cache layer
    pub fn hits(&self) -> u64 {
        self.memory_hits + self.persistence_hits
    }

    /// Hit rate as a percentage (0.0 to 100.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.cloud_loads;
        if total == 0 {
            0.0
        } else {
            (self.hits() as f64 / total as f64) * 100.0
        }
    }
}

/// Thread-safe counters behind [`CacheStats`]
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    memory_hits: Arc<AtomicU64>,
    persistence_hits: Arc<AtomicU64>,
    cloud_loads: Arc<AtomicU64>,
    expired_evictions: Arc<AtomicU64>,
    fallbacks_served: Arc<AtomicU64>,
    failures: Arc<AtomicU64>,
    created_at: SystemTime,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            memory_hits: Arc::new(AtomicU64::new(0)),
            persistence_hits: Arc::new(AtomicU64::new(0)),
            cloud_loads: Arc::new(AtomicU64::new(0)),
            expired_evictions: Arc::new(AtomicU64::new(0)),
            fallbacks_served: Arc::new(AtomicU64::new(0)),
            failures: Arc::new(AtomicU64::new(0)),
            created_at: SystemTime::now(),
        }
    }

    /// Count a request served from `source`
    pub fn record_served(&self, source: Source) {
        let counter = match source {
            Source::Memory => &self.memory_hits,
            Source::Persistence => &self.persistence_hits,
            Source::Cloud => &self.cloud_loads,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.expired_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Current statistics snapshot
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            persistence_hits: self.persistence_hits.load(Ordering::Relaxed),
            cloud_loads: self.cloud_loads.load(Ordering::Relaxed),
            expired_evictions: self.expired_evictions.load(Ordering::Relaxed),
            fallbacks_served: self.fallbacks_served.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            created_at: self.created_at,
        }
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}
