//! Eviction and expiration policies
//!
//! - [`has_expired`]: time-based expiration check
//! - [`EvictRecord`]: explicit eviction by key scope across both layers
//! - [`EvictExpirableRecords`]: size-capped maintenance sweep
//! - [`EvictExpiredRecords`]: startup sweep of records past their lifetime

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    key::{self, KeyScope},
    memory::Memory,
    persistence::Persistence,
    record::Record,
    settings::{CacheSettings, BYTES_PER_MB},
    Result,
};

/// Whether a record has outlived its lifetime at `now_millis`.
///
/// Records that are not expirable, or have no lifetime, never expire by time.
pub fn has_expired<T>(record: &Record<T>, now_millis: i64) -> bool {
    record
        .ttl_remaining(now_millis)
        .is_some_and(|remaining| remaining < 0)
}

/// Read a persisted record whatever its encryption state: plain first, then
/// with the known encryption key. Undecodable records come back as `None`.
pub(crate) async fn decode_any(
    persistence: &dyn Persistence,
    key: &str,
    encryption_key: Option<&str>,
) -> Option<Record<Value>> {
    if let Some(record) = persistence.retrieve(key, false, None).await {
        return Some(record);
    }
    match encryption_key {
        Some(secret) => persistence.retrieve(key, true, Some(secret)).await,
        None => None,
    }
}

/// Explicit eviction across memory and persistence
pub struct EvictRecord {
    memory: Arc<dyn Memory>,
    persistence: Arc<dyn Persistence>,
}

impl EvictRecord {
    pub fn new(memory: Arc<dyn Memory>, persistence: Arc<dyn Persistence>) -> Self {
        Self { memory, persistence }
    }

    /// Evict every record inside `scope` from both layers.
    ///
    /// Returns the number of persisted records removed.
    pub async fn evict_scope(&self, scope: &KeyScope<'_>) -> Result<usize> {
        if let KeyScope::DynamicKeyGroup {
            provider_key,
            dynamic_key,
            dynamic_key_group,
        } = scope
        {
            let composed = key::compose(provider_key, dynamic_key, dynamic_key_group);
            self.memory.evict(&composed);
            let existed = self.persistence.evict(&composed).await?;
            debug!("Evicted dynamic key group {}", composed);
            return Ok(usize::from(existed));
        }

        for key in self.memory.keys() {
            if scope.matches(&key) {
                self.memory.evict(&key);
            }
        }

        let mut evicted = 0;
        for key in self.persistence.all_keys().await? {
            if scope.matches(&key) && self.persistence.evict(&key).await? {
                evicted += 1;
            }
        }
        debug!("Evicted {} persisted records for {:?}", evicted, scope);
        Ok(evicted)
    }

    /// Evict every record except engine bookkeeping
    pub async fn evict_all(&self) -> Result<()> {
        self.memory.evict_all();
        for key in self.persistence.all_keys().await? {
            if !key::is_reserved(&key) {
                self.persistence.evict(&key).await?;
            }
        }
        info!("Evicted all cached records");
        Ok(())
    }
}

/// What a size-capped sweep did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// Stored size is under the threshold; nothing to do
    BelowThreshold { stored_bytes: u64 },
    /// Some expirable records were evicted
    Evicted { evicted: usize, stored_bytes: u64 },
    /// Over the threshold but no expirable record exists
    NothingEvictable { stored_bytes: u64 },
}

/// Size-capped maintenance sweep.
///
/// Starts when persisted size reaches `max_mb_persistence` and evicts
/// expirable records until size falls to `max_mb_persistence * evict_stop_ratio`.
/// After finding nothing evictable it stays idle until an expirable record
/// is saved again, so repeated saves over the threshold do not rescan.
///
/// Expirable saves bump a generation counter. A sweep that runs out of
/// candidates records the generation it scanned, and the sweep stays armed
/// whenever a later save has moved the counter past it.
pub struct EvictExpirableRecords {
    memory: Arc<dyn Memory>,
    persistence: Arc<dyn Persistence>,
    max_mb: u64,
    threshold_bytes: u64,
    target_bytes: u64,
    pacing: Duration,
    encryption_key: Option<String>,
    expirable_saves: AtomicU64,
    exhausted_at: AtomicU64,
    sweep_lock: Mutex<()>,
}

impl EvictExpirableRecords {
    pub fn new(
        memory: Arc<dyn Memory>,
        persistence: Arc<dyn Persistence>,
        settings: &CacheSettings,
    ) -> Self {
        Self {
            memory,
            persistence,
            max_mb: settings.max_mb_persistence,
            threshold_bytes: settings.max_mb_persistence.saturating_mul(BYTES_PER_MB),
            target_bytes: settings.sweep_target_bytes(),
            pacing: Duration::from_millis(settings.sweep_pacing_ms),
            encryption_key: settings.encryption_key.clone(),
            // Armed until a first sweep proves otherwise
            expirable_saves: AtomicU64::new(1),
            exhausted_at: AtomicU64::new(0),
            sweep_lock: Mutex::new(()),
        }
    }

    /// Record that an expirable record was written, re-arming the sweep
    pub fn notify_expirable_saved(&self) {
        self.expirable_saves.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether an expirable record may exist that no sweep has seen
    pub fn could_be_expirable(&self) -> bool {
        self.expirable_saves.load(Ordering::Acquire) != self.exhausted_at.load(Ordering::Acquire)
    }

    /// Run the sweep in the background unless one is already in progress
    pub fn trigger(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(_guard) = this.sweep_lock.try_lock() else {
                debug!("Size-capped sweep already running");
                return;
            };
            if let Err(e) = this.sweep_locked().await {
                warn!("Size-capped sweep failed: {}", e);
            }
        });
    }

    /// Run the sweep now, waiting for any sweep in progress
    pub async fn sweep(&self) -> Result<SweepOutcome> {
        let _guard = self.sweep_lock.lock().await;
        self.sweep_locked().await
    }

    async fn sweep_locked(&self) -> Result<SweepOutcome> {
        let mut stored_bytes = self.persistence.stored_size_bytes().await?;
        // Compare bytes: rounded-up MB would put the cap below the stop target
        if stored_bytes < self.threshold_bytes {
            return Ok(SweepOutcome::BelowThreshold { stored_bytes });
        }
        if !self.could_be_expirable() {
            debug!("Persistence over {} MB but no expirable records", self.max_mb);
            return Ok(SweepOutcome::NothingEvictable { stored_bytes });
        }

        // Saves notified after this point re-arm the sweep
        let generation = self.expirable_saves.load(Ordering::Acquire);
        let mut evicted = 0;
        for key in self.persistence.all_keys().await? {
            if stored_bytes <= self.target_bytes {
                break;
            }
            if key::is_reserved(&key) {
                continue;
            }
            let encryption_key = self.encryption_key.as_deref();
            let Some(record) = decode_any(self.persistence.as_ref(), &key, encryption_key).await
            else {
                continue;
            };
            if !record.expirable {
                continue;
            }

            self.memory.evict(&key);
            self.persistence.evict(&key).await?;
            evicted += 1;
            stored_bytes = self.persistence.stored_size_bytes().await?;

            if !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
        }

        // Falling short of the target means every expirable record seen is gone
        if stored_bytes > self.target_bytes {
            self.exhausted_at.fetch_max(generation, Ordering::AcqRel);
        }

        if evicted == 0 {
            info!("Persistence over {} MB and nothing evictable", self.max_mb);
            return Ok(SweepOutcome::NothingEvictable { stored_bytes });
        }

        info!(
            "Size-capped sweep evicted {} records, {} bytes remain",
            evicted, stored_bytes
        );
        Ok(SweepOutcome::Evicted { evicted, stored_bytes })
    }
}

/// Sweep removing persisted records whose lifetime has elapsed
pub struct EvictExpiredRecords {
    memory: Arc<dyn Memory>,
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    encryption_key: Option<String>,
}

impl EvictExpiredRecords {
    pub fn new(
        memory: Arc<dyn Memory>,
        persistence: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        encryption_key: Option<String>,
    ) -> Self {
        Self {
            memory,
            persistence,
            clock,
            encryption_key,
        }
    }

    /// Evict expired records, returning how many were removed.
    ///
    /// Records that cannot be decoded under any known key are left alone.
    pub async fn sweep(&self) -> Result<usize> {
        let now = self.clock.now_millis();
        let mut evicted = 0;

        for key in self.persistence.all_keys().await? {
            if key::is_reserved(&key) {
                continue;
            }
            let encryption_key = self.encryption_key.as_deref();
            let Some(record) = decode_any(self.persistence.as_ref(), &key, encryption_key).await
            else {
                continue;
            };
            if has_expired(&record, now) {
                self.memory.evict(&key);
                self.persistence.evict(&key).await?;
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!("Evicted {} expired records", evicted);
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use keystash_security::AesGcmEncryptor;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        clock::ManualClock, key::compose, memory::ReferenceMapMemory, persistence::DiskPersistence,
        serializer::JsonSerializer,
    };

    fn layers(dir: &TempDir) -> (Arc<ReferenceMapMemory>, Arc<DiskPersistence>) {
        (
            Arc::new(ReferenceMapMemory::new()),
            Arc::new(DiskPersistence::new(
                dir.path(),
                Arc::new(JsonSerializer::new()),
                Arc::new(AesGcmEncryptor::new()),
            )),
        )
    }

    fn record(created_at: i64, life_time: Option<u64>, expirable: bool) -> Record<Value> {
        Record::new(json!("data"), "&str", created_at)
            .with_life_time(life_time)
            .with_expirable(expirable)
    }

    #[test]
    fn test_expiration_boundary() {
        let r = record(1_000, Some(500), true);
        assert!(!has_expired(&r, 1_499));
        assert!(!has_expired(&r, 1_500));
        assert!(has_expired(&r, 1_501));
    }

    #[test]
    fn test_never_expires_without_lifetime_or_expirable() {
        assert!(!has_expired(&record(0, None, true), i64::MAX));
        assert!(!has_expired(&record(0, Some(1), false), i64::MAX));
    }

    #[tokio::test]
    async fn test_evict_scope_across_layers() {
        let temp_dir = TempDir::new().unwrap();
        let (memory, persistence) = layers(&temp_dir);
        let evict = EvictRecord::new(memory.clone(), persistence.clone());

        for key in [
            compose("mocks", "", ""),
            compose("mocks", "1", ""),
            compose("mocks", "1", "g"),
            compose("mocks2", "", ""),
        ] {
            memory.put(&key, record(0, None, true));
            persistence.save(&key, &record(0, None, true), None).await.unwrap();
        }

        let removed = evict
            .evict_scope(&KeyScope::DynamicKey {
                provider_key: "mocks",
                dynamic_key: "1",
            })
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(memory.get(&compose("mocks", "1", "g")).is_none());
        assert!(memory.get(&compose("mocks", "", "")).is_some());

        let removed = evict
            .evict_scope(&KeyScope::Provider { provider_key: "mocks" })
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(persistence.all_keys().await.unwrap(), vec![compose("mocks2", "", "")]);
    }

    #[tokio::test]
    async fn test_expired_sweep_skips_undecodable_and_fresh_records() {
        let temp_dir = TempDir::new().unwrap();
        let (memory, persistence) = layers(&temp_dir);
        let clock = Arc::new(ManualClock::new(10_000));

        persistence
            .save(&compose("old", "", ""), &record(0, Some(100), true), None)
            .await
            .unwrap();
        persistence
            .save(&compose("fresh", "", ""), &record(9_990, Some(100), true), None)
            .await
            .unwrap();
        persistence
            .save(
                &compose("locked", "", ""),
                &record(0, Some(100), true).with_encrypted(true),
                Some("other-key"),
            )
            .await
            .unwrap();

        let sweep =
            EvictExpiredRecords::new(memory, persistence.clone(), clock, Some("key".into()));
        assert_eq!(sweep.sweep().await.unwrap(), 1);

        let mut keys = persistence.all_keys().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec![compose("fresh", "", ""), compose("locked", "", "")]);
    }

    #[tokio::test]
    async fn test_size_sweep_below_threshold_is_a_no_op() {
        let temp_dir = TempDir::new().unwrap();
        let (memory, persistence) = layers(&temp_dir);
        persistence
            .save(&compose("p", "", ""), &record(0, None, true), None)
            .await
            .unwrap();

        let settings = CacheSettings {
            max_mb_persistence: 5,
            ..CacheSettings::new(temp_dir.path())
        };
        let sweep = EvictExpirableRecords::new(memory, persistence.clone(), &settings);

        assert!(matches!(sweep.sweep().await.unwrap(), SweepOutcome::BelowThreshold { .. }));
        assert_eq!(persistence.all_keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_during_sweep_keeps_it_armed() {
        let temp_dir = TempDir::new().unwrap();
        let (memory, persistence) = layers(&temp_dir);
        let big = Record::new(json!("x".repeat(1_200_000)), "String", 0);
        persistence
            .save(&compose("big", "", ""), &big.with_expirable(false), None)
            .await
            .unwrap();
        persistence
            .save(&compose("small", "", ""), &record(0, None, true), None)
            .await
            .unwrap();

        let settings = CacheSettings {
            max_mb_persistence: 1,
            sweep_pacing_ms: 200,
            ..CacheSettings::new(temp_dir.path())
        };
        let sweep = Arc::new(EvictExpirableRecords::new(memory, persistence, &settings));

        let running = tokio::spawn({
            let sweep = Arc::clone(&sweep);
            async move { sweep.sweep().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        sweep.notify_expirable_saved();

        let outcome = running.await.unwrap().unwrap();
        assert!(matches!(outcome, SweepOutcome::Evicted { evicted: 1, .. }));
        assert!(sweep.could_be_expirable());

        // Nothing saved since this scan, so it disarms
        let outcome = sweep.sweep().await.unwrap();
        assert!(matches!(outcome, SweepOutcome::NothingEvictable { .. }));
        assert!(!sweep.could_be_expirable());
    }
}
