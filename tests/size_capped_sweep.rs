//! Size-capped sweep against a real on-disk layer
//!
//! 100 records of roughly 70KB each against a 5 MB cap: the sweep brings the
//! store down to the stop ratio, touching only expirable records.

use std::sync::Arc;

use keystash_cache::{
    key::compose, BoxError, CacheSettings, ConfigProvider, DiskPersistence,
    EvictExpirableRecords, JsonSerializer, KeyStash, Memory, Persistence, Record,
    ReferenceMapMemory, SweepOutcome,
};
use keystash_security::AesGcmEncryptor;
use serde_json::json;
use tempfile::TempDir;

const RECORDS: usize = 100;
const RECORD_BYTES: usize = 70 * 1024;
const MIB: u64 = 1024 * 1024;

struct Layers {
    _dir: TempDir,
    settings: CacheSettings,
    memory: Arc<ReferenceMapMemory>,
    persistence: Arc<DiskPersistence>,
}

fn layers() -> Layers {
    let dir = TempDir::new().unwrap();
    let settings = CacheSettings {
        max_mb_persistence: 5,
        evict_stop_ratio: 0.9,
        ..CacheSettings::new(dir.path())
    };
    let persistence = Arc::new(DiskPersistence::new(
        dir.path(),
        Arc::new(JsonSerializer::new()),
        Arc::new(AesGcmEncryptor::new()),
    ));
    Layers {
        _dir: dir,
        settings,
        memory: Arc::new(ReferenceMapMemory::new()),
        persistence,
    }
}

async fn fill(layers: &Layers, expirable: impl Fn(usize) -> bool) {
    let payload = "x".repeat(RECORD_BYTES);
    for i in 0..RECORDS {
        let key = compose("mocks", &i.to_string(), "");
        let record =
            Record::new(json!(payload), "alloc::string::String", 0).with_expirable(expirable(i));
        layers.memory.put(&key, record.clone());
        layers.persistence.save(&key, &record, None).await.unwrap();
    }
}

async fn expirable_flags(persistence: &DiskPersistence) -> Vec<bool> {
    let mut flags = Vec::new();
    for key in persistence.all_keys().await.unwrap() {
        flags.push(persistence.retrieve(&key, false, None).await.unwrap().expirable);
    }
    flags
}

#[tokio::test]
async fn test_sweep_evicts_expirable_records_down_to_stop_ratio() {
    let layers = layers();
    fill(&layers, |i| i % 2 == 0).await;
    assert!(layers.persistence.stored_size_mb().await.unwrap() >= 5);

    let sweep = EvictExpirableRecords::new(
        layers.memory.clone(),
        layers.persistence.clone(),
        &layers.settings,
    );
    let outcome = sweep.sweep().await.unwrap();

    let stored = layers.persistence.stored_size_bytes().await.unwrap();
    assert!(matches!(
        outcome,
        SweepOutcome::Evicted { stored_bytes, .. } if stored_bytes == stored
    ));
    assert!(stored <= layers.settings.sweep_target_bytes());

    // Every non-expirable record survived, and memory agrees with disk
    let flags = expirable_flags(&layers.persistence).await;
    assert_eq!(flags.iter().filter(|expirable| !**expirable).count(), RECORDS / 2);
    assert_eq!(layers.memory.len(), flags.len());

    // Already under the cap: a second sweep does nothing
    assert!(matches!(sweep.sweep().await.unwrap(), SweepOutcome::BelowThreshold { .. }));
}

#[tokio::test]
async fn test_sweep_reports_nothing_evictable() {
    let layers = layers();
    fill(&layers, |_| false).await;
    let before = layers.persistence.stored_size_bytes().await.unwrap();

    let sweep = EvictExpirableRecords::new(
        layers.memory.clone(),
        layers.persistence.clone(),
        &layers.settings,
    );
    assert_eq!(
        sweep.sweep().await.unwrap(),
        SweepOutcome::NothingEvictable { stored_bytes: before }
    );
    assert_eq!(
        sweep.sweep().await.unwrap(),
        SweepOutcome::NothingEvictable { stored_bytes: before }
    );

    assert_eq!(layers.persistence.stored_size_bytes().await.unwrap(), before);
    assert_eq!(layers.persistence.all_keys().await.unwrap().len(), RECORDS);
}

#[tokio::test]
async fn test_saves_over_the_cap_keep_the_store_bounded() {
    let dir = TempDir::new().unwrap();
    let settings = CacheSettings {
        max_mb_persistence: 5,
        ..CacheSettings::new(dir.path())
    };
    let stash = KeyStash::new(settings).unwrap();
    let payload = "y".repeat(RECORD_BYTES);

    for i in 0..RECORDS {
        let payload = payload.clone();
        let config = ConfigProvider::<String>::builder("blobs")
            .dynamic_key(i.to_string())
            .loader(move || async move { Ok::<_, BoxError>(payload) })
            .build()
            .unwrap();
        stash.retrieve(config).await.unwrap();
    }

    stash.sweep_expirable().await.unwrap();
    assert!(stash.stored_size_bytes().await.unwrap() < 5 * MIB);
}
