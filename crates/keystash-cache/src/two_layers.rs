//! Memory + persistence, kept consistent per key

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    clock::Clock,
    eviction::{has_expired, EvictExpirableRecords, EvictRecord},
    key::{KeyParts, KeyScope},
    memory::Memory,
    persistence::Persistence,
    record::{Record, Source},
    settings::CacheSettings,
    CacheError, Result,
};

/// Outcome of looking a key up in both layers
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Live record
    Hit(Record<Value>),
    /// Record found past its lifetime; already evicted from both layers
    Expired(Record<Value>),
    /// Nothing stored
    Miss,
}

/// Options stamped onto a saved record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions<'a> {
    pub life_time_millis: Option<u64>,
    pub expirable: bool,
    pub encrypted: bool,
    /// Class name matched by migrations; the Rust type name when `None`
    pub data_class_name: Option<&'a str>,
}

/// The only component that writes to both memory and persistence
pub struct TwoLayersCache {
    memory: Arc<dyn Memory>,
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    evict_record: EvictRecord,
    size_sweep: Arc<EvictExpirableRecords>,
    encryption_key: Option<String>,
}

impl TwoLayersCache {
    pub fn new(
        memory: Arc<dyn Memory>,
        persistence: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        settings: &CacheSettings,
    ) -> Self {
        Self {
            evict_record: EvictRecord::new(Arc::clone(&memory), Arc::clone(&persistence)),
            size_sweep: Arc::new(EvictExpirableRecords::new(
                Arc::clone(&memory),
                Arc::clone(&persistence),
                settings,
            )),
            memory,
            persistence,
            clock,
            encryption_key: settings.encryption_key.clone(),
        }
    }

    /// The memory layer
    pub fn memory(&self) -> &Arc<dyn Memory> {
        &self.memory
    }

    /// The persistence layer
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// The size-capped sweep run after saves
    pub fn size_sweep(&self) -> &Arc<EvictExpirableRecords> {
        &self.size_sweep
    }

    /// Store data under `parts` in memory, then in persistence.
    ///
    /// A persistence failure is returned as [`CacheError::StorageWriteFailed`]
    /// but the memory write stands.
    pub async fn save<T: Serialize>(
        &self,
        parts: &KeyParts,
        data: &T,
        options: SaveOptions<'_>,
    ) -> Result<()> {
        let encrypt_key = if options.encrypted {
            Some(self.encryption_key.as_deref().ok_or_else(|| {
                CacheError::configuration_invalid(
                    "encryption_key",
                    format!(
                        "provider '{}' is encrypted but no encryption key is set",
                        parts.provider_key
                    ),
                )
            })?)
        } else {
            None
        };

        let key = parts.compose();
        let record = Record::new(
            serde_json::to_value(data)?,
            options
                .data_class_name
                .unwrap_or(std::any::type_name::<T>()),
            self.clock.now_millis(),
        )
        .with_life_time(options.life_time_millis)
        .with_expirable(options.expirable)
        .with_encrypted(options.encrypted);

        self.memory.put(&key, record.clone());

        if let Err(e) = self.persistence.save(&key, &record, encrypt_key).await {
            warn!("Keeping memory-only copy of {}: {}", key, e);
            return Err(e);
        }

        if options.expirable {
            self.size_sweep.notify_expirable_saved();
        }
        self.size_sweep.trigger();
        Ok(())
    }

    /// Look `parts` up in memory, then persistence, applying expiration.
    ///
    /// `life_time_millis` is the requesting provider's lifetime and replaces
    /// the stored one. Expired records are evicted using the narrowest scope
    /// the supplied keys describe.
    pub async fn lookup(
        &self,
        parts: &KeyParts,
        life_time_millis: Option<u64>,
        encrypted: bool,
    ) -> Lookup {
        let key = parts.compose();

        let mut record = match self.memory.get(&key) {
            Some(mut record) => {
                record.source = Source::Memory;
                record
            }
            None => match self
                .persistence
                .retrieve(&key, encrypted, self.encryption_key.as_deref())
                .await
            {
                Some(mut record) => {
                    record.source = Source::Persistence;
                    self.memory.put(&key, record.clone());
                    record
                }
                None => {
                    debug!("Cache miss for {}", key);
                    return Lookup::Miss;
                }
            },
        };

        record.life_time_millis = life_time_millis;
        if has_expired(&record, self.clock.now_millis()) {
            debug!("Record {} expired", key);
            let scope = KeyScope::narrowest(
                &parts.provider_key,
                &parts.dynamic_key,
                &parts.dynamic_key_group,
            );
            if let Err(e) = self.evict_record.evict_scope(&scope).await {
                warn!("Failed to evict expired record {}: {}", key, e);
            }
            return Lookup::Expired(record);
        }

        debug!("Cache hit for {} from {}", key, record.source);
        Lookup::Hit(record)
    }

    /// Live record for `parts`, or the expired one when `use_expired_if_no_loader` is set
    pub async fn retrieve(
        &self,
        parts: &KeyParts,
        use_expired_if_no_loader: bool,
        life_time_millis: Option<u64>,
        encrypted: bool,
    ) -> Option<Record<Value>> {
        match self.lookup(parts, life_time_millis, encrypted).await {
            Lookup::Hit(record) => Some(record),
            Lookup::Expired(record) if use_expired_if_no_loader => Some(record),
            Lookup::Expired(_) | Lookup::Miss => None,
        }
    }

    /// Evict every record of a provider
    pub async fn evict_provider_key(&self, provider_key: &str) -> Result<()> {
        self.evict_scope(&KeyScope::Provider { provider_key }).await
    }

    /// Evict every group under a dynamic key
    pub async fn evict_dynamic_key(&self, provider_key: &str, dynamic_key: &str) -> Result<()> {
        self.evict_scope(&KeyScope::DynamicKey {
            provider_key,
            dynamic_key,
        })
        .await
    }

    /// Evict exactly one record
    pub async fn evict_dynamic_key_group(
        &self,
        provider_key: &str,
        dynamic_key: &str,
        dynamic_key_group: &str,
    ) -> Result<()> {
        self.evict_scope(&KeyScope::DynamicKeyGroup {
            provider_key,
            dynamic_key,
            dynamic_key_group,
        })
        .await
    }

    /// Evict everything inside `scope`
    pub async fn evict_scope(&self, scope: &KeyScope<'_>) -> Result<()> {
        self.evict_record.evict_scope(scope).await.map(|_| ())
    }

    /// Evict every record in both layers
    pub async fn evict_all(&self) -> Result<()> {
        self.evict_record.evict_all().await
    }
}
