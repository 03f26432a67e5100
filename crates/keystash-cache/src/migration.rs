//! Versioned migrations purging stale record types
//!
//! The pipeline reads the persisted cache version, resolves the migrations
//! declared above it, evicts every record whose type one of them names, and
//! records the highest declared version. Re-running it with the same
//! declarations is a no-op.

use std::{collections::HashSet, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::{
    clock::Clock,
    eviction::decode_any,
    key::{self, VERSION_KEY},
    memory::Memory,
    persistence::Persistence,
    record::Record,
    CacheError, Result,
};

/// One schema migration: records of these types are stale from `version` on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSpec {
    /// Schema version introduced by this migration, starting at 1
    pub version: u32,
    /// Class names whose cached records must be evicted
    #[serde(default)]
    pub evict_classes: Vec<String>,
}

impl MigrationSpec {
    /// Migration with no classes to evict
    pub fn new(version: u32) -> Self {
        Self {
            version,
            evict_classes: Vec::new(),
        }
    }

    /// Evict cached records of type `T` saved without an explicit class name.
    ///
    /// Matches on [`std::any::type_name`], whose output may change between
    /// compiler versions. Records that must be purged after a toolchain
    /// upgrade should be saved under an explicit
    /// [`data_class_name`](crate::ConfigProviderBuilder::data_class_name) and
    /// evicted with [`evict_class`](Self::evict_class).
    pub fn evict<T: ?Sized>(mut self) -> Self {
        self.evict_classes.push(std::any::type_name::<T>().to_string());
        self
    }

    /// Evict cached records whose stored class name is `class_name`
    pub fn evict_class(mut self, class_name: impl Into<String>) -> Self {
        self.evict_classes.push(class_name.into());
        self
    }

    /// Reject versions below 1
    pub fn validate(&self) -> Result<()> {
        if self.version == 0 {
            return Err(CacheError::configuration_invalid(
                "migrations.version",
                "migration versions start at 1",
            ));
        }
        Ok(())
    }
}

/// What a pipeline run changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub previous_version: u32,
    pub current_version: u32,
    pub applied: usize,
    pub evicted: usize,
}

/// Runs declared migrations against memory and persistence
pub struct MigrationPipeline {
    memory: Arc<dyn Memory>,
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    encryption_key: Option<String>,
}

impl MigrationPipeline {
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

    /// Persisted cache version; 0 when none has been recorded
    pub async fn cache_version(&self) -> u32 {
        self.persistence
            .retrieve(VERSION_KEY, false, None)
            .await
            .and_then(|record| record.data.as_u64())
            .and_then(|version| u32::try_from(version).ok())
            .unwrap_or(0)
    }

    /// Run the full pipeline
    pub async fn run(&self, migrations: &[MigrationSpec]) -> Result<MigrationOutcome> {
        let previous_version = self.cache_version().await;
        let pending = pending_migrations(migrations, previous_version);
        let classes = classes_to_evict(&pending);
        debug!(
            "Cache version {}, {} pending migrations, {} classes to evict",
            previous_version,
            pending.len(),
            classes.len()
        );

        let evicted = self.delete_records_matching_class_name(&classes).await?;

        let current_version = match migrations.iter().map(|m| m.version).max() {
            Some(latest) => {
                self.upgrade_cache_version(latest).await?;
                latest
            }
            None => previous_version,
        };

        if !pending.is_empty() {
            info!(
                "Migrated cache from version {} to {}, evicted {} records",
                previous_version, current_version, evicted
            );
        }
        Ok(MigrationOutcome {
            previous_version,
            current_version,
            applied: pending.len(),
            evicted,
        })
    }

    /// Evict every record whose stored class name is in `classes`.
    ///
    /// Records that cannot be decoded are left in place.
    pub async fn delete_records_matching_class_name(
        &self,
        classes: &[String],
    ) -> Result<usize> {
        if classes.is_empty() {
            return Ok(0);
        }

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
            if classes.iter().any(|class| *class == record.data_class_name) {
                self.memory.evict(&key);
                self.persistence.evict(&key).await?;
                evicted += 1;
            }
        }

        // Memory may hold records whose persisted copy failed to write
        for key in self.memory.keys() {
            if let Some(record) = self.memory.get(&key) {
                if classes.iter().any(|class| *class == record.data_class_name) {
                    self.memory.evict(&key);
                }
            }
        }

        Ok(evicted)
    }

    /// Persist `version` as the current cache version
    pub async fn upgrade_cache_version(&self, version: u32) -> Result<()> {
        let record = Record::new(Value::from(version), "u32", self.clock.now_millis())
        .with_expirable(false);

        self.persistence
            .save(VERSION_KEY, &record, None)
            .await
            .map_err(|e| CacheError::Migration {
                message: format!("failed to record cache version {}: {}", version, e),
            })
    }
}

/// Migrations above `current_version`, in ascending version order.
///
/// The sort is stable, so duplicate versions keep their declared order.
pub fn pending_migrations(
    migrations: &[MigrationSpec],
    current_version: u32,
) -> Vec<&MigrationSpec> {
    let mut pending: Vec<_> = migrations
        .iter()
        .filter(|m| m.version > current_version)
        .collect();
    pending.sort_by_key(|m| m.version);
    pending
}

/// Union of the classes named by `migrations`, first-seen order
pub fn classes_to_evict(migrations: &[&MigrationSpec]) -> Vec<String> {
    let mut seen = HashSet::new();
    migrations
        .iter()
        .flat_map(|m| m.evict_classes.iter())
        .filter(|class| seen.insert(class.as_str()))
        .cloned()
        .collect()
}
