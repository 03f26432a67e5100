//! Engine facade wiring every layer together

use std::sync::Arc;

use keystash_security::{AesGcmEncryptor, Encryptor};
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;

use crate::{
    clock::{Clock, SystemClock},
    config::ConfigProvider,
    deep_copy::DeepCopy,
    eviction::{EvictExpiredRecords, SweepOutcome},
    key::KeyScope,
    memory::{Memory, ReferenceMapMemory},
    metrics::{CacheMetrics, CacheStats},
    migration::MigrationPipeline,
    persistence::{DiskPersistence, Persistence},
    processor::{ProcessorProviders, Startup},
    provider::ProviderRegistry,
    record::Response,
    serializer::{JsonSerializer, Serializer},
    settings::CacheSettings,
    two_layers::TwoLayersCache,
    Result,
};

/// The caching engine.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct KeyStash {
    settings: CacheSettings,
    two_layers: Arc<TwoLayersCache>,
    startup: Arc<Startup>,
    processor: ProcessorProviders,
    metrics: CacheMetrics,
    registry: ProviderRegistry,
}

impl KeyStash {
    /// Engine with default collaborators
    pub fn new(settings: CacheSettings) -> Result<Self> {
        KeyStashBuilder::new().settings(settings).build()
    }

    pub fn builder() -> KeyStashBuilder {
        KeyStashBuilder::new()
    }

    /// Serve a request from memory, persistence or its loader
    pub async fn retrieve<T>(&self, config: ConfigProvider<T>) -> Result<Response<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.processor.process(config).await
    }

    /// Run migrations and the expired-record sweep now instead of on the first request
    pub async fn start(&self) -> Result<()> {
        self.startup.ensure().await
    }

    /// Evict every record inside `scope`
    pub async fn evict(&self, scope: &KeyScope<'_>) -> Result<()> {
        self.startup.ensure().await?;
        self.two_layers.evict_scope(scope).await
    }

    /// Evict every record; the cache version survives
    pub async fn evict_all(&self) -> Result<()> {
        self.startup.ensure().await?;
        self.two_layers.evict_all().await
    }

    /// Run the size-capped sweep and wait for its outcome
    pub async fn sweep_expirable(&self) -> Result<SweepOutcome> {
        self.two_layers.size_sweep().sweep().await
    }

    /// Bytes currently persisted
    pub async fn stored_size_bytes(&self) -> Result<u64> {
        self.two_layers.persistence().stored_size_bytes().await
    }

    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot()
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn two_layers(&self) -> &Arc<TwoLayersCache> {
        &self.two_layers
    }
}

/// Builder for [`KeyStash`]; any collaborator left unset gets its default
#[derive(Default)]
pub struct KeyStashBuilder {
    settings: Option<CacheSettings>,
    memory: Option<Arc<dyn Memory>>,
    persistence: Option<Arc<dyn Persistence>>,
    serializer: Option<Arc<dyn Serializer>>,
    encryptor: Option<Arc<dyn Encryptor>>,
    clock: Option<Arc<dyn Clock>>,
    registry: Option<ProviderRegistry>,
}

impl KeyStashBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(mut self, settings: CacheSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn Memory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Replace the on-disk layer; the serializer and encryptor are then unused
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate settings and wire the engine
    pub fn build(self) -> Result<KeyStash> {
        let settings = self.settings.unwrap_or_default();
        settings.validate()?;

        let serializer: Arc<dyn Serializer> = match self.serializer {
            Some(serializer) => serializer,
            None if settings.compress => Arc::new(JsonSerializer::compressed()),
            None => Arc::new(JsonSerializer::new()),
        };
        let persistence: Arc<dyn Persistence> = match self.persistence {
            Some(persistence) => persistence,
            None => {
                let encryptor: Arc<dyn Encryptor> = match self.encryptor {
                    Some(encryptor) => encryptor,
                    None => Arc::new(AesGcmEncryptor::new()),
                };
                Arc::new(DiskPersistence::new(
                    &settings.cache_dir,
                    Arc::clone(&serializer),
                    encryptor,
                ))
            }
        };
        let memory: Arc<dyn Memory> = match self.memory {
            Some(memory) => memory,
            None => Arc::new(ReferenceMapMemory::new()),
        };
        let clock: Arc<dyn Clock> = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock),
        };

        let startup = Arc::new(Startup::new(
            MigrationPipeline::new(
                Arc::clone(&memory),
                Arc::clone(&persistence),
                Arc::clone(&clock),
                settings.encryption_key.clone(),
            ),
            EvictExpiredRecords::new(
                Arc::clone(&memory),
                Arc::clone(&persistence),
                Arc::clone(&clock),
                settings.encryption_key.clone(),
            ),
            settings.migrations.clone(),
        ));
        let two_layers = Arc::new(TwoLayersCache::new(memory, persistence, clock, &settings));
        let metrics = CacheMetrics::new();
        let processor = ProcessorProviders::new(
            Arc::clone(&two_layers),
            DeepCopy::new(serializer),
            Arc::clone(&startup),
            metrics.clone(),
            settings.use_expired_data_if_loader_not_available,
            settings.encryption_key.is_some(),
        );

        info!(
            "KeyStash ready at {} ({} MB cap, {} migrations)",
            settings.cache_dir.display(),
            settings.max_mb_persistence,
            settings.migrations.len()
        );

        Ok(KeyStash {
            settings,
            two_layers,
            startup,
            processor,
            metrics,
            registry: self.registry.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{error::BoxError, key::compose, record::Source, CacheError, MigrationSpec};

    #[tokio::test]
    async fn test_build_rejects_invalid_settings() {
        let temp_dir = TempDir::new().unwrap();
        let settings = CacheSettings {
            evict_stop_ratio: 0.0,
            ..CacheSettings::new(temp_dir.path())
        };
        assert!(matches!(
            KeyStash::new(settings),
            Err(CacheError::ConfigurationInvalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_retrieve_through_registry() {
        let temp_dir = TempDir::new().unwrap();
        let stash = KeyStash::new(CacheSettings::new(temp_dir.path())).unwrap();
        stash
            .registry()
            .register("get_mocks", crate::ProviderDefinition::new("mocks"));

        let config = stash
            .registry()
            .config::<Vec<u32>>("get_mocks")
            .unwrap()
            .loader(|| async { Ok::<_, BoxError>(vec![1, 2]) })
            .build()
            .unwrap();
        let reply = stash.retrieve(config).await.unwrap().into_reply().unwrap();

        assert_eq!(reply.source(), Source::Cloud);
        assert_eq!(stash.stats().cloud_loads, 1);
    }

    #[tokio::test]
    async fn test_evict_all_keeps_cache_version() {
        let temp_dir = TempDir::new().unwrap();
        let settings = CacheSettings {
            migrations: vec![MigrationSpec::new(3)],
            ..CacheSettings::new(temp_dir.path())
        };
        let stash = KeyStash::new(settings).unwrap();

        let config = ConfigProvider::<u32>::builder("mocks")
            .loader(|| async { Ok::<_, BoxError>(1) })
            .build()
            .unwrap();
        stash.retrieve(config).await.unwrap();
        stash.evict_all().await.unwrap();

        let keys = stash.two_layers().persistence().all_keys().await.unwrap();
        assert_eq!(keys, vec![crate::key::VERSION_KEY.to_string()]);
        assert!(stash.two_layers().memory().get(&compose("mocks", "", "")).is_none());
    }
}
