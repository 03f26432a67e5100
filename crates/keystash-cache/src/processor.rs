//! Request orchestration
//!
//! Every request runs the same state machine:
//!
//! 1. Wait for the once-per-process startup task (migrations, then the
//!    expired-record sweep).
//! 2. Evict the configured scope if eviction is forced; otherwise look the
//!    record up in memory and persistence.
//! 3. Serve a live hit, or invoke the loader and save what it returns.
//! 4. If the loader is missing or fails, serve the expired record when the
//!    fallback is enabled, or fail.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::{ConfigProvider, Loader, RequestOptions},
    deep_copy::DeepCopy,
    eviction::EvictExpiredRecords,
    metrics::CacheMetrics,
    migration::{MigrationPipeline, MigrationSpec},
    record::{Record, Reply, Response, Source},
    two_layers::{Lookup, SaveOptions, TwoLayersCache},
    CacheError, Result,
};

/// Work run once per process before the first request is served
pub struct Startup {
    migrations: Arc<MigrationPipeline>,
    expired_sweep: Arc<EvictExpiredRecords>,
    declared: Arc<Vec<MigrationSpec>>,
    done: AtomicBool,
    running: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Startup {
    pub fn new(
        migrations: MigrationPipeline,
        expired_sweep: EvictExpiredRecords,
        declared: Vec<MigrationSpec>,
    ) -> Self {
        Self {
            migrations: Arc::new(migrations),
            expired_sweep: Arc::new(expired_sweep),
            declared: Arc::new(declared),
            done: AtomicBool::new(false),
            running: Mutex::new(None),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Wait for startup to complete, starting it if needed.
    ///
    /// The work runs on its own task, so a cancelled caller does not abort
    /// it; the next caller waits on the same task. A failed run is retried
    /// by the next caller.
    pub async fn ensure(&self) -> Result<()> {
        if self.is_done() {
            return Ok(());
        }

        let mut running = self.running.lock().await;
        if self.is_done() {
            return Ok(());
        }

        let handle = running.get_or_insert_with(|| {
            let migrations = Arc::clone(&self.migrations);
            let expired_sweep = Arc::clone(&self.expired_sweep);
            let declared = Arc::clone(&self.declared);
            tokio::spawn(async move {
                migrations.run(&declared).await?;
                expired_sweep.sweep().await?;
                Ok::<(), CacheError>(())
            })
        });
        let joined = handle.await;
        *running = None;

        match joined {
            Ok(Ok(())) => {
                self.done.store(true, Ordering::Release);
                info!("Cache startup complete");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Cache startup failed: {}", e);
                Err(e)
            }
            Err(e) => Err(CacheError::Migration {
                message: format!("startup task did not complete: {}", e),
            }),
        }
    }
}

/// Turns a [`ConfigProvider`] and its loader into a [`Response`]
pub struct ProcessorProviders {
    two_layers: Arc<TwoLayersCache>,
    deep_copy: DeepCopy,
    startup: Arc<Startup>,
    metrics: CacheMetrics,
    use_expired_data_if_loader_not_available: bool,
    has_encryption_key: bool,
}

impl ProcessorProviders {
    pub fn new(
        two_layers: Arc<TwoLayersCache>,
        deep_copy: DeepCopy,
        startup: Arc<Startup>,
        metrics: CacheMetrics,
        use_expired_data_if_loader_not_available: bool,
        has_encryption_key: bool,
    ) -> Self {
        Self {
            two_layers,
            deep_copy,
            startup,
            metrics,
            use_expired_data_if_loader_not_available,
            has_encryption_key,
        }
    }

    /// Serve one request
    pub async fn process<T>(&self, config: ConfigProvider<T>) -> Result<Response<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let (options, loader) = config.into_parts();
        let result = self.process_inner(&options, loader).await;
        if result.is_err() {
            self.metrics.record_failure();
        }
        result
    }

    async fn process_inner<T>(
        &self,
        options: &RequestOptions,
        loader: Option<Loader<T>>,
    ) -> Result<Response<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.startup.ensure().await?;

        let parts = &options.parts;
        if options.encrypted && !self.has_encryption_key {
            return Err(CacheError::configuration_invalid(
                "encryption_key",
                format!(
                    "provider '{}' is encrypted but no encryption key is set",
                    parts.provider_key
                ),
            ));
        }

        let key = parts.compose();
        let fallback = match options.forced_eviction() {
            Some(scope) => {
                // Peek first so a failed reload can still fall back
                let fallback = match self
                    .two_layers
                    .lookup(parts, options.life_time_millis, options.encrypted)
                    .await
                {
                    Lookup::Hit(record) | Lookup::Expired(record) => Some(record),
                    Lookup::Miss => None,
                };
                debug!("Forced eviction of {:?}", scope);
                self.two_layers.evict_scope(&scope).await?;
                fallback
            }
            None => match self
                .two_layers
                .lookup(parts, options.life_time_millis, options.encrypted)
                .await
            {
                Lookup::Hit(record) => match self.deep_copy.from_cached::<T>(&key, &record.data) {
                    Ok(data) => {
                        return Ok(self.serve(options, data, record.source, record.encrypted))
                    }
                    Err(e) => {
                        debug!("Treating {} as a miss: {}", key, e);
                        None
                    }
                },
                Lookup::Expired(record) => {
                    self.metrics.record_expired();
                    Some(record)
                }
                Lookup::Miss => None,
            },
        };

        let failure = match loader {
            Some(loader) => match loader().await {
                Ok(data) => {
                    let data = self.deep_copy.copy(data);
                    let save_options = SaveOptions {
                        life_time_millis: options.life_time_millis,
                        expirable: options.expirable,
                        encrypted: options.encrypted,
                        data_class_name: options.data_class_name.as_deref(),
                    };
                    if let Err(e) = self.two_layers.save(parts, &data, save_options).await {
                        warn!("Serving {} without a durable copy: {}", key, e);
                    }
                    return Ok(self.serve(options, data, Source::Cloud, options.encrypted));
                }
                Err(source) => {
                    warn!("Loader for {} failed: {}", parts.provider_key, source);
                    CacheError::loader_failed(parts.provider_key.clone(), source)
                }
            },
            None => CacheError::LoaderUnavailable {
                provider_key: parts.provider_key.clone(),
            },
        };

        match fallback {
            Some(record) if self.use_expired_data_if_loader_not_available => {
                self.serve_fallback(options, &key, record).ok_or(failure)
            }
            _ => Err(failure),
        }
    }

    fn serve_fallback<T>(
        &self,
        options: &RequestOptions,
        key: &str,
        record: Record<Value>,
    ) -> Option<Response<T>>
    where
        T: DeserializeOwned,
    {
        match self.deep_copy.from_cached::<T>(key, &record.data) {
            Ok(data) => {
                info!("Serving expired data for {} from {}", key, record.source);
                self.metrics.record_fallback();
                Some(self.serve(options, data, record.source, record.encrypted))
            }
            Err(e) => {
                debug!("Expired record {} unusable: {}", key, e);
                None
            }
        }
    }

    fn serve<T>(
        &self,
        options: &RequestOptions,
        data: T,
        source: Source,
        encrypted: bool,
    ) -> Response<T> {
        self.metrics.record_served(source);
        if options.required_detailed_response {
            Response::Reply(Reply::new(data, source, encrypted))
        } else {
            Response::Data(data)
        }
    }
}
