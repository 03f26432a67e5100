//! # KeyStash Cache
//!
//! Provider-keyed two-layer caching engine sitting between a data consumer
//! and a slow or unreliable loader.
//!
//! ## Features
//!
//! - **Two layers**: in-process memory backed by one file per record on disk
//! - **Composed keys**: provider key, dynamic key and group, escaped and joined
//! - **Eviction**: explicit by scope, time-based, and a size-capped sweep
//! - **Encryption at rest**: per provider, via `keystash-security`
//! - **Migrations**: versioned purges of stale record types, once per process
//! - **Expired-data fallback**: serve stale data when the loader is unavailable

pub mod clock;
pub mod config;
pub mod deep_copy;
pub mod error;
pub mod eviction;
pub mod key;
pub mod memory;
pub mod metrics;
pub mod migration;
pub mod persistence;
pub mod processor;
pub mod provider;
pub mod record;
pub mod serializer;
pub mod settings;
pub mod stash;
pub mod two_layers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigProvider, ConfigProviderBuilder, EvictScope, Loader, RequestOptions};
pub use deep_copy::DeepCopy;
pub use error::{BoxError, CacheError};
pub use eviction::{
    has_expired, EvictExpirableRecords, EvictExpiredRecords, EvictRecord, SweepOutcome,
};
pub use key::{KeyParts, KeyScope, VERSION_KEY};
pub use memory::{Memory, ReferenceMapMemory};
pub use metrics::{CacheMetrics, CacheStats};
pub use migration::{MigrationOutcome, MigrationPipeline, MigrationSpec};
pub use persistence::{DiskPersistence, Persistence};
pub use processor::{ProcessorProviders, Startup};
pub use provider::{ProviderDefinition, ProviderRegistry};
pub use record::{Record, Reply, Response, Source};
pub use serializer::{JsonSerializer, Serializer};
pub use settings::CacheSettings;
pub use stash::{KeyStash, KeyStashBuilder};
pub use two_layers::{Lookup, SaveOptions, TwoLayersCache};

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, CacheError>;
