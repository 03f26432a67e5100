//! Process-wide engine settings
//!
//! Settings load from TOML with per-field defaults, then `KEYSTASH_*`
//! environment variables override individual fields.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{migration::MigrationSpec, CacheError, Result};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "KEYSTASH_";

/// Engine settings shared by every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Directory holding persisted records
    pub cache_dir: PathBuf,
    /// Stored size (MB) at which the size-capped sweep starts
    pub max_mb_persistence: u64,
    /// Fraction of `max_mb_persistence` at which the sweep stops
    pub evict_stop_ratio: f64,
    /// Pause between evictions during the size-capped sweep
    pub sweep_pacing_ms: u64,
    /// Serve expired data when the loader is missing or fails
    pub use_expired_data_if_loader_not_available: bool,
    /// Passphrase for encrypted providers
    pub encryption_key: Option<String>,
    /// Gzip record blobs
    pub compress: bool,
    /// Declared schema migrations
    pub migrations: Vec<MigrationSpec>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("keystash"),
            max_mb_persistence: 100,
            evict_stop_ratio: 0.9,
            sweep_pacing_ms: 0,
            use_expired_data_if_loader_not_available: false,
            encryption_key: None,
            compress: false,
            migrations: Vec::new(),
        }
    }
}

impl CacheSettings {
    /// Settings with default values rooted at `cache_dir`
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Parse settings from a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let settings: CacheSettings = toml::from_str(source)
            .map_err(|e| CacheError::configuration_invalid("settings", e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        debug!("Loaded cache settings from {}", path.display());
        Self::from_toml_str(&source)
    }

    /// Apply `KEYSTASH_*` overrides from the process environment
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(std::env::vars())
    }

    /// Apply `KEYSTASH_*` overrides from an explicit set of variables
    pub fn with_overrides<I, K, V>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in vars {
            let Some(field) = name.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match field {
                "CACHE_DIR" => self.cache_dir = PathBuf::from(value),
                "MAX_MB_PERSISTENCE" => self.max_mb_persistence = parse_field(field, value)?,
                "EVICT_STOP_RATIO" => self.evict_stop_ratio = parse_field(field, value)?,
                "SWEEP_PACING_MS" => self.sweep_pacing_ms = parse_field(field, value)?,
                "USE_EXPIRED_DATA" => {
                    self.use_expired_data_if_loader_not_available = parse_field(field, value)?
                }
                "ENCRYPTION_KEY" => self.encryption_key = Some(value.to_string()),
                "COMPRESS" => self.compress = parse_field(field, value)?,
                _ => continue,
            }
            debug!("Applied settings override {}{}", ENV_PREFIX, field);
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_mb_persistence == 0 {
            return Err(CacheError::configuration_invalid(
                "max_mb_persistence",
                "must be greater than zero",
            ));
        }
        if !(self.evict_stop_ratio > 0.0 && self.evict_stop_ratio <= 1.0) {
            return Err(CacheError::configuration_invalid(
                "evict_stop_ratio",
                format!("must be in (0, 1], got {}", self.evict_stop_ratio),
            ));
        }
        if matches!(self.encryption_key.as_deref(), Some("")) {
            return Err(CacheError::configuration_invalid(
                "encryption_key",
                "must not be empty",
            ));
        }
        for migration in &self.migrations {
            migration.validate()?;
        }
        Ok(())
    }

    /// Byte size at which the size-capped sweep stops evicting
    pub fn sweep_target_bytes(&self) -> u64 {
        (self.max_mb_persistence as f64 * self.evict_stop_ratio * BYTES_PER_MB as f64) as u64
    }
}

/// Bytes in one megabyte as used for persistence accounting
pub const BYTES_PER_MB: u64 = 1024 * 1024;

fn parse_field<T: std::str::FromStr>(field: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| CacheError::configuration_invalid(field.to_lowercase(), e.to_string()))
}
