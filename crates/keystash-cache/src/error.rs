//! Cache-related error types

use thiserror::Error;

/// Boxed error produced by a loader
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Cache operation errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// Cache miss; triggers the loader and is never surfaced to callers
    #[error("Cache entry not found: {key}")]
    NotFound { key: String },

    /// No loader was supplied and no usable cached data exists
    #[error("No data cached for provider '{provider_key}' and no loader available")]
    LoaderUnavailable { provider_key: String },

    /// The loader ran and failed
    #[error("Loader for provider '{provider_key}' failed: {source}")]
    LoaderFailed {
        provider_key: String,
        #[source]
        source: BoxError,
    },

    /// Persisted record could not be decoded
    #[error("Failed to decode record {key}: {message}")]
    DecodeFailure { key: String, message: String },

    /// Malformed configuration, raised at construction time
    #[error("Invalid configuration for {field}: {message}")]
    ConfigurationInvalid { field: String, message: String },

    /// Persistence write failed; the memory write still stands
    #[error("Failed to persist record {key}: {source}")]
    StorageWriteFailed {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Migration pipeline could not complete
    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encryption error: {0}")]
    Security(#[from] keystash_security::SecurityError),
}

impl CacheError {
    /// Create a configuration error
    pub fn configuration_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        CacheError::ConfigurationInvalid {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a decode failure
    pub fn decode_failure(key: impl Into<String>, message: impl Into<String>) -> Self {
        CacheError::DecodeFailure {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a storage write failure
    pub fn storage_write_failed(key: impl Into<String>, source: std::io::Error) -> Self {
        CacheError::StorageWriteFailed {
            key: key.into(),
            source,
        }
    }

    /// Create a loader failure
    pub fn loader_failed(provider_key: impl Into<String>, source: BoxError) -> Self {
        CacheError::LoaderFailed {
            provider_key: provider_key.into(),
            source,
        }
    }
}

/// Re-export commonly used Result type
pub type Result<T> = std::result::Result<T, CacheError>;
