//! Byte encoding for records and deep copies

use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde_json::Value;

use crate::{CacheError, Result};

/// Encodes values to bytes and back.
///
/// Values travel as [`serde_json::Value`], which keeps the shape needed to
/// rebuild sequences, maps and structs on the way back.
pub trait Serializer: Send + Sync {
    /// Encode a value
    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode bytes produced by [`Serializer::to_bytes`]
    fn from_bytes(&self, bytes: &[u8]) -> Result<Value>;
}

/// JSON serializer, optionally gzip-compressed
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer {
    compress: bool,
}

impl JsonSerializer {
    /// Plain JSON
    pub fn new() -> Self {
        Self { compress: false }
    }

    /// Gzip-compressed JSON
    pub fn compressed() -> Self {
        Self { compress: true }
    }
}

impl Serializer for JsonSerializer {
    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(value)?;
        if !self.compress {
            return Ok(json);
        }

        let mut encoder =
            GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Value> {
        if !self.compress {
            return Ok(serde_json::from_slice(bytes)?);
        }

        let mut json = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut json)
            .map_err(|e| CacheError::decode_failure("<gzip>", e.to_string()))?;
        Ok(serde_json::from_slice(&json)?)
    }
}
