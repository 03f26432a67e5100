//! Isolating callers from cached state

use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{serializer::Serializer, CacheError, Result};

/// Produces independently owned copies by round-tripping through a [`Serializer`]
#[derive(Clone)]
pub struct DeepCopy {
    serializer: Arc<dyn Serializer>,
}

impl DeepCopy {
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self { serializer }
    }

    /// Value-equal copy of `data`, or `data` itself if the round trip fails
    pub fn copy<T>(&self, data: T) -> T
    where
        T: Serialize + DeserializeOwned,
    {
        match self.round_trip(&data) {
            Ok(copy) => copy,
            Err(e) => {
                debug!("Deep copy fell back to the original value: {}", e);
                data
            }
        }
    }

    /// Typed copy of a cached value
    pub fn from_cached<T: DeserializeOwned>(&self, key: &str, value: &Value) -> Result<T> {
        let bytes = self.serializer.to_bytes(value)?;
        let value = self.serializer.from_bytes(&bytes)?;
        serde_json::from_value(value).map_err(|e| CacheError::decode_failure(key, e.to_string()))
    }

    fn round_trip<T>(&self, data: &T) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let value = serde_json::to_value(data)?;
        let bytes = self.serializer.to_bytes(&value)?;
        Ok(serde_json::from_value(self.serializer.from_bytes(&bytes)?)?)
    }
}
