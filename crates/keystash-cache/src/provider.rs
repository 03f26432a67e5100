//! Named provider definitions
//!
//! Callers describe each provider once and build per-request
//! [`ConfigProvider`](crate::ConfigProvider)s from it. The registry memoizes
//! definitions by a stable request-shape name.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{config::ConfigProviderBuilder, CacheError, Result};

/// Request-independent settings of a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDefinition {
    pub provider_key: String,
    #[serde(default)]
    pub life_time_millis: Option<u64>,
    #[serde(default = "default_true")]
    pub expirable: bool,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default = "default_true")]
    pub detailed_response: bool,
    /// Stable class name stamped on saved records; see
    /// [`ConfigProviderBuilder::data_class_name`]
    #[serde(default)]
    pub data_class_name: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ProviderDefinition {
    pub fn new(provider_key: impl Into<String>) -> Self {
        Self {
            provider_key: provider_key.into(),
            life_time_millis: None,
            expirable: true,
            encrypted: false,
            detailed_response: true,
            data_class_name: None,
        }
    }

    pub fn with_life_time(mut self, life_time: Duration) -> Self {
        self.life_time_millis = Some(u64::try_from(life_time.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_expirable(mut self, expirable: bool) -> Self {
        self.expirable = expirable;
        self
    }

    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn with_detailed_response(mut self, detailed_response: bool) -> Self {
        self.detailed_response = detailed_response;
        self
    }

    pub fn with_data_class_name(mut self, data_class_name: impl Into<String>) -> Self {
        self.data_class_name = Some(data_class_name.into());
        self
    }

    /// A request builder pre-filled from this definition
    pub fn config<T>(&self) -> ConfigProviderBuilder<T> {
        let builder = ConfigProviderBuilder::new(self.provider_key.clone())
            .life_time_millis(self.life_time_millis)
            .expirable(self.expirable)
            .encrypted(self.encrypted)
            .detailed_response(self.detailed_response);
        match &self.data_class_name {
            Some(data_class_name) => builder.data_class_name(data_class_name.clone()),
            None => builder,
        }
    }
}

/// Provider definitions memoized by name
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    definitions: RwLock<HashMap<String, Arc<ProviderDefinition>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, replacing any previous one under `name`
    pub fn register(
        &self,
        name: impl Into<String>,
        definition: ProviderDefinition,
    ) -> Option<Arc<ProviderDefinition>> {
        let name = name.into();
        debug!("Registering provider {} as {}", definition.provider_key, name);
        self.definitions.write().insert(name, Arc::new(definition))
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProviderDefinition>> {
        self.definitions.read().get(name).cloned()
    }

    /// A request builder for the provider registered as `name`
    pub fn config<T>(&self, name: &str) -> Result<ConfigProviderBuilder<T>> {
        self.get(name)
            .map(|definition| definition.config())
            .ok_or_else(|| {
                CacheError::configuration_invalid(
                    "provider",
                    format!("no provider registered as '{}'", name),
                )
            })
    }

    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.read().is_empty()
    }
}
