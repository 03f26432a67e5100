//! Per-request cache configuration
//!
//! A [`ConfigProvider`] describes one logical request: which record it
//! addresses, how long that record lives, whether to evict before lookup
//! and how to load fresh data on a miss. Invalid combinations are rejected
//! by [`ConfigProviderBuilder::build`], never at request time.

use std::{future::Future, time::Duration};

use futures::future::{BoxFuture, FutureExt};

use crate::{
    error::BoxError,
    key::{KeyParts, KeyScope},
    CacheError, Result,
};

/// Deferred, fallible producer of fresh data, invoked at most once
pub type Loader<T> =
    Box<dyn FnOnce() -> BoxFuture<'static, std::result::Result<T, BoxError>> + Send>;

/// Records removed before lookup when eviction is forced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictScope {
    #[default]
    None,
    /// Every record of the provider
    Provider,
    /// Every group under the configured dynamic key
    DynamicKey,
    /// Only the configured dynamic key group
    DynamicKeyGroup,
}

/// Everything about a request except its loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    pub parts: KeyParts,
    pub life_time_millis: Option<u64>,
    pub expirable: bool,
    pub encrypted: bool,
    pub required_detailed_response: bool,
    pub evict_scope: EvictScope,
    pub force_evict: bool,
    /// Class name stamped on saved records, `None` for the Rust type name
    pub data_class_name: Option<String>,
}

impl RequestOptions {
    /// Records to evict before lookup, if eviction is forced.
    ///
    /// Forcing eviction without a scope evicts the whole provider.
    pub fn forced_eviction(&self) -> Option<KeyScope<'_>> {
        if !self.force_evict {
            return None;
        }
        let provider_key = self.parts.provider_key.as_str();
        let dynamic_key = self.parts.dynamic_key.as_str();
        match self.evict_scope {
            EvictScope::None | EvictScope::Provider => Some(KeyScope::Provider { provider_key }),
            EvictScope::DynamicKey => Some(KeyScope::DynamicKey {
                provider_key,
                dynamic_key,
            }),
            EvictScope::DynamicKeyGroup => Some(KeyScope::DynamicKeyGroup {
                provider_key,
                dynamic_key,
                dynamic_key_group: self.parts.dynamic_key_group.as_str(),
            }),
        }
    }
}

/// Immutable configuration for one request
pub struct ConfigProvider<T> {
    options: RequestOptions,
    loader: Option<Loader<T>>,
}

impl<T> ConfigProvider<T> {
    /// Start configuring a request for `provider_key`
    pub fn builder(provider_key: impl Into<String>) -> ConfigProviderBuilder<T> {
        ConfigProviderBuilder::new(provider_key)
    }

    pub fn provider_key(&self) -> &str {
        &self.options.parts.provider_key
    }

    pub fn dynamic_key(&self) -> &str {
        &self.options.parts.dynamic_key
    }

    pub fn dynamic_key_group(&self) -> &str {
        &self.options.parts.dynamic_key_group
    }

    /// The three key components
    pub fn key_parts(&self) -> &KeyParts {
        &self.options.parts
    }

    pub fn life_time_millis(&self) -> Option<u64> {
        self.options.life_time_millis
    }

    pub fn expirable(&self) -> bool {
        self.options.expirable
    }

    pub fn encrypted(&self) -> bool {
        self.options.encrypted
    }

    pub fn required_detailed_response(&self) -> bool {
        self.options.required_detailed_response
    }

    pub fn evict_scope(&self) -> EvictScope {
        self.options.evict_scope
    }

    pub fn force_evict(&self) -> bool {
        self.options.force_evict
    }

    pub fn data_class_name(&self) -> Option<&str> {
        self.options.data_class_name.as_deref()
    }

    pub fn has_loader(&self) -> bool {
        self.loader.is_some()
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Records to evict before lookup, if eviction is forced
    pub fn forced_eviction(&self) -> Option<KeyScope<'_>> {
        self.options.forced_eviction()
    }

    /// Split into the request options and the loader
    pub fn into_parts(self) -> (RequestOptions, Option<Loader<T>>) {
        (self.options, self.loader)
    }
}

impl<T> std::fmt::Debug for ConfigProvider<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigProvider")
            .field("options", &self.options)
            .field("loader", &self.loader.is_some())
            .finish()
    }
}

/// Builder for [`ConfigProvider`]
pub struct ConfigProviderBuilder<T> {
    parts: KeyParts,
    life_time_millis: Option<u64>,
    expirable: bool,
    encrypted: bool,
    required_detailed_response: bool,
    evict_scope: EvictScope,
    force_evict: bool,
    data_class_name: Option<String>,
    loader: Option<Loader<T>>,
}

impl<T> std::fmt::Debug for ConfigProviderBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigProviderBuilder")
            .field("parts", &self.parts)
            .field("life_time_millis", &self.life_time_millis)
            .field("expirable", &self.expirable)
            .field("encrypted", &self.encrypted)
            .field("required_detailed_response", &self.required_detailed_response)
            .field("evict_scope", &self.evict_scope)
            .field("force_evict", &self.force_evict)
            .field("data_class_name", &self.data_class_name)
            .field("loader", &self.loader.is_some())
            .finish()
    }
}

impl<T> ConfigProviderBuilder<T> {
    /// Defaults: no dynamic key, no lifetime, expirable, plain, detailed response
    pub fn new(provider_key: impl Into<String>) -> Self {
        Self {
            parts: KeyParts {
                provider_key: provider_key.into(),
                dynamic_key: String::new(),
                dynamic_key_group: String::new(),
            },
            life_time_millis: None,
            expirable: true,
            encrypted: false,
            required_detailed_response: true,
            evict_scope: EvictScope::None,
            force_evict: false,
            data_class_name: None,
            loader: None,
        }
    }

    pub fn dynamic_key(mut self, dynamic_key: impl Into<String>) -> Self {
        self.parts.dynamic_key = dynamic_key.into();
        self
    }

    pub fn dynamic_key_group(mut self, dynamic_key_group: impl Into<String>) -> Self {
        self.parts.dynamic_key_group = dynamic_key_group.into();
        self
    }

    pub fn life_time(mut self, life_time: Duration) -> Self {
        self.life_time_millis = Some(u64::try_from(life_time.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn life_time_millis(mut self, life_time_millis: Option<u64>) -> Self {
        self.life_time_millis = life_time_millis;
        self
    }

    pub fn expirable(mut self, expirable: bool) -> Self {
        self.expirable = expirable;
        self
    }

    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Whether the caller gets a [`crate::Reply`] or the raw data
    pub fn detailed_response(mut self, required: bool) -> Self {
        self.required_detailed_response = required;
        self
    }

    pub fn evict_scope(mut self, scope: EvictScope) -> Self {
        self.evict_scope = scope;
        self
    }

    pub fn force_evict(mut self, force_evict: bool) -> Self {
        self.force_evict = force_evict;
        self
    }

    /// Force eviction of `scope` before lookup
    pub fn evict(self, scope: EvictScope) -> Self {
        self.evict_scope(scope).force_evict(true)
    }

    /// Name saved records by `data_class_name` instead of the Rust type name.
    ///
    /// Migrations purge records by this name in a later process. The
    /// default, [`std::any::type_name`], is not guaranteed stable across
    /// compiler versions, so providers whose records a migration may purge
    /// should set a name of their own.
    pub fn data_class_name(mut self, data_class_name: impl Into<String>) -> Self {
        self.data_class_name = Some(data_class_name.into());
        self
    }

    /// Use an already boxed loader
    pub fn with_loader(mut self, loader: Loader<T>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Check invariants and build the configuration
    pub fn build(self) -> Result<ConfigProvider<T>> {
        if self.parts.provider_key.is_empty() {
            return Err(CacheError::configuration_invalid("provider_key", "must not be empty"));
        }
        match self.evict_scope {
            EvictScope::DynamicKey if self.parts.dynamic_key.is_empty() => {
                return Err(CacheError::configuration_invalid(
                    "dynamic_key",
                    format!(
                        "provider '{}' evicts by dynamic key but none is set",
                        self.parts.provider_key
                    ),
                ));
            }
            EvictScope::DynamicKeyGroup if self.parts.dynamic_key_group.is_empty() => {
                return Err(CacheError::configuration_invalid(
                    "dynamic_key_group",
                    format!(
                        "provider '{}' evicts by dynamic key group but none is set",
                        self.parts.provider_key
                    ),
                ));
            }
            _ => {}
        }

        Ok(ConfigProvider {
            options: RequestOptions {
                parts: self.parts,
                life_time_millis: self.life_time_millis,
                expirable: self.expirable,
                encrypted: self.encrypted,
                required_detailed_response: self.required_detailed_response,
                evict_scope: self.evict_scope,
                force_evict: self.force_evict,
                data_class_name: self.data_class_name,
            },
            loader: self.loader,
        })
    }
}

impl<T: Send + 'static> ConfigProviderBuilder<T> {
    /// Load fresh data with an async closure on a miss
    pub fn loader<F, Fut>(self, loader: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, BoxError>> + Send + 'static,
    {
        self.with_loader(Box::new(move || loader().boxed()))
    }
}
