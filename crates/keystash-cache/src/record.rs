//! Cached records and the replies built from them

use serde::{Deserialize, Serialize};

/// Where a piece of data was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Source {
    /// The in-process memory layer
    Memory,
    /// The durable on-disk layer
    Persistence,
    /// Freshly produced by the loader
    #[default]
    Cloud,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Memory => write!(f, "memory"),
            Source::Persistence => write!(f, "persistence"),
            Source::Cloud => write!(f, "cloud"),
        }
    }
}

/// Cache record with metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    /// The cached data
    pub data: T,
    /// Epoch millis at which the record was created
    pub created_at_millis: i64,
    /// Lifetime after which the record expires, if any
    pub life_time_millis: Option<u64>,
    /// Whether time-based and size-based eviction apply to this record
    pub expirable: bool,
    /// Whether the persisted blob is encrypted
    pub encrypted: bool,
    /// Layer that served this record; overwritten by whichever layer reads it
    #[serde(default)]
    pub source: Source,
    /// Class name of the cached data, matched by migrations
    pub data_class_name: String,
}

impl<T> Record<T> {
    /// Create a new record stamped with `created_at_millis`
    pub fn new(data: T, data_class_name: impl Into<String>, created_at_millis: i64) -> Self {
        Self {
            data,
            created_at_millis,
            life_time_millis: None,
            expirable: true,
            encrypted: false,
            source: Source::Memory,
            data_class_name: data_class_name.into(),
        }
    }

    /// Set the lifetime
    pub fn with_life_time(mut self, life_time_millis: Option<u64>) -> Self {
        self.life_time_millis = life_time_millis;
        self
    }

    /// Set whether the record may be evicted by time or size pressure
    pub fn with_expirable(mut self, expirable: bool) -> Self {
        self.expirable = expirable;
        self
    }

    /// Set whether the record is encrypted at rest
    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Millis left before expiry at `now_millis`, if the record can expire
    pub fn ttl_remaining(&self, now_millis: i64) -> Option<i64> {
        if !self.expirable {
            return None;
        }
        let life_time = i64::try_from(self.life_time_millis?).unwrap_or(i64::MAX);
        Some(
            self.created_at_millis
                .saturating_add(life_time)
                .saturating_sub(now_millis),
        )
    }
}

/// Data handed back to a caller together with its provenance
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<T> {
    data: T,
    source: Source,
    encrypted: bool,
}

impl<T> Reply<T> {
    /// Create a reply
    pub fn new(data: T, source: Source, encrypted: bool) -> Self {
        Self {
            data,
            source,
            encrypted,
        }
    }

    /// The served data
    pub fn data(&self) -> &T {
        &self.data
    }

    /// Layer the data came from
    pub fn source(&self) -> Source {
        self.source
    }

    /// Whether the provider is encrypted at rest
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Consume the reply and return the data
    pub fn into_data(self) -> T {
        self.data
    }
}

/// Result of a request: either a detailed [`Reply`] or the raw data,
/// depending on the provider's `required_detailed_response` flag.
#[derive(Debug, Clone, PartialEq)]
pub enum Response<T> {
    Reply(Reply<T>),
    Data(T),
}

impl<T> Response<T> {
    /// The data, whichever flavor this is
    pub fn data(&self) -> &T {
        match self {
            Response::Reply(reply) => reply.data(),
            Response::Data(data) => data,
        }
    }

    /// Consume the response and return the data
    pub fn into_data(self) -> T {
        match self {
            Response::Reply(reply) => reply.into_data(),
            Response::Data(data) => data,
        }
    }

    /// The reply, if the provider asked for a detailed response
    pub fn into_reply(self) -> Option<Reply<T>> {
        match self {
            Response::Reply(reply) => Some(reply),
            Response::Data(_) => None,
        }
    }
}
