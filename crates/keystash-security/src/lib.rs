//! # KeyStash Security
//!
//! Encryption at rest for KeyStash records.
//!
//! This crate provides:
//! - The [`Encryptor`] contract used by the persistence layer
//! - An AES-256-GCM implementation with a per-blob salt and nonce

pub mod encryption;
pub mod error;

pub use encryption::{AesGcmEncryptor, EncryptedData, Encryptor};
pub use error::SecurityError;

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, SecurityError>;
