//! Security-related error types

use thiserror::Error;

/// Security operation errors
#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("Encryption error: {message}")]
    Encryption { message: String },

    #[error("Decryption error: {message}")]
    Decryption { message: String },

    #[error("Malformed encrypted envelope: {message}")]
    Envelope { message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}
