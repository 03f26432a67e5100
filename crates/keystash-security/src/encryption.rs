//! Record encryption for blobs at rest

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
};
use base64::{engine::general_purpose, Engine as _};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Result, SecurityError};

const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;

/// Symmetric cipher contract used by the persistence layer.
///
/// `decrypt` must fail with an `Err` (never panic) when the key is wrong or
/// the ciphertext is corrupt; callers treat that as an absent record.
pub trait Encryptor: Send + Sync {
    /// Encrypt `plaintext` with the given passphrase
    fn encrypt(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt bytes previously produced by [`Encryptor::encrypt`]
    fn decrypt(&self, key: &str, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// Encrypted data structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedData {
    /// Base64-encoded salt
    pub salt: String,
    /// Base64-encoded nonce
    pub nonce: String,
    /// Base64-encoded encrypted data
    pub ciphertext: String,
}

/// AES-256-GCM encryptor.
///
/// Every blob gets a fresh random salt and nonce. The cipher key is the
/// SHA-256 of `salt || passphrase`, and the output is the JSON encoding of
/// [`EncryptedData`].
#[derive(Debug, Default, Clone, Copy)]
pub struct AesGcmEncryptor;

impl AesGcmEncryptor {
    /// Create a new encryptor
    pub fn new() -> Self {
        Self
    }

    fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(passphrase.as_bytes());
        let digest = hasher.finalize();

        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        key
    }

    /// Generate random salt
    fn generate_salt() -> [u8; SALT_LEN] {
        rand::thread_rng().gen()
    }

    /// Generate random nonce
    fn generate_nonce() -> [u8; NONCE_LEN] {
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill(&mut bytes);
        bytes
    }
}

impl Encryptor for AesGcmEncryptor {
    fn encrypt(&self, key: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let salt = Self::generate_salt();
        let nonce = Self::generate_nonce();
        let encryption_key = Self::derive_key(key, &salt);

        let cipher = Aes256Gcm::new(&encryption_key.into());
        let nonce_gcm = aes_gcm::Nonce::from_slice(&nonce);
        let ciphertext = cipher
            .encrypt(nonce_gcm, plaintext)
            .map_err(|e| SecurityError::Encryption {
                message: e.to_string(),
            })?;

        let envelope = EncryptedData {
            salt: general_purpose::STANDARD.encode(salt),
            nonce: general_purpose::STANDARD.encode(nonce),
            ciphertext: general_purpose::STANDARD.encode(ciphertext),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    fn decrypt(&self, key: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let envelope: EncryptedData = serde_json::from_slice(ciphertext)?;
        let salt = general_purpose::STANDARD.decode(&envelope.salt)?;
        let nonce_bytes = general_purpose::STANDARD.decode(&envelope.nonce)?;
        let ciphertext = general_purpose::STANDARD.decode(&envelope.ciphertext)?;

        if nonce_bytes.len() != NONCE_LEN {
            return Err(SecurityError::Envelope {
                message: format!("nonce must be {} bytes, got {}", NONCE_LEN, nonce_bytes.len()),
            });
        }

        let encryption_key = Self::derive_key(key, &salt);
        let cipher = Aes256Gcm::new(&encryption_key.into());
        let nonce = aes_gcm::Nonce::from_slice(&nonce_bytes);

        cipher.decrypt(nonce, ciphertext.as_ref()).map_err(|e| {
            debug!("Decryption rejected: wrong key or tampered ciphertext");
            SecurityError::Decryption {
                message: e.to_string(),
            }
        })
    }
}
