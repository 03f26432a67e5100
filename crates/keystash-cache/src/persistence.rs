//! Durable on-disk layer

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use keystash_security::Encryptor;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::{
    fs,
    io::{AsyncBufReadExt, BufReader},
    sync::Mutex,
};
use tracing::{debug, warn};

use crate::{record::Record, serializer::Serializer, settings::BYTES_PER_MB, CacheError, Result};

const EXTENSION: &str = "cache";
const WRITE_LOCK_STRIPES: usize = 64;

/// Durable record store keyed by composed key
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Store a record, encrypting it when `encrypt_key` is given
    async fn save(
        &self,
        key: &str,
        record: &Record<Value>,
        encrypt_key: Option<&str>,
    ) -> Result<()>;

    /// Read a record back.
    ///
    /// Returns `None` when the record is absent, unreadable, or stored with a
    /// different encryption state or key than requested.
    async fn retrieve(
        &self,
        key: &str,
        encrypted: bool,
        encrypt_key: Option<&str>,
    ) -> Option<Record<Value>>;

    /// Remove one record, returning whether it was stored
    async fn evict(&self, key: &str) -> Result<bool>;

    /// Remove every record
    async fn evict_all(&self) -> Result<()>;

    /// Every stored key
    async fn all_keys(&self) -> Result<Vec<String>>;

    /// Total bytes of stored records
    async fn stored_size_bytes(&self) -> Result<u64>;

    /// Total stored size in megabytes, rounded up
    async fn stored_size_mb(&self) -> Result<u64> {
        Ok(self.stored_size_bytes().await?.div_ceil(BYTES_PER_MB))
    }
}

/// Disk-based persistence: one file per composed key.
///
/// File names are the SHA-256 digest of the composed key, so their length is
/// bounded whatever the key. Each file starts with a plain header line holding
/// the JSON-quoted composed key, followed by the (possibly encrypted) record
/// bytes; enumeration reads keys back from the headers. Writes go to a
/// temporary file that is then renamed over the target, and writes to the
/// same key are serialized.
pub struct DiskPersistence {
    base_path: PathBuf,
    serializer: Arc<dyn Serializer>,
    encryptor: Arc<dyn Encryptor>,
    write_locks: Vec<Mutex<()>>,
}

impl std::fmt::Debug for DiskPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskPersistence")
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

impl DiskPersistence {
    /// Create new disk persistence rooted at `base_path`
    pub fn new<P: AsRef<Path>>(
        base_path: P,
        serializer: Arc<dyn Serializer>,
        encryptor: Arc<dyn Encryptor>,
    ) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            serializer,
            encryptor,
            write_locks: (0..WRITE_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Directory holding the record files
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn file_stem(key: &str) -> String {
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    /// Get file path for a key
    fn key_path(&self, key: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.{}", Self::file_stem(key), EXTENSION))
    }

    fn temp_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.tmp", Self::file_stem(key)))
    }

    /// Recover the composed key from a record file's header line
    async fn path_key(path: &Path) -> Option<String> {
        if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
            return None;
        }
        let file = fs::File::open(path).await.ok()?;
        let mut header = String::new();
        BufReader::new(file).read_line(&mut header).await.ok()?;
        let key: String = serde_json::from_str(header.trim_end_matches('\n')).ok()?;

        // A header that does not hash to its file name is not one of ours
        let stem = path.file_stem()?.to_str()?;
        (stem == Self::file_stem(&key)).then_some(key)
    }

    fn lock_for(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.write_locks[(hasher.finish() as usize) % self.write_locks.len()]
    }

    /// Ensure base directory exists
    async fn ensure_base_dir(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.base_path).await
    }

    fn encode(
        &self,
        key: &str,
        record: &Record<Value>,
        encrypt_key: Option<&str>,
    ) -> Result<Vec<u8>> {
        let value = serde_json::to_value(record)?;
        let bytes = self.serializer.to_bytes(&value)?;
        let payload = match encrypt_key {
            Some(secret) => self.encryptor.encrypt(secret, &bytes)?,
            None => bytes,
        };

        let mut blob = serde_json::to_vec(key)?;
        blob.push(b'\n');
        blob.extend_from_slice(&payload);
        Ok(blob)
    }

    fn decode(
        &self,
        key: &str,
        blob: &[u8],
        encrypted: bool,
        encrypt_key: Option<&str>,
    ) -> Result<Record<Value>> {
        let Some(split) = blob.iter().position(|byte| *byte == b'\n') else {
            return Err(CacheError::decode_failure(key, "missing key header"));
        };
        let stored_key: String = serde_json::from_slice(&blob[..split])?;
        if stored_key != key {
            return Err(CacheError::decode_failure(
                key,
                format!("file holds record for {}", stored_key),
            ));
        }
        let bytes = &blob[split + 1..];

        let plain = if encrypted {
            let secret = encrypt_key
                .ok_or_else(|| CacheError::decode_failure(key, "no encryption key supplied"))?;
            self.encryptor.decrypt(secret, bytes)?
        } else {
            bytes.to_vec()
        };

        let value = self.serializer.from_bytes(&plain)?;
        let record: Record<Value> = serde_json::from_value(value)?;
        if record.encrypted != encrypted {
            return Err(CacheError::decode_failure(
                key,
                format!(
                    "stored encryption state is {}, requested {}",
                    record.encrypted, encrypted
                ),
            ));
        }
        Ok(record)
    }

    async fn record_files(&self) -> Result<Vec<(PathBuf, String)>> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(key) = Self::path_key(&path).await {
                files.push((path, key));
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl Persistence for DiskPersistence {
    async fn save(
        &self,
        key: &str,
        record: &Record<Value>,
        encrypt_key: Option<&str>,
    ) -> Result<()> {
        let bytes = self.encode(key, record, encrypt_key)?;
        let file_path = self.key_path(key);
        let temp_path = self.temp_path(key);

        let _guard = self.lock_for(key).lock().await;
        self.ensure_base_dir()
            .await
            .map_err(|e| CacheError::storage_write_failed(key, e))?;
        fs::write(&temp_path, &bytes)
            .await
            .map_err(|e| CacheError::storage_write_failed(key, e))?;
        fs::rename(&temp_path, &file_path)
            .await
            .map_err(|e| CacheError::storage_write_failed(key, e))?;

        debug!("Persisted record {} ({} bytes)", key, bytes.len());
        Ok(())
    }

    async fn retrieve(
        &self,
        key: &str,
        encrypted: bool,
        encrypt_key: Option<&str>,
    ) -> Option<Record<Value>> {
        let file_path = self.key_path(key);
        let bytes = match fs::read(&file_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Failed to read persisted record {}: {}", key, e);
                return None;
            }
        };

        match self.decode(key, &bytes, encrypted, encrypt_key) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!("Treating unreadable record {} as absent: {}", key, e);
                None
            }
        }
    }

    async fn evict(&self, key: &str) -> Result<bool> {
        let file_path = self.key_path(key);
        let _guard = self.lock_for(key).lock().await;

        match fs::remove_file(&file_path).await {
            Ok(()) => {
                debug!("Evicted persisted record {}", key);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn evict_all(&self) -> Result<()> {
        for (_, key) in self.record_files().await? {
            self.evict(&key).await?;
        }
        Ok(())
    }

    async fn all_keys(&self) -> Result<Vec<String>> {
        Ok(self.record_files().await?.into_iter().map(|(_, key)| key).collect())
    }

    async fn stored_size_bytes(&self) -> Result<u64> {
        let mut total_size = 0u64;
        for (path, _) in self.record_files().await? {
            // A file evicted between listing and stat simply no longer counts
            if let Ok(metadata) = fs::metadata(&path).await {
                total_size += metadata.len();
            }
        }
        Ok(total_size)
    }
}
