//! Namespaced blob storage
//!
//! Image bytes are stored as `namespace + key -> bytes`. Callers pick the
//! namespace (per user, per run, baselines); nothing above this module
//! assumes a physical layout.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;

use crate::{Error, Result};

/// Reference to a stored blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    pub namespace: String,
    pub key: String,
}

impl BlobRef {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

/// Read/write of named byte blobs under a namespace
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data`, replacing any blob with the same key
    async fn put(&self, namespace: &str, key: &str, data: &[u8]) -> Result<BlobRef>;

    /// Fetch a blob; an absent key is `Ok(None)`
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, namespace: &str, key: &str) -> Result<()>;

    /// Keys under `namespace` starting with `prefix`, sorted. Blobs in nested
    /// namespaces are listed as `child/key`.
    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>>;
}

/// SHA-256 hex digest of data
pub fn digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Reject keys that could escape their namespace.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("empty key".to_string()));
    }
    if key.contains('\\') || key.contains('\0') {
        return Err(Error::InvalidKey(key.to_string()));
    }
    for component in Path::new(key).components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(Error::InvalidKey(key.to_string())),
        }
    }
    Ok(())
}

/// Filesystem-backed blob store rooted at a directory
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store at the given root directory
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(".tmp")).await?;
        debug!("Initialized blob store at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, namespace: &str, key: &str) -> Result<PathBuf> {
        validate_key(namespace)?;
        validate_key(key)?;
        Ok(self.root.join(namespace).join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, namespace: &str, key: &str, data: &[u8]) -> Result<BlobRef> {
        let path = self.blob_path(namespace, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write atomically via temp file
        let tmp_path = self
            .root
            .join(".tmp")
            .join(format!("{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp_path, data).await?;
        fs::rename(&tmp_path, &path).await?;

        debug!("Stored blob {}/{} ({} bytes)", namespace, key, data.len());
        Ok(BlobRef::new(namespace, key))
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(namespace, key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        let path = self.blob_path(namespace, key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted blob {}/{}", namespace, key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>> {
        validate_key(namespace)?;
        let dir = self.root.join(namespace);
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            if !dir.exists() {
                return Ok(keys);
            }
            for entry in walkdir::WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&dir) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(&prefix) {
                        keys.push(key);
                    }
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }
}

/// In-memory blob store
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, namespace: &str, key: &str, data: &[u8]) -> Result<BlobRef> {
        validate_key(namespace)?;
        validate_key(key)?;
        self.blobs
            .write()
            .insert((namespace.to_string(), key.to_string()), data.to_vec());
        Ok(BlobRef::new(namespace, key))
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(namespace)?;
        validate_key(key)?;
        Ok(self
            .blobs
            .read()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
        self.blobs
            .write()
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    async fn list(&self, namespace: &str, prefix: &str) -> Result<Vec<String>> {
        validate_key(namespace)?;
        // Nested namespaces show up as key prefixes, as they do on disk
        let nested = format!("{}/", namespace);
        let mut keys: Vec<String> = self
            .blobs
            .read()
            .keys()
            .filter_map(|(ns, key)| {
                if ns == namespace {
                    Some(key.clone())
                } else {
                    ns.strip_prefix(&nested).map(|rest| format!("{}/{}", rest, key))
                }
            })
            .filter(|key| key.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }
}
