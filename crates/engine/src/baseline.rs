//! Versioned baseline storage
//!
//! Layout under the baseline namespace:
//!
//! ```text
//! <page>/<viewport>/index.json      active pointer + version history
//! <page>/<viewport>/v000001.png     immutable version blobs
//! ```
//!
//! A version blob is written before the index that points at it, so a reader
//! never observes an active version whose bytes are missing. Old versions are
//! retained until an explicit [`BaselineStore::prune`].

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use visreg_common::blob::digest;
use visreg_common::{BlobStore, Dimensions, Error, Result, TargetKey, ViewportClass};

use crate::compare::decoded_dimensions;

pub const BASELINE_NAMESPACE: &str = "baselines";

const INDEX_FILE: &str = "index.json";

/// Metadata for one stored baseline version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineVersion {
    pub version: u32,
    pub digest: String,
    pub dimensions: Dimensions,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    /// Run or actor that produced this version
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BaselineIndex {
    active: Option<u32>,
    versions: Vec<BaselineVersion>,
}

impl BaselineIndex {
    fn next_version(&self) -> u32 {
        self.versions.iter().map(|v| v.version).max().unwrap_or(0) + 1
    }

    fn find(&self, version: u32) -> Option<&BaselineVersion> {
        self.versions.iter().find(|v| v.version == version)
    }
}

/// The active reference image for a key
#[derive(Debug, Clone)]
pub struct Baseline {
    pub key: TargetKey,
    pub meta: BaselineVersion,
    pub bytes: Bytes,
}

/// Per-key summary used for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineSummary {
    pub key: TargetKey,
    pub active: Option<BaselineVersion>,
    pub version_count: usize,
}

/// Version history for a key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineHistory {
    pub key: TargetKey,
    pub active: Option<u32>,
    pub versions: Vec<BaselineVersion>,
}

/// Baseline store over a blob store namespace
pub struct BaselineStore {
    blobs: Arc<dyn BlobStore>,
    namespace: String,
    /// Serialises writers per key; readers never take it
    locks: DashMap<TargetKey, Arc<Mutex<()>>>,
}

impl BaselineStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self::with_namespace(blobs, BASELINE_NAMESPACE)
    }

    pub fn with_namespace(blobs: Arc<dyn BlobStore>, namespace: impl Into<String>) -> Self {
        Self {
            blobs,
            namespace: namespace.into(),
            locks: DashMap::new(),
        }
    }

    fn index_key(key: &TargetKey) -> String {
        format!("{}/{}", key.storage_path(), INDEX_FILE)
    }

    fn version_key(key: &TargetKey, version: u32) -> String {
        format!("{}/v{:06}.png", key.storage_path(), version)
    }

    fn lock_for(&self, key: &TargetKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_index(&self, key: &TargetKey) -> Result<Option<BaselineIndex>> {
        let raw = self
            .blobs
            .get(&self.namespace, &Self::index_key(key))
            .await
            .map_err(|e| Error::baseline_io(key, e))?;
        match raw {
            Some(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(|e| Error::baseline_io(key, format!("corrupt index: {}", e))),
            None => Ok(None),
        }
    }

    async fn save_index(&self, key: &TargetKey, index: &BaselineIndex) -> Result<()> {
        let raw = serde_json::to_vec_pretty(index)?;
        self.blobs
            .put(&self.namespace, &Self::index_key(key), &raw)
            .await
            .map_err(|e| Error::baseline_io(key, e))?;
        Ok(())
    }

    async fn load_version(&self, key: &TargetKey, meta: &BaselineVersion) -> Result<Bytes> {
        let bytes = self
            .blobs
            .get(&self.namespace, &Self::version_key(key, meta.version))
            .await
            .map_err(|e| Error::baseline_io(key, e))?
            .ok_or_else(|| {
                Error::baseline_io(key, format!("version {} blob missing", meta.version))
            })?;
        Ok(Bytes::from(bytes))
    }

    /// Fetch the active baseline; `None` means no baseline exists yet
    pub async fn get(&self, key: &TargetKey) -> Result<Option<Baseline>> {
        let Some(index) = self.load_index(key).await? else {
            return Ok(None);
        };
        let Some(meta) = index.active.and_then(|v| index.find(v)).cloned() else {
            return Ok(None);
        };

        let bytes = self.load_version(key, &meta).await?;
        Ok(Some(Baseline {
            key: key.clone(),
            meta,
            bytes,
        }))
    }

    /// Store `image` as a new version and make it active
    pub async fn put(
        &self,
        key: &TargetKey,
        image: &[u8],
        source: Option<&str>,
    ) -> Result<BaselineVersion> {
        let dimensions = decoded_dimensions(image)?;

        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let mut index = self.load_index(key).await?.unwrap_or_default();
        let meta = BaselineVersion {
            version: index.next_version(),
            digest: digest(image),
            dimensions,
            size_bytes: image.len() as u64,
            created_at: Utc::now(),
            source: source.map(String::from),
        };

        self.blobs
            .put(&self.namespace, &Self::version_key(key, meta.version), image)
            .await
            .map_err(|e| Error::baseline_io(key, e))?;

        let previous = index.active.replace(meta.version);
        index.versions.push(meta.clone());
        self.save_index(key, &index).await?;

        info!(
            "Baseline {} now at v{} (previous: {})",
            key,
            meta.version,
            previous.map(|v| format!("v{}", v)).unwrap_or_else(|| "none".to_string())
        );
        Ok(meta)
    }

    /// All versions for a key, oldest first
    pub async fn history(&self, key: &TargetKey) -> Result<BaselineHistory> {
        let index = self
            .load_index(key)
            .await?
            .ok_or_else(|| Error::not_found("baseline", key.to_string()))?;
        Ok(BaselineHistory {
            key: key.clone(),
            active: index.active,
            versions: index.versions,
        })
    }

    /// Every key with a baseline index, sorted
    pub async fn list(&self) -> Result<Vec<BaselineSummary>> {
        let keys = self
            .blobs
            .list(&self.namespace, "")
            .await
            .map_err(|e| Error::baseline_io(&self.namespace, e))?;

        let mut summaries = Vec::new();
        for raw in keys {
            let Some(key) = parse_index_key(&raw) else {
                continue;
            };
            if let Some(index) = self.load_index(&key).await? {
                summaries.push(BaselineSummary {
                    active: index.active.and_then(|v| index.find(v)).cloned(),
                    version_count: index.versions.len(),
                    key,
                });
            }
        }
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(summaries)
    }

    /// Re-promote an older version.
    ///
    /// The old image is written again as a new version, so the history stays
    /// append-only and the rollback itself is auditable.
    pub async fn rollback(&self, key: &TargetKey, version: u32) -> Result<BaselineVersion> {
        let meta = {
            let index = self
                .load_index(key)
                .await?
                .ok_or_else(|| Error::not_found("baseline", key.to_string()))?;
            index
                .find(version)
                .cloned()
                .ok_or_else(|| Error::not_found("baseline version", format!("{} v{}", key, version)))?
        };
        let bytes = self.load_version(key, &meta).await?;
        self.put(key, &bytes, Some(&format!("rollback:v{}", version)))
            .await
    }

    /// Delete inactive versions beyond the `keep_last` most recent.
    ///
    /// The active version is never removed. Returns the number deleted.
    pub async fn prune(&self, key: &TargetKey, keep_last: usize) -> Result<usize> {
        let lock = self.lock_for(key);
        let _guard = lock.lock().await;

        let mut index = self
            .load_index(key)
            .await?
            .ok_or_else(|| Error::not_found("baseline", key.to_string()))?;

        let mut inactive: Vec<u32> = index
            .versions
            .iter()
            .map(|v| v.version)
            .filter(|v| Some(*v) != index.active)
            .collect();
        inactive.sort_unstable_by(|a, b| b.cmp(a));
        let doomed: Vec<u32> = inactive.into_iter().skip(keep_last).collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        // Drop from the index first so a failed delete leaves only an orphan blob
        index.versions.retain(|v| !doomed.contains(&v.version));
        self.save_index(key, &index).await?;

        for version in &doomed {
            self.blobs
                .delete(&self.namespace, &Self::version_key(key, *version))
                .await
                .map_err(|e| Error::baseline_io(key, e))?;
        }

        debug!("Pruned {} baseline version(s) of {}", doomed.len(), key);
        Ok(doomed.len())
    }
}

/// `<page>/<viewport>/index.json` -> key
fn parse_index_key(raw: &str) -> Option<TargetKey> {
    let mut parts = raw.split('/');
    let page = parts.next()?;
    let viewport: ViewportClass = parts.next()?.parse().ok()?;
    match (parts.next(), parts.next()) {
        (Some(INDEX_FILE), None) => Some(TargetKey::new(page, viewport)),
        _ => None,
    }
}
