//! Content-addressed layer cache.
//!
//! Blobs live under `<root>/blobs/sha256/<hex>`; the index mapping content
//! keys to built layers lives under `<root>/layers/<key>.json` so a later
//! process can reuse layers without rebuilding them.

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

use super::sha256_digest;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A layer blob that has been built and stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedLayer {
    /// Digest of the compressed blob.
    pub digest: String,
    /// Digest of the uncompressed tar.
    pub diff_id: String,
    /// Compressed size in bytes.
    pub size: u64,
}

/// Digest-addressed blob storage on disk.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Get the local path for a blob.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        // digest format: "sha256:abc123..."
        match digest.split_once(':') {
            Some((algorithm, hex)) => self.root.join("blobs").join(algorithm).join(hex),
            None => self.root.join("blobs").join(digest),
        }
    }

    /// Check if a blob exists locally.
    pub fn exists(&self, digest: &str) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Store `bytes` under `digest`, verifying that they match.
    ///
    /// Writes go to a temporary file first and are renamed into place, so a
    /// reader never observes a partial blob.
    pub fn write(&self, digest: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let actual = sha256_digest(bytes);
        if actual != digest {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("digest mismatch: expected {digest}, got {actual}"),
            ));
        }

        let path = self.blob_path(digest);
        if path.is_file() {
            return Ok(path);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension(format!(
            "{}.{}.tmp",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&temp_path, bytes)?;
        if let Err(e) = fs::rename(&temp_path, &path) {
            fs::remove_file(&temp_path).ok();
            return Err(e);
        }

        Ok(path)
    }

    pub fn read(&self, digest: &str) -> io::Result<Vec<u8>> {
        fs::read(self.blob_path(digest))
    }
}

/// Cache statistics.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub builds: AtomicU64,
    pub failures: AtomicU64,
}

impl CacheStats {
    /// `(hits, builds, failures)` at this instant.
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.builds.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }
}

/// Layer cache keyed by content key.
///
/// Each key owns a cell that is initialized at most once. Concurrent
/// requests for the same key wait on the in-flight build instead of
/// starting another; a failed build leaves the cell empty so the next
/// request retries.
#[derive(Debug)]
pub struct LayerCache {
    store: BlobStore,
    index_dir: PathBuf,
    layers: Mutex<HashMap<String, Arc<OnceCell<CachedLayer>>>>,
    stats: CacheStats,
}

impl LayerCache {
    /// Open the cache rooted at `dir`, loading any persisted index entries.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let root = dir.as_ref();
        let store = BlobStore::new(root);
        let index_dir = root.join("layers");
        fs::create_dir_all(&index_dir)?;

        let mut layers = HashMap::new();
        for entry in fs::read_dir(&index_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }

            let key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|s| s.replace('_', ":"))
                .unwrap_or_default();

            let layer: CachedLayer = match fs::read(&path)
                .ok()
                .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            {
                Some(layer) => layer,
                None => {
                    warn!(path = %path.display(), "Skipping unreadable layer index entry");
                    continue;
                }
            };

            if !store.exists(&layer.digest) {
                debug!(key = %key, digest = %layer.digest, "Layer blob missing, dropping index entry");
                continue;
            }

            layers.insert(key, Arc::new(OnceCell::new_with(Some(layer))));
        }

        info!(dir = %root.display(), count = layers.len(), "Opened layer cache");

        Ok(Self {
            store,
            index_dir,
            layers: Mutex::new(layers),
            stats: CacheStats::default(),
        })
    }

    /// Blob store shared by built layers and pulled base-image blobs.
    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Whether a built layer is recorded for `key`.
    pub async fn contains(&self, key: &str) -> bool {
        let layers = self.layers.lock().await;
        layers
            .get(key)
            .map(|cell| cell.initialized())
            .unwrap_or(false)
    }

    /// Return the layer for `key`, running `build` only if no layer is
    /// cached and no other task is already building it.
    pub async fn get_or_build<F, Fut, E>(&self, key: &str, build: F) -> Result<CachedLayer, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedLayer, E>>,
    {
        let cell = {
            let mut layers = self.layers.lock().await;
            layers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let built = AtomicBool::new(false);
        let flag = &built;
        let result = cell
            .get_or_try_init(|| async move {
                flag.store(true, Ordering::Relaxed);
                let layer = build().await?;
                self.persist(key, &layer);
                Ok(layer)
            })
            .await
            .cloned();

        match (&result, built.load(Ordering::Relaxed)) {
            (Ok(layer), false) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, digest = %layer.digest, "Layer cache hit");
            }
            (Ok(_), true) => {
                self.stats.builds.fetch_add(1, Ordering::Relaxed);
            }
            (Err(_), _) => {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        result
    }

    fn persist(&self, key: &str, layer: &CachedLayer) {
        let path = self.index_dir.join(format!("{}.json", key.replace(':', "_")));
        let written = serde_json::to_vec_pretty(layer)
            .map_err(io::Error::other)
            .and_then(|bytes| fs::write(&path, bytes));

        if let Err(e) = written {
            warn!(key = %key, error = %e, "Failed to persist layer index entry");
        }
    }
}
