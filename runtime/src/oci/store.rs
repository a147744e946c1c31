//! Disk-based local image store.
//!
//! Stores OCI image layouts on disk under `sha256/<manifest digest>/`, with an
//! in-memory index backed by a persistent `index.json` file. The store is the
//! cache for base images and the `containers-storage:` commit target.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use a3s_bake_core::error::{BakeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Metadata for a stored OCI image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredImage {
    /// Image reference string (e.g., "localhost:5000/graph-image:latest")
    pub reference: String,
    /// Manifest digest (e.g., "sha256:abc123...")
    pub digest: String,
    /// Total size in bytes
    pub size_bytes: u64,
    /// When the image entered the store
    pub stored_at: DateTime<Utc>,
    /// Path to the OCI image layout on disk
    pub path: PathBuf,
}

/// Persistent index stored as JSON on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    images: Vec<StoredImage>,
}

/// Disk-based image store with an in-memory index.
pub struct ImageStore {
    /// Root directory for image storage
    store_dir: PathBuf,
    /// In-memory index: reference → StoredImage
    index: Arc<RwLock<HashMap<String, StoredImage>>>,
}

impl ImageStore {
    /// Open the image store rooted at `store_dir`.
    ///
    /// Creates the directory if it doesn't exist and loads any existing
    /// index from disk. Entries whose layout directory vanished are dropped.
    pub fn open(store_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(store_dir).map_err(|e| {
            BakeError::OciImageError(format!(
                "Failed to create image store directory {}: {}",
                store_dir.display(),
                e
            ))
        })?;

        let index = Self::load_index(store_dir)?;
        tracing::debug!(
            store = %store_dir.display(),
            images = index.len(),
            "Opened image store"
        );

        Ok(Self {
            store_dir: store_dir.to_path_buf(),
            index: Arc::new(RwLock::new(index)),
        })
    }

    /// Flush the index to disk and release the store.
    pub async fn close(self) -> Result<()> {
        self.save_index().await?;
        tracing::debug!(store = %self.store_dir.display(), "Closed image store");
        Ok(())
    }

    /// Get a stored image by reference.
    pub async fn get(&self, reference: &str) -> Option<StoredImage> {
        self.index.read().await.get(reference).cloned()
    }

    /// Store an image from a source layout directory.
    ///
    /// Copies the layout into `sha256/<digest>/` through a staging directory
    /// that is renamed into place once complete, then records `reference`.
    /// The reference is only indexed after the copy succeeded.
    pub async fn put(&self, reference: &str, digest: &str, source_dir: &Path) -> Result<StoredImage> {
        let digest_hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        let target_dir = self.store_dir.join("sha256").join(digest_hex);

        if !target_dir.exists() {
            let staging_dir = self.store_dir.join("sha256").join(format!("{}.partial", digest_hex));
            if staging_dir.exists() {
                std::fs::remove_dir_all(&staging_dir).map_err(|e| {
                    BakeError::OciImageError(format!(
                        "Failed to clean staging directory {}: {}",
                        staging_dir.display(),
                        e
                    ))
                })?;
            }

            let copied = copy_dir_recursive(source_dir, &staging_dir)
                .and_then(|()| std::fs::rename(&staging_dir, &target_dir));
            if let Err(e) = copied {
                let _ = std::fs::remove_dir_all(&staging_dir);
                return Err(BakeError::OciImageError(format!(
                    "Failed to copy image to store: {}",
                    e
                )));
            }
        }

        let stored = StoredImage {
            reference: reference.to_string(),
            digest: digest.to_string(),
            size_bytes: dir_size(&target_dir),
            stored_at: Utc::now(),
            path: target_dir,
        };

        self.index
            .write()
            .await
            .insert(reference.to_string(), stored.clone());
        self.save_index().await?;

        tracing::debug!(
            reference = %reference,
            digest = %digest,
            size = stored.size_bytes,
            "Stored image"
        );

        Ok(stored)
    }

    /// Remove an image by reference.
    ///
    /// The layout directory is deleted once no other reference points to it.
    pub async fn remove(&self, reference: &str) -> Result<()> {
        let mut index = self.index.write().await;
        let image = index.remove(reference).ok_or_else(|| {
            BakeError::OciImageError(format!("Image not found: {}", reference))
        })?;
        let digest_still_used = index.values().any(|img| img.digest == image.digest);
        drop(index);

        if !digest_still_used && image.path.exists() {
            std::fs::remove_dir_all(&image.path).map_err(|e| {
                BakeError::OciImageError(format!(
                    "Failed to remove image directory {}: {}",
                    image.path.display(),
                    e
                ))
            })?;
        }

        self.save_index().await
    }

    /// List all stored images.
    pub async fn list(&self) -> Vec<StoredImage> {
        self.index.read().await.values().cloned().collect()
    }

    /// Get the store directory path.
    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    fn load_index(store_dir: &Path) -> Result<HashMap<String, StoredImage>> {
        let index_path = store_dir.join("index.json");
        if !index_path.exists() {
            return Ok(HashMap::new());
        }

        let data = std::fs::read_to_string(&index_path).map_err(|e| {
            BakeError::OciImageError(format!(
                "Failed to read image store index {}: {}",
                index_path.display(),
                e
            ))
        })?;

        let store_index: StoreIndex = serde_json::from_str(&data).map_err(|e| {
            BakeError::OciImageError(format!("Failed to parse image store index: {}", e))
        })?;

        Ok(store_index
            .images
            .into_iter()
            .filter(|image| image.path.exists())
            .map(|image| (image.reference.clone(), image))
            .collect())
    }

    async fn save_index(&self) -> Result<()> {
        let store_index = StoreIndex {
            images: self.index.read().await.values().cloned().collect(),
        };

        let data = serde_json::to_string_pretty(&store_index)?;
        let index_path = self.store_dir.join("index.json");

        tokio::fs::write(&index_path, data).await.map_err(|e| {
            BakeError::OciImageError(format!(
                "Failed to write image store index {}: {}",
                index_path.display(),
                e
            ))
        })
    }
}

/// Recursively copy a directory.
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Calculate total size of a directory recursively.
fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                total += dir_size(&path);
            } else if let Ok(meta) = path.metadata() {
                total += meta.len();
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_oci_layout(dir: &Path) {
        std::fs::create_dir_all(dir.join("blobs/sha256")).unwrap();
        std::fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
        std::fs::write(dir.join("index.json"), r#"{"manifests":[]}"#).unwrap();
        std::fs::write(dir.join("blobs/sha256/testblob"), "x".repeat(1024)).unwrap();
    }

    #[tokio::test]
    async fn test_open_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("images");
        let store = ImageStore::open(&store_dir).unwrap();
        assert!(store_dir.exists());
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let source_dir = tmp.path().join("source");
        create_test_oci_layout(&source_dir);

        let store = ImageStore::open(&store_dir).unwrap();
        let stored = store
            .put("localhost/graph-image:latest", "sha256:abc123", &source_dir)
            .await
            .unwrap();

        assert_eq!(stored.digest, "sha256:abc123");
        assert!(stored.size_bytes >= 1024);
        assert!(stored.path.join("blobs/sha256/testblob").exists());
        assert!(!store_dir.join("sha256/abc123.partial").exists());

        let fetched = store.get("localhost/graph-image:latest").await.unwrap();
        assert_eq!(fetched.digest, "sha256:abc123");
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::open(tmp.path()).unwrap();
        assert!(store.get("nonexistent").await.is_none());
    }

    #[tokio::test]
    async fn test_put_missing_source_leaves_nothing() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let store = ImageStore::open(&store_dir).unwrap();

        let result = store
            .put("graph-image:latest", "sha256:missing", &tmp.path().join("absent"))
            .await;

        assert!(result.is_err());
        assert!(store.get("graph-image:latest").await.is_none());
        assert!(!store_dir.join("sha256/missing").exists());
        assert!(!store_dir.join("sha256/missing.partial").exists());
    }

    #[tokio::test]
    async fn test_remove_keeps_shared_digest() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let source_dir = tmp.path().join("source");
        create_test_oci_layout(&source_dir);

        let store = ImageStore::open(&store_dir).unwrap();
        let first = store.put("graph-image:a", "sha256:same", &source_dir).await.unwrap();
        store.put("graph-image:b", "sha256:same", &source_dir).await.unwrap();

        store.remove("graph-image:a").await.unwrap();
        assert!(store.get("graph-image:a").await.is_none());
        assert!(first.path.exists());

        store.remove("graph-image:b").await.unwrap();
        assert!(!first.path.exists());
    }

    #[tokio::test]
    async fn test_remove_nonexistent() {
        let tmp = TempDir::new().unwrap();
        let store = ImageStore::open(tmp.path()).unwrap();
        assert!(store.remove("nonexistent").await.is_err());
    }

    #[tokio::test]
    async fn test_list() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let source_dir = tmp.path().join("source");
        create_test_oci_layout(&source_dir);

        let store = ImageStore::open(&store_dir).unwrap();
        store.put("graph-image:a", "sha256:aaa", &source_dir).await.unwrap();
        store.put("graph-image:b", "sha256:bbb", &source_dir).await.unwrap();

        assert_eq!(store.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_index_persists_across_close() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let source_dir = tmp.path().join("source");
        create_test_oci_layout(&source_dir);

        let store = ImageStore::open(&store_dir).unwrap();
        store
            .put("graph-image:latest", "sha256:persist", &source_dir)
            .await
            .unwrap();
        store.close().await.unwrap();

        let store = ImageStore::open(&store_dir).unwrap();
        let image = store.get("graph-image:latest").await.unwrap();
        assert_eq!(image.digest, "sha256:persist");
    }

    #[tokio::test]
    async fn test_open_drops_vanished_layouts() {
        let tmp = TempDir::new().unwrap();
        let store_dir = tmp.path().join("store");
        let source_dir = tmp.path().join("source");
        create_test_oci_layout(&source_dir);

        let store = ImageStore::open(&store_dir).unwrap();
        let stored = store.put("graph-image:latest", "sha256:gone", &source_dir).await.unwrap();
        store.close().await.unwrap();
        std::fs::remove_dir_all(&stored.path).unwrap();

        let store = ImageStore::open(&store_dir).unwrap();
        assert!(store.get("graph-image:latest").await.is_none());
    }
}
