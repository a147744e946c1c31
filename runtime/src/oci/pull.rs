//! Cache-first base image resolution.
//!
//! Images are looked up in the local store first; if not found they are
//! pulled from the registry and stored locally before being loaded.

use std::sync::Arc;

use a3s_bake_core::error::{BakeError, Result};

use super::image::OciImage;
use super::reference::ImageReference;
use super::registry::RegistryPuller;
use super::store::ImageStore;

/// High-level image puller backed by the local store.
pub struct ImagePuller {
    store: Arc<ImageStore>,
    puller: RegistryPuller,
}

impl ImagePuller {
    /// Create a new image puller.
    pub fn new(store: Arc<ImageStore>, insecure_registries: &[String]) -> Self {
        Self {
            store,
            puller: RegistryPuller::new(insecure_registries),
        }
    }

    /// Resolve an image, using the local store if it already holds it.
    pub async fn pull(&self, reference: &str) -> Result<OciImage> {
        let parsed = ImageReference::parse(reference)?;
        let full_ref = parsed.full_reference();

        if let Some(stored) = self.store.get(&full_ref).await {
            tracing::info!(
                reference = %full_ref,
                digest = %stored.digest,
                "Using cached image"
            );
            return OciImage::from_path(&stored.path);
        }

        self.pull_and_store(&parsed).await
    }

    /// Pull from the registry into a scratch directory, then move into the store.
    async fn pull_and_store(&self, reference: &ImageReference) -> Result<OciImage> {
        let full_ref = reference.full_reference();

        let tmp_root = self.store.store_dir().join("tmp");
        std::fs::create_dir_all(&tmp_root).map_err(|e| {
            BakeError::OciImageError(format!(
                "Failed to create temp directory {}: {}",
                tmp_root.display(),
                e
            ))
        })?;
        let tmp_dir = tempfile::TempDir::new_in(&tmp_root).map_err(|e| {
            BakeError::OciImageError(format!("Failed to create pull directory: {}", e))
        })?;

        let digest = self.puller.pull(reference, tmp_dir.path()).await?;
        let stored = self.store.put(&full_ref, &digest, tmp_dir.path()).await?;

        OciImage::from_path(&stored.path)
    }
}
