//! OCI image layout loading.
//!
//! A base image is read back from an OCI image layout on disk (as written by
//! the registry puller or by a commit) so its layers and configuration can be
//! carried into a new image.

use std::path::{Path, PathBuf};

use a3s_bake_core::error::{BakeError, Result};
use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};

/// Media type of gzip-compressed layer blobs.
pub const LAYER_MEDIA_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Media type of image manifests.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type of image configuration blobs.
pub const CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// Contents of the `oci-layout` marker file.
pub const OCI_LAYOUT_MARKER: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// An OCI image loaded from an image layout directory.
#[derive(Debug)]
pub struct OciImage {
    /// Root directory of the OCI image layout
    root_dir: PathBuf,

    /// Digest of the manifest selected from index.json
    manifest_digest: String,

    /// Image manifest
    manifest: ImageManifest,

    /// Typed image configuration
    config: ImageConfiguration,

    /// Raw image configuration, kept so unknown fields survive a rebuild
    raw_config: serde_json::Value,
}

/// A compressed layer blob belonging to a loaded image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerBlob {
    /// Path to the blob inside the layout
    pub path: PathBuf,
    /// Digest with algorithm prefix
    pub digest: String,
    /// Media type recorded in the manifest
    pub media_type: String,
    /// Size in bytes recorded in the manifest
    pub size: u64,
}

impl OciImage {
    /// Load an OCI image from a layout directory.
    ///
    /// The directory must contain `oci-layout`, `index.json` and
    /// `blobs/<algorithm>/` with the manifest, config and layer blobs.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let root_dir = path.as_ref().to_path_buf();

        Self::validate_oci_layout(&root_dir)?;

        let index = Self::load_index(&root_dir)?;
        let manifest_digest = index
            .manifests()
            .first()
            .ok_or_else(|| {
                BakeError::OciImageError(format!(
                    "No manifests in index.json at {}",
                    root_dir.display()
                ))
            })?
            .digest()
            .to_string();

        let manifest: ImageManifest =
            serde_json::from_slice(&Self::read_blob(&root_dir, &manifest_digest, "manifest")?)
                .map_err(|e| BakeError::OciImageError(format!("Failed to parse manifest: {}", e)))?;

        let config_digest = manifest.config().digest().to_string();
        let config_bytes = Self::read_blob(&root_dir, &config_digest, "config")?;
        let config: ImageConfiguration = serde_json::from_slice(&config_bytes)
            .map_err(|e| BakeError::OciImageError(format!("Failed to parse config: {}", e)))?;
        let raw_config: serde_json::Value = serde_json::from_slice(&config_bytes)?;

        Ok(Self {
            root_dir,
            manifest_digest,
            manifest,
            config,
            raw_config,
        })
    }

    /// Get the root directory of the image layout.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Get the manifest digest (with algorithm prefix).
    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    /// Get the image manifest.
    pub fn manifest(&self) -> &ImageManifest {
        &self.manifest
    }

    /// Get the typed image configuration.
    pub fn configuration(&self) -> &ImageConfiguration {
        &self.config
    }

    /// Get the image configuration as raw JSON.
    pub fn raw_config(&self) -> &serde_json::Value {
        &self.raw_config
    }

    /// Layer blobs in order, bottom to top.
    pub fn layers(&self) -> Vec<LayerBlob> {
        self.manifest
            .layers()
            .iter()
            .map(|layer| LayerBlob {
                path: blob_path(&self.root_dir, layer.digest()),
                digest: layer.digest().to_string(),
                media_type: layer.media_type().to_string(),
                size: layer.size().max(0) as u64,
            })
            .collect()
    }

    /// Uncompressed layer digests from the config's rootfs section.
    pub fn diff_ids(&self) -> &[String] {
        self.config.rootfs().diff_ids()
    }

    /// Get the default command, if set.
    pub fn cmd(&self) -> Option<&[String]> {
        self.config
            .config()
            .as_ref()
            .and_then(|c| c.cmd().as_deref())
    }

    /// Get environment variables as `KEY=VALUE` strings.
    pub fn env(&self) -> &[String] {
        self.config
            .config()
            .as_ref()
            .and_then(|c| c.env().as_deref())
            .unwrap_or_default()
    }

    /// Validate that the directory contains an OCI layout.
    fn validate_oci_layout(root_dir: &Path) -> Result<()> {
        for required in ["oci-layout", "index.json", "blobs"] {
            if !root_dir.join(required).exists() {
                return Err(BakeError::OciImageError(format!(
                    "Not a valid OCI layout: missing {} in {}",
                    required,
                    root_dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Load the image index from index.json.
    fn load_index(root_dir: &Path) -> Result<ImageIndex> {
        let index_path = root_dir.join("index.json");
        let content = std::fs::read_to_string(&index_path).map_err(|e| {
            BakeError::OciImageError(format!(
                "Failed to read index.json at {}: {}",
                index_path.display(),
                e
            ))
        })?;

        serde_json::from_str(&content)
            .map_err(|e| BakeError::OciImageError(format!("Failed to parse index.json: {}", e)))
    }

    fn read_blob(root_dir: &Path, digest: &str, what: &str) -> Result<Vec<u8>> {
        let path = blob_path(root_dir, digest);
        std::fs::read(&path).map_err(|e| {
            BakeError::OciImageError(format!(
                "Failed to read {} at {}: {}",
                what,
                path.display(),
                e
            ))
        })
    }
}

/// Get the path to a blob by digest.
///
/// Digests without an algorithm prefix are assumed to be sha256.
pub fn blob_path(root_dir: &Path, digest: &str) -> PathBuf {
    let (algorithm, hash) = digest.split_once(':').unwrap_or(("sha256", digest));
    root_dir.join("blobs").join(algorithm).join(hash)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::oci::layer::sha256_bytes;
    use std::fs;
    use tempfile::TempDir;

    /// Write a single-layer OCI image layout and return the config digest.
    pub(crate) fn write_test_image(path: &Path, cmd: &[&str]) -> String {
        let blobs = path.join("blobs/sha256");
        fs::create_dir_all(&blobs).unwrap();
        fs::write(path.join("oci-layout"), OCI_LAYOUT_MARKER).unwrap();

        let layer = test_layer_bytes();
        let layer_digest = sha256_bytes(&layer);
        fs::write(blobs.join(&layer_digest), &layer).unwrap();

        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Cmd": cmd,
                "Env": ["PATH=/usr/local/bin:/usr/bin:/bin"],
                "WorkingDir": "/"
            },
            "rootfs": {
                "type": "layers",
                "diff_ids": ["sha256:1111111111111111111111111111111111111111111111111111111111111111"]
            },
            "history": [{"created_by": "base layer"}]
        });
        let config_bytes = serde_json::to_vec(&config).unwrap();
        let config_digest = sha256_bytes(&config_bytes);
        fs::write(blobs.join(&config_digest), &config_bytes).unwrap();

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": CONFIG_MEDIA_TYPE,
                "digest": format!("sha256:{}", config_digest),
                "size": config_bytes.len()
            },
            "layers": [{
                "mediaType": LAYER_MEDIA_TYPE,
                "digest": format!("sha256:{}", layer_digest),
                "size": layer.len()
            }]
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let manifest_digest = sha256_bytes(&manifest_bytes);
        fs::write(blobs.join(&manifest_digest), &manifest_bytes).unwrap();

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": MANIFEST_MEDIA_TYPE,
                "digest": format!("sha256:{}", manifest_digest),
                "size": manifest_bytes.len()
            }]
        });
        fs::write(path.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();

        format!("sha256:{}", config_digest)
    }

    fn test_layer_bytes() -> Vec<u8> {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(5);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "etc/hostname", b"bake\n" as &[u8])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn test_validate_oci_layout_missing_parts() {
        let temp_dir = TempDir::new().unwrap();

        let err = OciImage::validate_oci_layout(temp_dir.path()).unwrap_err();
        assert!(err.to_string().contains("oci-layout"));

        fs::write(temp_dir.path().join("oci-layout"), OCI_LAYOUT_MARKER).unwrap();
        let err = OciImage::validate_oci_layout(temp_dir.path()).unwrap_err();
        assert!(err.to_string().contains("index.json"));

        fs::write(temp_dir.path().join("index.json"), "{}").unwrap();
        let err = OciImage::validate_oci_layout(temp_dir.path()).unwrap_err();
        assert!(err.to_string().contains("blobs"));

        fs::create_dir_all(temp_dir.path().join("blobs/sha256")).unwrap();
        assert!(OciImage::validate_oci_layout(temp_dir.path()).is_ok());
    }

    #[test]
    fn test_blob_path() {
        let root = PathBuf::from("/images/test");
        assert_eq!(
            blob_path(&root, "sha256:abc123"),
            PathBuf::from("/images/test/blobs/sha256/abc123")
        );
        assert_eq!(
            blob_path(&root, "abc123"),
            PathBuf::from("/images/test/blobs/sha256/abc123")
        );
    }

    #[test]
    fn test_from_path_valid_image() {
        let temp_dir = TempDir::new().unwrap();
        write_test_image(temp_dir.path(), &["/bin/bash"]);

        let image = OciImage::from_path(temp_dir.path()).unwrap();

        assert_eq!(image.cmd(), Some(&["/bin/bash".to_string()][..]));
        assert!(image.env().iter().any(|e| e.starts_with("PATH=")));
        assert_eq!(image.diff_ids().len(), 1);
        assert!(image.manifest_digest().starts_with("sha256:"));

        let layers = image.layers();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].media_type, LAYER_MEDIA_TYPE);
        assert!(layers[0].path.exists());
        assert_eq!(fs::metadata(&layers[0].path).unwrap().len(), layers[0].size);

        assert_eq!(image.raw_config()["history"][0]["created_by"], "base layer");
    }

    #[test]
    fn test_from_path_nonexistent() {
        assert!(OciImage::from_path("/nonexistent/path").is_err());
    }

    #[test]
    fn test_from_path_empty_index() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("blobs/sha256")).unwrap();
        fs::write(temp_dir.path().join("oci-layout"), OCI_LAYOUT_MARKER).unwrap();
        fs::write(
            temp_dir.path().join("index.json"),
            r#"{"schemaVersion":2,"manifests":[]}"#,
        )
        .unwrap();

        let err = OciImage::from_path(temp_dir.path()).unwrap_err();
        assert!(err.to_string().contains("No manifests"));
    }
}
