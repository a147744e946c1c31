//! OCI registry client for pulling base images and pushing built images.
//!
//! Uses the `oci-distribution` crate. All registry traffic is anonymous;
//! registries listed as insecure are reached over plain HTTP.

use std::path::Path;

use a3s_bake_core::error::{BakeError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer, PushResponse};
use oci_distribution::manifest::{ImageIndexEntry, OciImageManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};

use super::image::{blob_path, MANIFEST_MEDIA_TYPE, OCI_LAYOUT_MARKER};
use super::reference::ImageReference;

/// Build a client configuration for the given insecure registries.
fn client_config(insecure_registries: &[String]) -> ClientConfig {
    let protocol = if insecure_registries.is_empty() {
        ClientProtocol::Https
    } else {
        ClientProtocol::HttpsExcept(insecure_registries.to_vec())
    };
    ClientConfig {
        protocol,
        platform_resolver: Some(Box::new(linux_platform_resolver)),
        ..Default::default()
    }
}

/// Convert an ImageReference to an oci-distribution Reference.
fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = match (&reference.digest, &reference.tag) {
        (Some(digest), _) => format!("{}/{}@{}", reference.registry, reference.repository, digest),
        (None, Some(tag)) => format!("{}/{}:{}", reference.registry, reference.repository, tag),
        (None, None) => format!("{}/{}:latest", reference.registry, reference.repository),
    };

    ref_str.parse::<Reference>().map_err(|e| {
        BakeError::OciImageError(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

/// Pulls OCI images from container registries.
pub struct RegistryPuller {
    client: Client,
}

impl RegistryPuller {
    /// Create a registry puller; `insecure_registries` are contacted over HTTP.
    pub fn new(insecure_registries: &[String]) -> Self {
        Self {
            client: Client::new(client_config(insecure_registries)),
        }
    }

    /// Pull an image and write it as an OCI image layout to `target_dir`.
    ///
    /// Returns the manifest digest.
    pub async fn pull(&self, reference: &ImageReference, target_dir: &Path) -> Result<String> {
        let oci_ref = to_oci_reference(reference)?;
        let registry_error = |message: String| BakeError::RegistryError {
            registry: reference.registry.clone(),
            message,
        };

        tracing::info!(
            reference = %reference,
            target = %target_dir.display(),
            "Pulling image from registry"
        );

        let blobs_dir = target_dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir)
            .map_err(|e| registry_error(format!("Failed to create blobs directory: {}", e)))?;

        // Multi-arch indexes resolve to the host platform
        let (image_manifest, manifest_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &RegistryAuth::Anonymous)
            .await
            .map_err(|e| registry_error(format!("Failed to pull manifest: {}", e)))?;

        let manifest_json = serde_json::to_vec(&image_manifest)?;
        std::fs::write(blob_path(target_dir, &manifest_digest), &manifest_json)
            .map_err(|e| registry_error(format!("Failed to write manifest: {}", e)))?;

        let descriptors = std::iter::once(&image_manifest.config).chain(image_manifest.layers.iter());
        for descriptor in descriptors {
            tracing::debug!(
                digest = %descriptor.digest,
                size = descriptor.size,
                "Pulling blob"
            );

            let mut data: Vec<u8> = Vec::new();
            self.client
                .pull_blob(&oci_ref, descriptor, &mut data)
                .await
                .map_err(|e| {
                    registry_error(format!("Failed to pull blob {}: {}", descriptor.digest, e))
                })?;
            std::fs::write(blob_path(target_dir, &descriptor.digest), &data).map_err(|e| {
                registry_error(format!("Failed to write blob {}: {}", descriptor.digest, e))
            })?;
        }

        std::fs::write(target_dir.join("oci-layout"), OCI_LAYOUT_MARKER)
            .map_err(|e| registry_error(format!("Failed to write oci-layout: {}", e)))?;

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": MANIFEST_MEDIA_TYPE,
                "digest": manifest_digest,
                "size": manifest_json.len()
            }]
        });
        std::fs::write(target_dir.join("index.json"), serde_json::to_string_pretty(&index)?)
            .map_err(|e| registry_error(format!("Failed to write index.json: {}", e)))?;

        tracing::info!(
            reference = %reference,
            digest = %manifest_digest,
            "Image pulled successfully"
        );

        Ok(manifest_digest)
    }
}

/// Result of a successful image push.
#[derive(Debug, Clone)]
pub struct PushResult {
    /// URL of the pushed config blob.
    pub config_url: String,
    /// URL of the pushed manifest.
    pub manifest_url: String,
}

/// Pushes OCI images to container registries.
pub struct RegistryPusher {
    client: Client,
}

impl RegistryPusher {
    /// Create a registry pusher; `insecure_registries` are contacted over HTTP.
    pub fn new(insecure_registries: &[String]) -> Self {
        Self {
            client: Client::new(client_config(insecure_registries)),
        }
    }

    /// Push a local OCI image layout to a registry.
    ///
    /// Reads the layout from `image_dir` (index.json → manifest → config + layers),
    /// then pushes all blobs and the manifest to the target reference.
    pub async fn push(&self, reference: &ImageReference, image_dir: &Path) -> Result<PushResult> {
        let oci_ref = to_oci_reference(reference)?;

        tracing::info!(
            reference = %reference,
            source = %image_dir.display(),
            "Pushing image to registry"
        );

        let read = |digest: &str, what: &str| {
            std::fs::read(blob_path(image_dir, digest)).map_err(|e| {
                BakeError::OciImageError(format!("Failed to read {} blob {}: {}", what, digest, e))
            })
        };

        let index_path = image_dir.join("index.json");
        let index_data = std::fs::read_to_string(&index_path).map_err(|e| {
            BakeError::OciImageError(format!("Failed to read index.json: {}", e))
        })?;
        let index: serde_json::Value = serde_json::from_str(&index_data)?;
        let manifest_digest = index["manifests"][0]["digest"].as_str().ok_or_else(|| {
            BakeError::OciImageError("No manifest digest in index.json".to_string())
        })?;

        let manifest: OciImageManifest = serde_json::from_slice(&read(manifest_digest, "manifest")?)?;

        let config = Config::new(
            read(&manifest.config.digest, "config")?,
            manifest.config.media_type.clone(),
            None,
        );

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for layer_desc in &manifest.layers {
            let layer_data = read(&layer_desc.digest, "layer")?;
            tracing::debug!(
                digest = %layer_desc.digest,
                size = layer_data.len(),
                "Read layer for push"
            );
            layers.push(ImageLayer::new(layer_data, layer_desc.media_type.clone(), None));
        }

        let response: PushResponse = self
            .client
            .push(&oci_ref, &layers, config, &RegistryAuth::Anonymous, Some(manifest))
            .await
            .map_err(|e| BakeError::RegistryError {
                registry: reference.registry.clone(),
                message: format!("Failed to push image: {}", e),
            })?;

        tracing::info!(
            reference = %reference,
            manifest_url = %response.manifest_url,
            "Image pushed successfully"
        );

        Ok(PushResult {
            config_url: response.config_url,
            manifest_url: response.manifest_url,
        })
    }
}

/// Map the host CPU to its OCI architecture name.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Platform resolver that selects the linux entry for the host architecture.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = host_architecture();
    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
