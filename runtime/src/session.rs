//! Build session: one working container derived from a base image.
//!
//! A session starts from a base image (or `scratch`), gains filesystem layers
//! and metadata, and is consumed by [`BuildSession::commit`], which writes a
//! complete OCI image layout and publishes it to a [`Destination`].

use std::path::{Path, PathBuf};

use a3s_bake_core::config::Ownership;
use a3s_bake_core::error::{BakeError, Result};
use tempfile::TempDir;
use uuid::Uuid;

use crate::archive::{ExtractedEntry, ExtractedTree};
use crate::oci::layer::sha256_bytes;
use crate::oci::store::copy_dir_recursive;
use crate::oci::{
    create_layer_from_dir, create_layer_from_entries, host_architecture, Destination, ImagePuller,
    ImageStore, LayerInfo, OciImage, RegistryPusher, CONFIG_MEDIA_TYPE, LAYER_MEDIA_TYPE,
    MANIFEST_MEDIA_TYPE, OCI_LAYOUT_MARKER,
};

/// Base image name that denotes an empty image.
pub const SCRATCH_IMAGE: &str = "scratch";

/// Annotation carrying the tag of an image in an OCI layout index.
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Options for starting a build session.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Base image reference, or `scratch`
    pub from_image: String,
    /// Capabilities granted to the build
    pub capabilities: Vec<String>,
    /// Parent directory for the session's private work directory
    pub work_dir: Option<PathBuf>,
}

/// Content to inject as a layer.
#[derive(Debug)]
pub enum LayerPayload {
    /// A tree extracted on disk
    Tree(ExtractedTree),
    /// Archive entries held in memory, in archive order
    Entries(Vec<ExtractedEntry>),
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    /// Image ID (config digest, `sha256:<hex>`)
    pub image_id: String,
    /// Manifest digest (`sha256:<hex>`)
    pub manifest_digest: String,
    /// Destination the image was committed to
    pub destination: String,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    created_by: String,
    empty_layer: bool,
}

/// A working container.
pub struct BuildSession {
    id: String,
    from_image: String,
    base: Option<OciImage>,
    capabilities: Vec<String>,
    layers: Vec<LayerInfo>,
    history: Vec<HistoryEntry>,
    cmd: Option<Vec<String>>,
    work_dir: TempDir,
}

impl BuildSession {
    /// Start a session from `options.from_image`, resolved cache-first.
    pub async fn from_image(puller: &ImagePuller, options: BuildOptions) -> Result<Self> {
        let image = options.from_image.trim().to_string();
        let resolution_error = |message: String| BakeError::ImageResolutionError {
            image: image.clone(),
            message,
        };

        let base = if image == SCRATCH_IMAGE {
            None
        } else {
            Some(
                puller
                    .pull(&image)
                    .await
                    .map_err(|e| resolution_error(e.to_string()))?,
            )
        };

        let mut builder = tempfile::Builder::new();
        builder.prefix("a3s-bake-session-");
        let work_dir = match &options.work_dir {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|e| resolution_error(format!("Failed to create session directory: {}", e)))?;

        let id = Uuid::new_v4().to_string();
        tracing::info!(
            session = %id,
            image = %image,
            capabilities = ?options.capabilities,
            "Started build session"
        );

        Ok(Self {
            id,
            from_image: image,
            base,
            capabilities: options.capabilities,
            layers: Vec::new(),
            history: Vec::new(),
            cmd: None,
            work_dir,
        })
    }

    /// Session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Base image the session started from.
    pub fn base_image(&self) -> &str {
        &self.from_image
    }

    /// Capabilities recorded for the build.
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Layers added in this session, bottom to top.
    pub fn layers(&self) -> &[LayerInfo] {
        &self.layers
    }

    /// Pending default command.
    pub fn cmd(&self) -> Option<&[String]> {
        self.cmd.as_deref()
    }

    /// Add `payload` as a new layer rooted at `dest_path`, owned by `owner`.
    ///
    /// The layer is attached only once fully written; on failure the
    /// session is unchanged.
    pub fn add_layer(
        &mut self,
        payload: &LayerPayload,
        dest_path: &Path,
        owner: Ownership,
    ) -> Result<&LayerInfo> {
        match payload {
            LayerPayload::Tree(tree) => self.add_layer_from_dir(tree.root(), dest_path, owner),
            LayerPayload::Entries(entries) => {
                self.add_layer_from_entries(entries, dest_path, owner)
            }
        }
    }

    /// Add the contents of a directory as a new layer.
    pub fn add_layer_from_dir(
        &mut self,
        src_dir: &Path,
        dest_path: &Path,
        owner: Ownership,
    ) -> Result<&LayerInfo> {
        let output = self.next_layer_path(dest_path)?;
        let info = create_layer_from_dir(src_dir, dest_path, owner, &output);
        self.attach_layer(
            info,
            &output,
            format!("ADD dir:{} in {}", src_dir.display(), dest_path.display()),
        )
    }

    /// Add in-memory archive entries as a new layer.
    pub fn add_layer_from_entries(
        &mut self,
        entries: &[ExtractedEntry],
        dest_path: &Path,
        owner: Ownership,
    ) -> Result<&LayerInfo> {
        let output = self.next_layer_path(dest_path)?;
        let info = create_layer_from_entries(entries, dest_path, owner, &output);
        self.attach_layer(
            info,
            &output,
            format!("ADD file:{} entries in {}", entries.len(), dest_path.display()),
        )
    }

    /// Set the default command of the image.
    pub fn set_cmd(&mut self, cmd: Vec<String>) -> Result<()> {
        match cmd.first() {
            None => return Err(BakeError::ConfigError("Command must not be empty".to_string())),
            Some(program) if program.trim().is_empty() => {
                return Err(BakeError::ConfigError(
                    "Command program must not be empty".to_string(),
                ))
            }
            Some(_) => {}
        }

        tracing::debug!(session = %self.id, cmd = ?cmd, "Set default command");
        self.history.push(HistoryEntry {
            created_by: format!("CMD {:?}", cmd),
            empty_layer: true,
        });
        self.cmd = Some(cmd);
        Ok(())
    }

    /// Commit the session to `destination`, consuming it.
    ///
    /// The image layout is fully written to the session directory before it
    /// is published, so nothing is addressable at the destination on failure.
    pub async fn commit(
        self,
        destination: &Destination,
        store: &ImageStore,
        pusher: &RegistryPusher,
    ) -> Result<CommitResult> {
        let commit_error = |message: String| BakeError::CommitError {
            destination: destination.to_string(),
            message,
        };

        tracing::info!(
            session = %self.id,
            destination = %destination,
            layers = self.layers.len(),
            "Committing image"
        );

        let layout_dir = self.work_dir.path().join("image");
        let tag = match destination {
            Destination::OciLayout { tag, .. } => tag.clone(),
            Destination::Registry(r) | Destination::LocalStore(r) => r.tag.clone(),
        };
        let (config_digest, manifest_digest) = self
            .assemble_layout(&layout_dir, tag.as_deref())
            .map_err(|e| commit_error(e.to_string()))?;

        match destination {
            Destination::LocalStore(reference) => {
                store
                    .put(&reference.full_reference(), &manifest_digest, &layout_dir)
                    .await
                    .map_err(|e| commit_error(e.to_string()))?;
            }
            Destination::OciLayout { path, .. } => {
                publish_layout(&layout_dir, path).map_err(commit_error)?;
            }
            Destination::Registry(reference) => {
                pusher
                    .push(reference, &layout_dir)
                    .await
                    .map_err(|e| commit_error(e.to_string()))?;
            }
        }

        tracing::info!(
            session = %self.id,
            image_id = %config_digest,
            destination = %destination,
            "Image committed"
        );

        Ok(CommitResult {
            image_id: config_digest,
            manifest_digest,
            destination: destination.to_string(),
        })
    }

    fn next_layer_path(&self, dest_path: &Path) -> Result<PathBuf> {
        if !dest_path.is_absolute() {
            return Err(BakeError::LayerInjectionError(format!(
                "Layer destination must be absolute: {}",
                dest_path.display()
            )));
        }
        let layers_dir = self.work_dir.path().join("layers");
        std::fs::create_dir_all(&layers_dir).map_err(|e| {
            BakeError::LayerInjectionError(format!(
                "Failed to create layers directory {}: {}",
                layers_dir.display(),
                e
            ))
        })?;
        Ok(layers_dir.join(format!("layer-{}.tar.gz", self.layers.len())))
    }

    fn attach_layer(
        &mut self,
        info: Result<LayerInfo>,
        output: &Path,
        created_by: String,
    ) -> Result<&LayerInfo> {
        let info = info.map_err(|e| {
            let _ = std::fs::remove_file(output);
            match e {
                BakeError::LayerInjectionError(_) => e,
                other => BakeError::LayerInjectionError(other.to_string()),
            }
        })?;

        tracing::info!(
            session = %self.id,
            digest = %info.prefixed_digest(),
            size = info.size,
            "Added layer"
        );

        self.history.push(HistoryEntry {
            created_by,
            empty_layer: false,
        });
        self.layers.push(info);
        Ok(&self.layers[self.layers.len() - 1])
    }

    /// Write the OCI image layout into `output_dir`.
    ///
    /// Returns `(config digest, manifest digest)`, both prefixed.
    fn assemble_layout(&self, output_dir: &Path, tag: Option<&str>) -> Result<(String, String)> {
        let blobs_dir = output_dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs_dir).map_err(|e| {
            BakeError::OciImageError(format!(
                "Failed to create blobs directory {}: {}",
                blobs_dir.display(),
                e
            ))
        })?;

        let mut layer_descriptors = Vec::new();
        let mut diff_ids: Vec<String> = Vec::new();

        if let Some(base) = &self.base {
            for layer in base.layers() {
                let digest_hex = layer.digest.strip_prefix("sha256:").unwrap_or(&layer.digest);
                copy_blob(&layer.path, &blobs_dir.join(digest_hex))?;
                layer_descriptors.push(serde_json::json!({
                    "mediaType": layer.media_type,
                    "digest": layer.digest,
                    "size": layer.size
                }));
            }
            diff_ids.extend(base.diff_ids().iter().cloned());
        }

        for layer in &self.layers {
            copy_blob(&layer.path, &blobs_dir.join(&layer.digest))?;
            layer_descriptors.push(serde_json::json!({
                "mediaType": LAYER_MEDIA_TYPE,
                "digest": layer.prefixed_digest(),
                "size": layer.size
            }));
            diff_ids.push(layer.prefixed_diff_id());
        }

        let config_bytes = serde_json::to_vec_pretty(&self.image_config(diff_ids))?;
        let config_digest = sha256_bytes(&config_bytes);
        write_file(&blobs_dir.join(&config_digest), &config_bytes)?;

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_MEDIA_TYPE,
            "config": {
                "mediaType": CONFIG_MEDIA_TYPE,
                "digest": format!("sha256:{}", config_digest),
                "size": config_bytes.len()
            },
            "layers": layer_descriptors
        });
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        let manifest_digest = sha256_bytes(&manifest_bytes);
        write_file(&blobs_dir.join(&manifest_digest), &manifest_bytes)?;

        let mut manifest_entry = serde_json::json!({
            "mediaType": MANIFEST_MEDIA_TYPE,
            "digest": format!("sha256:{}", manifest_digest),
            "size": manifest_bytes.len()
        });
        if let Some(tag) = tag {
            manifest_entry["annotations"] = serde_json::json!({ REF_NAME_ANNOTATION: tag });
        }
        let index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [manifest_entry]
        });
        write_file(&output_dir.join("index.json"), &serde_json::to_vec_pretty(&index)?)?;
        write_file(&output_dir.join("oci-layout"), OCI_LAYOUT_MARKER.as_bytes())?;

        Ok((
            format!("sha256:{}", config_digest),
            format!("sha256:{}", manifest_digest),
        ))
    }

    /// Image configuration: the base config with this session's changes applied.
    fn image_config(&self, diff_ids: Vec<String>) -> serde_json::Value {
        let now = chrono::Utc::now().to_rfc3339();

        let mut config = match &self.base {
            Some(base) if base.raw_config().is_object() => base.raw_config().clone(),
            _ => serde_json::json!({}),
        };

        if !config["architecture"].is_string() {
            config["architecture"] = serde_json::json!(host_architecture());
        }
        if !config["os"].is_string() {
            config["os"] = serde_json::json!("linux");
        }
        config["created"] = serde_json::json!(now);

        if !config["config"].is_object() {
            config["config"] = serde_json::json!({});
        }
        if let Some(cmd) = &self.cmd {
            config["config"]["Cmd"] = serde_json::json!(cmd);
        }

        config["rootfs"] = serde_json::json!({
            "type": "layers",
            "diff_ids": diff_ids
        });

        let mut history = config["history"].as_array().cloned().unwrap_or_default();
        history.extend(self.history.iter().map(|h| {
            let mut entry = serde_json::json!({
                "created": now,
                "created_by": h.created_by
            });
            if h.empty_layer {
                entry["empty_layer"] = serde_json::json!(true);
            }
            entry
        }));
        config["history"] = serde_json::Value::Array(history);

        config
    }
}

/// The command that copies injected content to its runtime location at start.
pub fn default_command(content_dir: &str, mount_path: &str) -> Vec<String> {
    let content_dir = content_dir.trim_end_matches('/');
    vec![
        "/bin/bash".to_string(),
        "-c".to_string(),
        format!("exec cp -rp {}/* {}", content_dir, mount_path),
    ]
}

fn copy_blob(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        return Ok(());
    }
    std::fs::copy(src, dst).map_err(|e| {
        BakeError::OciImageError(format!(
            "Failed to copy blob {} to {}: {}",
            src.display(),
            dst.display(),
            e
        ))
    })?;
    Ok(())
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data).map_err(|e| {
        BakeError::OciImageError(format!("Failed to write {}: {}", path.display(), e))
    })
}

/// Move a complete layout to `target`.
///
/// The layout is copied next to the target and renamed into place, so a
/// failed copy never leaves a layout at `target`.
fn publish_layout(layout_dir: &Path, target: &Path) -> std::result::Result<(), String> {
    if target.exists() {
        let occupied = std::fs::read_dir(target)
            .map_err(|e| format!("Failed to read {}: {}", target.display(), e))?
            .next()
            .is_some();
        if occupied {
            return Err(format!("{} already exists and is not empty", target.display()));
        }
        std::fs::remove_dir(target)
            .map_err(|e| format!("Failed to replace {}: {}", target.display(), e))?;
    }

    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)
        .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;

    let staging = parent.join(format!(".a3s-bake-{}.partial", Uuid::new_v4()));
    let published = copy_dir_recursive(layout_dir, &staging)
        .and_then(|()| std::fs::rename(&staging, target));
    if let Err(e) = published {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(format!("Failed to write layout {}: {}", target.display(), e));
    }
    Ok(())
}
