//! Layer creation utilities for image assembly.
//!
//! Produces gzip-compressed tar layers from an extracted directory or from
//! in-memory archive entries. Every entry is placed under a target prefix
//! inside the image and stamped with an explicit owner.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use a3s_bake_core::config::Ownership;
use a3s_bake_core::error::{BakeError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::archive::{EntryKind, ExtractedEntry};

/// Mode of directories synthesized for the target prefix.
const PREFIX_DIR_MODE: u32 = 0o755;

/// Information about a created layer.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    /// Path to the layer tar.gz file
    pub path: PathBuf,
    /// SHA256 digest of the compressed blob (hex string, without "sha256:" prefix)
    pub digest: String,
    /// SHA256 digest of the uncompressed tar (hex string, without "sha256:" prefix)
    pub diff_id: String,
    /// Size in bytes
    pub size: u64,
}

impl LayerInfo {
    /// Get the digest with "sha256:" prefix.
    pub fn prefixed_digest(&self) -> String {
        format!("sha256:{}", self.digest)
    }

    /// Get the diff ID with "sha256:" prefix.
    pub fn prefixed_diff_id(&self) -> String {
        format!("sha256:{}", self.diff_id)
    }
}

/// Writer that hashes the uncompressed tar stream on its way to the encoder.
struct DiffIdWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> Write for DiffIdWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

type LayerBuilder = tar::Builder<DiffIdWriter<GzEncoder<File>>>;

/// Create a tar.gz layer from an entire directory.
///
/// All files under `src_dir` are added to the layer with paths relative
/// to `target_prefix` (the destination path inside the image). The
/// prefix's own directories are included. Ownership comes from `owner`,
/// never from the source tree.
pub fn create_layer_from_dir(
    src_dir: &Path,
    target_prefix: &Path,
    owner: Ownership,
    output_path: &Path,
) -> Result<LayerInfo> {
    let prefix = image_relative(target_prefix);
    write_layer(output_path, |builder| {
        append_prefix_dirs(builder, &prefix, owner)?;
        add_dir_to_tar(builder, src_dir, src_dir, &prefix, owner)
    })
}

/// Create a tar.gz layer from in-memory archive entries.
///
/// Entries are written in order under `target_prefix`. File entries must
/// carry their content.
pub fn create_layer_from_entries(
    entries: &[ExtractedEntry],
    target_prefix: &Path,
    owner: Ownership,
    output_path: &Path,
) -> Result<LayerInfo> {
    let prefix = image_relative(target_prefix);
    write_layer(output_path, |builder| {
        append_prefix_dirs(builder, &prefix, owner)?;
        for entry in entries {
            let tar_path = prefix.join(&entry.path);
            let mut header = base_header(owner, entry.mode, entry.mtime);
            match entry.kind {
                EntryKind::Directory => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    builder
                        .append_data(&mut header, &tar_path, io::empty())
                        .map_err(|e| layer_error("add directory", &tar_path, e))?;
                }
                EntryKind::File => {
                    let content = entry.content.as_deref().ok_or_else(|| {
                        BakeError::LayerInjectionError(format!(
                            "No content loaded for {}",
                            entry.path.display()
                        ))
                    })?;
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(content.len() as u64);
                    builder
                        .append_data(&mut header, &tar_path, content)
                        .map_err(|e| layer_error("add file", &tar_path, e))?;
                }
            }
        }
        Ok(())
    })
}

/// Write a layer through `fill`, hashing both the compressed and uncompressed streams.
///
/// The layer is staged as `<output>.partial` and renamed on success; the
/// partial file is removed on any failure.
fn write_layer<F>(output_path: &Path, fill: F) -> Result<LayerInfo>
where
    F: FnOnce(&mut LayerBuilder) -> Result<()>,
{
    let partial = partial_path(output_path);
    let result = write_layer_inner(&partial, fill).and_then(|diff_id| {
        std::fs::rename(&partial, output_path).map_err(|e| {
            BakeError::LayerInjectionError(format!(
                "Failed to finalize layer {}: {}",
                output_path.display(),
                e
            ))
        })?;
        Ok(diff_id)
    });

    let diff_id = match result {
        Ok(diff_id) => diff_id,
        Err(e) => {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
    };

    let digest = sha256_file(output_path)?;
    let size = std::fs::metadata(output_path).map(|m| m.len()).unwrap_or(0);

    tracing::debug!(
        layer = %output_path.display(),
        digest = %digest,
        size,
        "Created layer"
    );

    Ok(LayerInfo {
        path: output_path.to_path_buf(),
        digest,
        diff_id,
        size,
    })
}

fn write_layer_inner<F>(partial: &Path, fill: F) -> Result<String>
where
    F: FnOnce(&mut LayerBuilder) -> Result<()>,
{
    let file = File::create(partial).map_err(|e| {
        BakeError::LayerInjectionError(format!(
            "Failed to create layer file {}: {}",
            partial.display(),
            e
        ))
    })?;

    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(DiffIdWriter {
        inner: encoder,
        hasher: Sha256::new(),
    });
    fill(&mut builder)?;

    let writer = builder
        .into_inner()
        .map_err(|e| BakeError::LayerInjectionError(format!("Failed to finalize layer: {}", e)))?;
    let diff_id = hex::encode(writer.hasher.finalize());
    writer
        .inner
        .finish()
        .map_err(|e| BakeError::LayerInjectionError(format!("Failed to finalize layer: {}", e)))?;

    Ok(diff_id)
}

/// Recursively add a directory's contents to a tar builder, sorted by name.
fn add_dir_to_tar<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    current: &Path,
    target_prefix: &Path,
    owner: Ownership,
) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        BakeError::LayerInjectionError(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    let mut paths = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|e| {
            BakeError::LayerInjectionError(format!("Failed to read entry: {}", e))
        })?;
        paths.push(entry.path());
    }
    paths.sort();

    for path in paths {
        let relative = path.strip_prefix(root).map_err(|e| {
            BakeError::LayerInjectionError(format!("Failed to strip prefix: {}", e))
        })?;
        let tar_path = target_prefix.join(relative);

        let metadata = std::fs::symlink_metadata(&path)
            .map_err(|e| layer_error("read metadata of", &path, e))?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if metadata.is_dir() {
            let mut header = base_header(owner, file_mode(&metadata), mtime);
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder
                .append_data(&mut header, &tar_path, io::empty())
                .map_err(|e| layer_error("add directory", &tar_path, e))?;
            add_dir_to_tar(builder, root, &path, target_prefix, owner)?;
        } else if metadata.is_file() {
            let mut header = base_header(owner, file_mode(&metadata), mtime);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(metadata.len());
            let file = open_source_file(&path, file_mode(&metadata))
                .map_err(|e| layer_error("open", &path, e))?;
            builder
                .append_data(&mut header, &tar_path, file.take(metadata.len()))
                .map_err(|e| layer_error("add file", &tar_path, e))?;
        } else {
            tracing::debug!(path = %path.display(), "Skipping non-regular file");
        }
    }

    Ok(())
}

/// Open a source file for reading regardless of its owner-read bit.
///
/// Extraction applies header modes verbatim, so a file may lack read
/// permission for the building user. Owner-read is granted for the open
/// and the original mode is restored right after.
fn open_source_file(path: &Path, mode: u32) -> io::Result<File> {
    match File::open(path) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied && cfg!(unix) => {
            set_mode(path, mode | 0o400)?;
            let opened = File::open(path);
            set_mode(path, mode)?;
            opened
        }
        result => result,
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Emit directory entries for every component of the target prefix.
fn append_prefix_dirs<W: Write>(
    builder: &mut tar::Builder<W>,
    prefix: &Path,
    owner: Ownership,
) -> Result<()> {
    let mut current = PathBuf::new();
    for component in prefix.components() {
        current.push(component);
        let mut header = base_header(owner, PREFIX_DIR_MODE, 0);
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        builder
            .append_data(&mut header, &current, io::empty())
            .map_err(|e| layer_error("add directory", &current, e))?;
    }
    Ok(())
}

fn base_header(owner: Ownership, mode: u32, mtime: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_mode(mode);
    header.set_uid(owner.uid);
    header.set_gid(owner.gid);
    header.set_mtime(mtime);
    header
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}

/// Strip root and `.` components so the prefix is relative to the image root.
fn image_relative(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

fn partial_path(output_path: &Path) -> PathBuf {
    let mut name = output_path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn layer_error(action: &str, path: &Path, err: io::Error) -> BakeError {
    BakeError::LayerInjectionError(format!(
        "Failed to {} {}: {}",
        action,
        path.display(),
        err
    ))
}

/// Compute SHA256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        BakeError::OciImageError(format!(
            "Failed to read file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| {
        BakeError::OciImageError(format!("Failed to hash {}: {}", path.display(), e))
    })?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
