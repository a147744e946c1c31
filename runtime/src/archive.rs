//! Gzip tarball extraction with root confinement.
//!
//! Entries are applied in archive order. Every output path is normalized
//! and bound-checked against the canonical destination root before any
//! filesystem write; entries that would escape the root are rejected.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use a3s_bake_core::error::{ExtractionError, Result};
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

/// Mode applied to directories created during extraction.
const DIR_MODE: u32 = 0o755;

/// Kind of an unpacked filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
}

/// One unpacked archive entry.
#[derive(Debug, Clone)]
pub struct ExtractedEntry {
    /// Entry kind
    pub kind: EntryKind,
    /// Normalized path relative to the extraction root
    pub path: PathBuf,
    /// Permission bits from the archive header
    pub mode: u32,
    /// Content size in bytes (0 for directories)
    pub size: u64,
    /// Modification time from the archive header (seconds since epoch)
    pub mtime: u64,
    /// File content, only populated by [`read_archive`]
    pub content: Option<Vec<u8>>,
}

/// A directory tree materialized from an archive.
#[derive(Debug)]
pub struct ExtractedTree {
    root: PathBuf,
    entries: Vec<ExtractedEntry>,
}

impl ExtractedTree {
    /// Canonical root directory of the tree.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entries in archive order.
    pub fn entries(&self) -> &[ExtractedEntry] {
        &self.entries
    }

    /// Number of regular files in the tree.
    pub fn file_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .count()
    }
}

/// Extract a gzip-compressed tar archive into `dest`.
///
/// `dest` is created if missing. Directories are created with mode 0755
/// (existing directories are left as they are); regular files get the
/// mode recorded in their header. Symlinks, hard links and special files
/// are skipped. Ancestors missing because of out-of-order entries are
/// created on demand.
///
/// # Errors
///
/// Returns `ExtractionError` if:
/// - The archive cannot be opened or its gzip/tar framing is corrupt
/// - An entry path escapes `dest` (`PathTraversal`)
/// - A directory or file cannot be written
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<ExtractedTree> {
    let mut archive = open_archive(archive_path)?;

    fs::create_dir_all(dest).map_err(|e| io_error(dest, e))?;
    let root = dest.canonicalize().map_err(|e| io_error(dest, e))?;

    let mut entries = Vec::new();
    let iter = archive
        .entries()
        .map_err(|e| malformed(archive_path, e))?;

    for entry in iter {
        let mut entry = entry.map_err(|e| malformed(archive_path, e))?;
        let Some(decoded) = decode_entry(archive_path, &entry)? else {
            continue;
        };

        let target = root.join(&decoded.path);
        let size = match decoded.kind {
            EntryKind::Directory => {
                create_dir_confined(&root, &target)?;
                0
            }
            EntryKind::File => {
                if let Some(parent) = target.parent() {
                    create_dir_confined(&root, parent)?;
                }
                write_file_confined(&root, &target, &mut entry, decoded.mode)?
            }
        };
        entries.push(decoded.into_entry(size, None));
    }

    tracing::debug!(
        archive = %archive_path.display(),
        target = %root.display(),
        entries = entries.len(),
        "Extracted archive"
    );

    Ok(ExtractedTree { root, entries })
}

/// Read a gzip-compressed tar archive into memory.
///
/// Applies the same path rules as [`extract_archive`] without touching
/// the filesystem. Regular files carry their content. Ancestors missing
/// because of out-of-order entries are emitted as directory entries with
/// mode 0755 just before the entry that needs them.
pub fn read_archive(archive_path: &Path) -> Result<Vec<ExtractedEntry>> {
    let mut archive = open_archive(archive_path)?;
    let mut entries = Vec::new();
    let mut dirs: HashSet<PathBuf> = HashSet::new();

    let iter = archive
        .entries()
        .map_err(|e| malformed(archive_path, e))?;

    for entry in iter {
        let mut entry = entry.map_err(|e| malformed(archive_path, e))?;
        let Some(decoded) = decode_entry(archive_path, &entry)? else {
            continue;
        };

        let mut ancestors: Vec<&Path> = decoded
            .path
            .ancestors()
            .skip(1)
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        ancestors.reverse();
        for ancestor in ancestors {
            if dirs.insert(ancestor.to_path_buf()) {
                entries.push(ExtractedEntry {
                    kind: EntryKind::Directory,
                    path: ancestor.to_path_buf(),
                    mode: DIR_MODE,
                    size: 0,
                    mtime: decoded.mtime,
                    content: None,
                });
            }
        }

        match decoded.kind {
            EntryKind::Directory => {
                if dirs.insert(decoded.path.clone()) {
                    entries.push(decoded.into_entry(0, None));
                }
            }
            EntryKind::File => {
                let mut content = Vec::new();
                entry
                    .read_to_end(&mut content)
                    .map_err(|e| malformed(archive_path, e))?;
                let size = content.len() as u64;
                entries.push(decoded.into_entry(size, Some(content)));
            }
        }
    }

    Ok(entries)
}

/// Header fields of one supported archive entry.
struct DecodedEntry {
    kind: EntryKind,
    path: PathBuf,
    mode: u32,
    mtime: u64,
}

impl DecodedEntry {
    fn into_entry(self, size: u64, content: Option<Vec<u8>>) -> ExtractedEntry {
        ExtractedEntry {
            kind: self.kind,
            path: self.path,
            mode: self.mode,
            size,
            mtime: self.mtime,
            content,
        }
    }
}

/// Decode and normalize an entry header.
///
/// Returns `None` for entries that are skipped: the root directory itself,
/// symlinks, hard links and special files.
fn decode_entry<R: Read>(
    archive_path: &Path,
    entry: &tar::Entry<'_, R>,
) -> Result<Option<DecodedEntry>> {
    let header_path = entry
        .path()
        .map_err(|e| malformed(archive_path, e))?
        .into_owned();
    let path = normalize_entry_path(&header_path)?;
    let header = entry.header();
    let mtime = header.mtime().unwrap_or(0);

    let (kind, mode) = match header.entry_type() {
        EntryType::Directory => {
            if path.as_os_str().is_empty() {
                return Ok(None);
            }
            (EntryKind::Directory, DIR_MODE)
        }
        EntryType::Regular | EntryType::Continuous => {
            if path.as_os_str().is_empty() {
                return Err(ExtractionError::PathTraversal {
                    entry: header_path.display().to_string(),
                }
                .into());
            }
            let mode = header.mode().map_err(|e| malformed(archive_path, e))? & 0o7777;
            (EntryKind::File, mode)
        }
        other => {
            tracing::debug!(
                entry = %header_path.display(),
                kind = ?other,
                "Skipping unsupported archive entry"
            );
            return Ok(None);
        }
    };

    Ok(Some(DecodedEntry {
        kind,
        path,
        mode,
        mtime,
    }))
}

fn open_archive(archive_path: &Path) -> Result<Archive<GzDecoder<BufReader<File>>>> {
    let file = File::open(archive_path).map_err(|e| ExtractionError::Io {
        path: archive_path.display().to_string(),
        message: format!("failed to open archive: {}", e),
    })?;
    Ok(Archive::new(GzDecoder::new(BufReader::new(file))))
}

/// Normalize an entry path lexically, rejecting any `..` that climbs above the root.
///
/// Leading `/` and `.` components are dropped.
pub fn normalize_entry_path(path: &Path) -> std::result::Result<PathBuf, ExtractionError> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(ExtractionError::PathTraversal {
                        entry: path.display().to_string(),
                    });
                }
            }
            Component::Normal(c) => normalized.push(c),
        }
    }
    Ok(normalized)
}

/// Fail unless the deepest existing ancestor of `path` resolves inside `root`.
fn ensure_within_root(root: &Path, path: &Path) -> Result<()> {
    let existing = path
        .ancestors()
        .find(|p| p.symlink_metadata().is_ok())
        .unwrap_or(root);
    let resolved = existing.canonicalize().map_err(|e| io_error(existing, e))?;
    if !resolved.starts_with(root) {
        return Err(ExtractionError::PathTraversal {
            entry: path.display().to_string(),
        }
        .into());
    }
    Ok(())
}

fn create_dir_confined(root: &Path, dir: &Path) -> Result<()> {
    ensure_within_root(root, dir)?;
    if dir.is_dir() {
        return Ok(());
    }

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(DIR_MODE);
    }
    builder.create(dir).map_err(|e| io_error(dir, e))?;
    Ok(())
}

fn write_file_confined<R: Read>(
    root: &Path,
    target: &Path,
    content: &mut R,
    mode: u32,
) -> Result<u64> {
    ensure_within_root(root, target)?;
    if let Ok(meta) = target.symlink_metadata() {
        if meta.file_type().is_symlink() {
            return Err(ExtractionError::PathTraversal {
                entry: target.display().to_string(),
            }
            .into());
        }
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    let mut file = options.open(target).map_err(|e| io_error(target, e))?;
    let size = io::copy(content, &mut file).map_err(|e| io_error(target, e))?;

    // The open mode is filtered by the umask
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(target, fs::Permissions::from_mode(mode))
            .map_err(|e| io_error(target, e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(size)
}

fn io_error(path: &Path, err: io::Error) -> ExtractionError {
    ExtractionError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

fn malformed(archive_path: &Path, err: io::Error) -> ExtractionError {
    ExtractionError::Malformed {
        archive: archive_path.display().to_string(),
        message: err.to_string(),
    }
}
