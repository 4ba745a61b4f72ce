//! Layer extraction and overlay.
//!
//! Extracts image layers (plain or gzip-compressed tar) into one shared
//! directory, oldest first, so that later layers override earlier ones.

use std::collections::BTreeMap;
use std::fs::{self, File, Permissions};
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use monolayer_core::error::{FlattenError, Result};
use tar::{Archive, EntryType};

/// File name prefix marking a deleted path in a layer diff.
pub const WHITEOUT_PREFIX: &str = ".wh.";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const OWNER_RWX: u32 = 0o700;

/// Counters collected while overlaying layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayStats {
    /// Layers extracted
    pub layers: usize,
    /// Entries written into the merged tree
    pub entries: usize,
    /// Whiteout markers kept as ordinary files
    pub whiteouts: usize,
    /// Entries skipped because they would land outside the merged tree
    pub skipped: usize,
}

impl OverlayStats {
    fn absorb(&mut self, other: OverlayStats) {
        self.layers += other.layers;
        self.entries += other.entries;
        self.whiteouts += other.whiteouts;
        self.skipped += other.skipped;
    }
}

/// Directory modes recorded during extraction, applied once the tree is
/// complete.
///
/// Directories stay owner-writable while layers are extracted so that a
/// read-only directory (`/usr/bin` is often 0555) does not block its own
/// children or later layers. Keys are resolved on-disk paths.
#[derive(Debug, Default)]
struct DirModes(BTreeMap<PathBuf, u32>);

impl DirModes {
    fn defer(&mut self, dir: &Path, mode: u32) -> Result<()> {
        self.0.insert(dir.to_path_buf(), mode & 0o7777);
        fs::set_permissions(dir, Permissions::from_mode((mode & 0o7777) | OWNER_RWX)).map_err(
            |e| {
                FlattenError::ArchiveError(format!(
                    "Failed to set permissions on {}: {}",
                    dir.display(),
                    e
                ))
            },
        )
    }

    /// Forget every directory at or below `removed`.
    fn forget(&mut self, removed: &Path) {
        self.0.retain(|dir, _| !dir.starts_with(removed));
    }

    /// Apply recorded modes, children before parents.
    fn apply(self) -> Result<()> {
        for (dir, mode) in self.0.into_iter().rev() {
            if !is_real_dir(&dir) {
                continue;
            }
            fs::set_permissions(&dir, Permissions::from_mode(mode)).map_err(|e| {
                FlattenError::ArchiveError(format!(
                    "Failed to set permissions on {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

/// Overlay every layer, in order, onto `target_dir`.
///
/// A path produced by more than one layer ends up with the content and
/// permissions of the last layer that wrote it. Whiteout markers are not
/// interpreted: they are extracted like any other file.
///
/// Directory permissions are applied after the last layer, so the merged tree
/// may contain read-only directories; see [`restore_owner_access`].
///
/// # Errors
///
/// Returns `ArchiveError` as soon as one layer is missing, unreadable, or
/// fails to extract. Layers after the failing one are not applied.
pub fn overlay_layers<P: AsRef<Path>>(layer_paths: &[P], target_dir: &Path) -> Result<OverlayStats> {
    let root = prepare_target(target_dir)?;

    let mut modes = DirModes::default();
    let mut stats = OverlayStats::default();
    for layer_path in layer_paths {
        stats.absorb(extract_into(layer_path.as_ref(), target_dir, &root, &mut modes)?);
    }
    modes.apply()?;

    if stats.whiteouts > 0 {
        tracing::warn!(
            whiteouts = stats.whiteouts,
            "Whiteout markers kept as regular files; deleted paths are not removed"
        );
    }

    Ok(stats)
}

/// Extract a single layer archive into `target_dir`.
///
/// Existing entries are overwritten. When the layer swaps a directory for a
/// non-directory (or the reverse) the old entry is removed first.
///
/// # Errors
///
/// Returns `ArchiveError` if:
/// - Layer file doesn't exist
/// - The archive is corrupt or cannot be decompressed
/// - An entry cannot be written
pub fn extract_layer(layer_path: &Path, target_dir: &Path) -> Result<OverlayStats> {
    let root = prepare_target(target_dir)?;

    let mut modes = DirModes::default();
    let stats = extract_into(layer_path, target_dir, &root, &mut modes)?;
    modes.apply()?;

    Ok(stats)
}

/// Give the owner full access to every directory under `root`.
///
/// Undoes read-only directory modes so the tree can be removed.
pub fn restore_owner_access(root: &Path) -> std::io::Result<()> {
    let meta = fs::symlink_metadata(root)?;
    if !meta.is_dir() {
        return Ok(());
    }

    let mode = meta.permissions().mode();
    if mode & OWNER_RWX != OWNER_RWX {
        fs::set_permissions(root, Permissions::from_mode(mode | OWNER_RWX))?;
    }

    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            restore_owner_access(&entry.path())?;
        }
    }
    Ok(())
}

/// Create `target_dir` and return its canonical form.
fn prepare_target(target_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(target_dir)
        .and_then(|_| fs::canonicalize(target_dir))
        .map_err(|e| {
            FlattenError::ArchiveError(format!(
                "Failed to create target directory {}: {}",
                target_dir.display(),
                e
            ))
        })
}

fn extract_into(
    layer_path: &Path,
    target_dir: &Path,
    root: &Path,
    modes: &mut DirModes,
) -> Result<OverlayStats> {
    if !layer_path.is_file() {
        return Err(FlattenError::ArchiveError(format!(
            "Layer file not found: {}",
            layer_path.display()
        )));
    }

    let mut archive = Archive::new(open_layer(layer_path)?);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);

    let corrupt = |e: std::io::Error| {
        FlattenError::ArchiveError(format!(
            "Failed to read layer {}: {}",
            layer_path.display(),
            e
        ))
    };

    let mut stats = OverlayStats {
        layers: 1,
        ..Default::default()
    };

    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let path = entry.path().map_err(corrupt)?.into_owned();
        let kind = entry.header().entry_type();

        if is_whiteout(&path) {
            stats.whiteouts += 1;
        }

        let relative = contained_path(&path);
        let destination = relative.as_deref().and_then(|rel| resolve_destination(root, rel));
        if let Some(dst) = &destination {
            clear_type_conflict(dst, kind, modes)?;
        }

        let written = entry.unpack_in(target_dir).map_err(|e| {
            FlattenError::ArchiveError(format!(
                "Failed to extract {} from layer {}: {}",
                path.display(),
                layer_path.display(),
                e
            ))
        })?;

        if !written {
            stats.skipped += 1;
            tracing::warn!(
                layer = %layer_path.display(),
                entry = %path.display(),
                "Skipped layer entry outside the merged tree"
            );
            continue;
        }
        stats.entries += 1;

        if kind.is_dir() {
            let dst = destination
                .or_else(|| relative.as_deref().and_then(|rel| resolve_destination(root, rel)));
            if let Some(dst) = dst {
                modes.defer(&dst, entry.header().mode().map_err(corrupt)?)?;
            }
        }
    }

    tracing::debug!(
        layer = %layer_path.display(),
        target = %target_dir.display(),
        entries = stats.entries,
        "Extracted layer"
    );

    Ok(stats)
}

/// Open a layer archive, decompressing it when it carries the gzip magic.
fn open_layer(layer_path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(layer_path).map_err(|e| {
        FlattenError::ArchiveError(format!(
            "Failed to open layer file {}: {}",
            layer_path.display(),
            e
        ))
    })?;

    let mut reader = BufReader::new(file);
    let is_gzip = reader
        .fill_buf()
        .map_err(|e| {
            FlattenError::ArchiveError(format!(
                "Failed to read layer file {}: {}",
                layer_path.display(),
                e
            ))
        })?
        .starts_with(&GZIP_MAGIC);

    if is_gzip {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Whether the final path component is a whiteout marker.
pub fn is_whiteout(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(WHITEOUT_PREFIX))
}

/// Relative destination of an entry path, mirroring how `tar` resolves it.
///
/// Returns `None` for paths with `..` components (tar refuses them) and for
/// the archive root itself.
fn contained_path(path: &Path) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::CurDir => continue,
            Component::ParentDir => return None,
            Component::Normal(part) => relative.push(part),
        }
    }

    if relative.as_os_str().is_empty() {
        None
    } else {
        Some(relative)
    }
}

/// On-disk location of `relative` under the canonical `root`.
///
/// The parent is resolved through any symlinks, as `tar` does before
/// unpacking. Returns `None` when the parent does not exist yet or resolves
/// outside `root`.
fn resolve_destination(root: &Path, relative: &Path) -> Option<PathBuf> {
    let name = relative.file_name()?;
    let parent = fs::canonicalize(root.join(relative).parent()?).ok()?;
    if parent.starts_with(root) {
        Some(parent.join(name))
    } else {
        None
    }
}

/// Whether `dir` is a directory reached without following any symlink.
fn is_real_dir(dir: &Path) -> bool {
    let parent_is_canonical = dir
        .parent()
        .is_some_and(|parent| fs::canonicalize(parent).is_ok_and(|real| real == parent));
    parent_is_canonical && fs::symlink_metadata(dir).is_ok_and(|meta| meta.is_dir())
}

/// Remove `dst` when its type conflicts with the incoming entry.
///
/// `dst` must already be resolved inside the merged tree.
fn clear_type_conflict(dst: &Path, incoming: EntryType, modes: &mut DirModes) -> Result<()> {
    let existing = match fs::symlink_metadata(dst) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(FlattenError::ArchiveError(format!(
                "Failed to inspect {}: {}",
                dst.display(),
                e
            )))
        }
    };

    let removal = if existing.is_dir() && !incoming.is_dir() {
        modes.forget(dst);
        restore_owner_access(dst).and_then(|_| fs::remove_dir_all(dst))
    } else if !existing.is_dir() && incoming.is_dir() {
        fs::remove_file(dst)
    } else {
        return Ok(());
    };

    removal.map_err(|e| {
        FlattenError::ArchiveError(format!(
            "Failed to replace {}: {}",
            dst.display(),
            e
        ))
    })
}
