//! Packaging of a merged filesystem tree into a single layer archive.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use monolayer_core::error::{FlattenError, Result};

/// A layer archive written by [`package_dir`].
#[derive(Debug, Clone)]
pub struct PackagedLayer {
    /// Path to the layer tar file
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Number of archive entries (files, directories, links)
    pub entries: usize,
}

/// Archive every entry under `source_dir` into an uncompressed tar at
/// `output_path`.
///
/// Entry names are relative to `source_dir` and carry no `./` root entry.
/// Directories are walked in sorted order so the same tree always yields the
/// same entry sequence. Symbolic links are stored as links and permissions
/// are kept. If packaging fails the partial output file is removed.
pub fn package_dir(source_dir: &Path, output_path: &Path) -> Result<PackagedLayer> {
    let file = File::create(output_path).map_err(|e| {
        FlattenError::ArchiveError(format!(
            "Failed to create layer file {}: {}",
            output_path.display(),
            e
        ))
    })?;

    let written = write_archive(source_dir, file).and_then(|entries| {
        let size = fs::metadata(output_path)
            .map_err(|e| {
                FlattenError::ArchiveError(format!(
                    "Failed to stat layer file {}: {}",
                    output_path.display(),
                    e
                ))
            })?
            .len();
        Ok((entries, size))
    });

    let (entries, size) = match written {
        Ok(written) => written,
        Err(e) => {
            let _ = fs::remove_file(output_path);
            return Err(e);
        }
    };

    tracing::debug!(
        source = %source_dir.display(),
        output = %output_path.display(),
        entries,
        size,
        "Packaged layer"
    );

    Ok(PackagedLayer {
        path: output_path.to_path_buf(),
        size,
        entries,
    })
}

fn write_archive(source_dir: &Path, file: File) -> Result<usize> {
    let mut builder = tar::Builder::new(BufWriter::new(file));
    builder.follow_symlinks(false);

    let entries = add_dir_to_tar(&mut builder, source_dir, source_dir)?;

    let mut writer = builder
        .into_inner()
        .map_err(|e| FlattenError::ArchiveError(format!("Failed to finalize layer: {}", e)))?;
    writer
        .flush()
        .map_err(|e| FlattenError::ArchiveError(format!("Failed to flush layer: {}", e)))?;

    Ok(entries)
}

/// Recursively add a directory's contents to a tar builder, sorted by name.
fn add_dir_to_tar<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    current: &Path,
) -> Result<usize> {
    let mut children = fs::read_dir(current)
        .and_then(|read_dir| {
            read_dir
                .map(|entry| entry.map(|e| e.path()))
                .collect::<std::io::Result<Vec<_>>>()
        })
        .map_err(|e| {
            FlattenError::ArchiveError(format!(
                "Failed to read directory {}: {}",
                current.display(),
                e
            ))
        })?;
    children.sort();

    let mut count = 0;
    for path in children {
        let relative = path.strip_prefix(root).map_err(|e| {
            FlattenError::ArchiveError(format!(
                "Failed to compute relative path for {}: {}",
                path.display(),
                e
            ))
        })?;

        let metadata = fs::symlink_metadata(&path).map_err(|e| {
            FlattenError::ArchiveError(format!(
                "Failed to read metadata for {}: {}",
                path.display(),
                e
            ))
        })?;

        if metadata.is_dir() {
            builder.append_dir(relative, &path).map_err(|e| {
                FlattenError::ArchiveError(format!(
                    "Failed to add directory {} to layer: {}",
                    relative.display(),
                    e
                ))
            })?;
            count += 1 + add_dir_to_tar(builder, root, &path)?;
        } else {
            builder
                .append_path_with_name(&path, relative)
                .map_err(|e| {
                    FlattenError::ArchiveError(format!(
                        "Failed to add file {} to layer: {}",
                        relative.display(),
                        e
                    ))
                })?;
            count += 1;
        }
    }

    Ok(count)
}
