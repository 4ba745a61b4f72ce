//! End-to-end flattening of an image export.
//!
//! The pipeline is strictly sequential:
//!
//! ```text
//! image.tar ──unpack──▶ staging/ ──manifest.json──▶ ManifestEntry
//!                                    │
//!              layers (oldest first) ▼
//!                           staging/MONOLAYER ──package──▶ <prefix>layer.tar
//!                                                             │ sha256
//!              config.json ──strip lineage + new rootfs/history──▶ <prefix>config.json
//! ```
//!
//! The staging directory is a [`TempDir`] owned by [`Flattener::run`], so it
//! is removed on every return path, including errors. Once the flattened
//! layer has been written, any later failure removes it again.

use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use monolayer_core::config::FlattenConfig;
use monolayer_core::error::{FlattenError, Result};
use serde_json::Value;
use tempfile::TempDir;

use crate::oci::{
    config as image_config, load_manifest, overlay_layers, package_dir, restore_owner_access,
    ManifestEntry, PackagedLayer,
};

/// Name of the merged tree inside the staging directory.
const MERGED_DIR: &str = "MONOLAYER";

/// Outcome of a successful flatten run.
#[derive(Debug, Clone)]
pub struct FlattenReport {
    /// Config path named by the manifest, relative to the export root
    pub source_config: String,
    /// Number of layers merged
    pub layers: usize,
    /// Prefixed digest of the flattened layer (`sha256:<hex>`)
    pub diff_id: String,
    /// Written layer archive
    pub layer_path: PathBuf,
    /// Size of the layer archive in bytes
    pub layer_size: u64,
    /// Entries in the layer archive
    pub layer_entries: usize,
    /// Written image config
    pub config_path: PathBuf,
    /// Whiteout markers carried into the layer as regular files
    pub whiteouts: usize,
    /// Layer entries dropped because they pointed outside the image root
    pub skipped: usize,
}

/// Scratch space for one run.
///
/// The merged tree can hold read-only directories, so owner access is
/// restored before the [`TempDir`] removes it.
struct Staging {
    dir: TempDir,
}

impl Staging {
    fn create(parent: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("monolayer-");
        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|e| {
            FlattenError::ArchiveError(format!("Failed to create staging directory: {}", e))
        })?;

        Ok(Self { dir })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if let Err(e) = restore_owner_access(self.dir.path()) {
            tracing::debug!(
                staging = %self.dir.path().display(),
                error = %e,
                "Failed to unlock staging directory"
            );
        }
    }
}

/// Flattens one image export according to a [`FlattenConfig`].
#[derive(Debug, Clone)]
pub struct Flattener {
    config: FlattenConfig,
    staging_root: Option<PathBuf>,
}

impl Flattener {
    pub fn new(config: FlattenConfig) -> Self {
        Self {
            config,
            staging_root: None,
        }
    }

    /// Create the staging directory under `dir` instead of the system
    /// temporary directory.
    pub fn staging_in(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(dir.into());
        self
    }

    /// Run the whole pipeline and write both artifacts.
    ///
    /// # Errors
    ///
    /// Any stage failure aborts the run. Format problems in the manifest or
    /// config are reported before anything is written to the output
    /// directory.
    pub fn run(&self) -> Result<FlattenReport> {
        let staging = Staging::create(self.staging_root.as_deref())?;
        self.run_in(staging.path())
    }

    fn run_in(&self, export_root: &Path) -> Result<FlattenReport> {
        unpack_export(self.config.input(), export_root)?;

        let manifest = load_manifest(export_root)?;
        tracing::info!(
            config = %manifest.config_path,
            layers = manifest.layer_paths.len(),
            "Found image config"
        );

        let (config_path, layer_paths) = resolve_manifest(export_root, &manifest)?;
        let original_config = image_config::load_config(&config_path)?;

        let merged = export_root.join(MERGED_DIR);
        let stats = overlay_layers(&layer_paths, &merged)?;
        tracing::info!(
            layers = stats.layers,
            entries = stats.entries,
            "Merged layers"
        );

        let packaged = package_dir(&merged, &self.config.layer_output_path())?;
        let config_output = self.config.config_output_path();

        let diff_id = match self.write_config(original_config, &packaged, &config_output) {
            Ok(diff_id) => diff_id,
            Err(e) => {
                let _ = fs::remove_file(&packaged.path);
                return Err(e);
            }
        };

        Ok(FlattenReport {
            source_config: manifest.config_path,
            layers: stats.layers,
            diff_id,
            layer_path: packaged.path,
            layer_size: packaged.size,
            layer_entries: packaged.entries,
            config_path: config_output,
            whiteouts: stats.whiteouts,
            skipped: stats.skipped,
        })
    }

    /// Hash the packaged layer and write the rewritten config for it.
    ///
    /// Returns the layer's diff-id.
    fn write_config(
        &self,
        original: Value,
        packaged: &PackagedLayer,
        config_output: &Path,
    ) -> Result<String> {
        let diff_id = format!("sha256:{}", image_config::sha256_file(&packaged.path)?);
        tracing::info!(diff_id = %diff_id, size = packaged.size, "Packaged flattened layer");

        let created = image_config::history_timestamp(chrono::Utc::now());
        let rewritten = image_config::rewrite_config(original, &diff_id, &created)?;
        image_config::write_config(&rewritten, config_output)?;

        Ok(diff_id)
    }
}

/// Extract an image export archive into `dest`.
pub fn unpack_export(input: &Path, dest: &Path) -> Result<()> {
    let file = File::open(input).map_err(|e| {
        FlattenError::ArchiveError(format!("Failed to open {}: {}", input.display(), e))
    })?;

    let mut archive = tar::Archive::new(file);
    archive.unpack(dest).map_err(|e| {
        FlattenError::ArchiveError(format!(
            "Unable to extract image export {}: {}",
            input.display(),
            e
        ))
    })?;

    tracing::debug!(input = %input.display(), dest = %dest.display(), "Unpacked image export");
    Ok(())
}

/// Join a manifest path onto the export root.
///
/// # Errors
///
/// Returns `FormatError` for absolute paths and paths containing `..`.
pub fn resolve_in_export(export_root: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if relative.is_empty() || escapes {
        return Err(FlattenError::FormatError(format!(
            "Manifest path escapes the image export: {:?}",
            relative
        )));
    }

    Ok(export_root.join(path))
}

fn resolve_manifest(export_root: &Path, manifest: &ManifestEntry) -> Result<(PathBuf, Vec<PathBuf>)> {
    let config_path = resolve_in_export(export_root, &manifest.config_path)?;
    let layer_paths = manifest
        .layer_paths
        .iter()
        .map(|layer| resolve_in_export(export_root, layer))
        .collect::<Result<Vec<_>>>()?;

    Ok((config_path, layer_paths))
}
