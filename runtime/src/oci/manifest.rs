//! Image export manifest lookup.
//!
//! `docker save` writes a `manifest.json` at the root of the export: a JSON
//! array with one object per saved image, naming the config blob and the
//! ordered layer archives. Older and newer Docker releases disagree on key
//! capitalization, so each field is looked up under every accepted spelling.

use std::path::Path;

use monolayer_core::error::{FlattenError, Result};
use serde_json::Value;

/// Manifest file name at the export root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Accepted spellings of the config field, in probe order.
pub const CONFIG_KEYS: &[&str] = &["config", "Config"];

/// Accepted spellings of the layers field, in probe order.
pub const LAYER_KEYS: &[&str] = &["layers", "Layers"];

/// The single image described by an export manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Config JSON, relative to the export root
    pub config_path: String,
    /// Layer archives, relative to the export root, oldest first
    pub layer_paths: Vec<String>,
}

/// Read and validate `manifest.json` from an extracted image export.
///
/// # Errors
///
/// Returns `FormatError` if:
/// - The manifest is missing or is not valid JSON
/// - The top-level value is not an array of exactly one entry
/// - The config or layers field is absent under every accepted spelling
/// - A field has the wrong JSON type
pub fn load_manifest(export_root: &Path) -> Result<ManifestEntry> {
    let manifest_path = export_root.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&manifest_path).map_err(|e| {
        FlattenError::FormatError(format!(
            "Failed to read {} at {}: {}",
            MANIFEST_FILE,
            manifest_path.display(),
            e
        ))
    })?;

    let manifest: Value = serde_json::from_str(&content).map_err(|e| {
        FlattenError::FormatError(format!("Failed to parse {}: {}", MANIFEST_FILE, e))
    })?;

    parse_manifest(&manifest)
}

/// Validate an already-parsed manifest document.
pub fn parse_manifest(manifest: &Value) -> Result<ManifestEntry> {
    let entries = manifest.as_array().ok_or_else(|| {
        FlattenError::FormatError(format!("{} is not a list", MANIFEST_FILE))
    })?;

    let entry = match entries.as_slice() {
        [entry] => entry,
        _ => {
            return Err(FlattenError::FormatError(format!(
                "Manifest has {} entries, expected exactly one",
                entries.len()
            )))
        }
    };

    let config_path = probe(entry, CONFIG_KEYS, "config")?
        .as_str()
        .ok_or_else(|| {
            FlattenError::FormatError("Manifest config is not a string".to_string())
        })?
        .to_string();

    let layer_paths = probe(entry, LAYER_KEYS, "layers")?
        .as_array()
        .ok_or_else(|| {
            FlattenError::FormatError("Manifest layers is not a list".to_string())
        })?
        .iter()
        .map(|layer| {
            layer.as_str().map(str::to_string).ok_or_else(|| {
                FlattenError::FormatError(format!("Manifest layer is not a string: {}", layer))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(ManifestEntry {
        config_path,
        layer_paths,
    })
}

/// Return the value under the first key of `keys` present in `entry`.
fn probe<'a>(entry: &'a Value, keys: &[&str], field: &str) -> Result<&'a Value> {
    keys.iter()
        .find_map(|key| entry.get(*key))
        .ok_or_else(|| {
            FlattenError::FormatError(format!(
                "Unable to find {} in manifest (tried {})",
                field,
                keys.join(", ")
            ))
        })
}
