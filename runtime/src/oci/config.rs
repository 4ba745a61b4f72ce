//! Image config rewriting.
//!
//! The original config is kept as an untyped JSON object so that every field
//! this tool does not own survives untouched. Only the lineage fields are
//! replaced: `rootfs` and `history` describe the single flattened layer, and
//! `parent` is dropped.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, Utc};
use monolayer_core::error::{FlattenError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Comment recorded on the synthetic history entry.
pub const FLATTEN_COMMENT: &str = "image layers flattened and history removed";

/// Config fields describing the old layer lineage, removed before rewriting.
pub const LINEAGE_FIELDS: &[&str] = &["history", "parent", "rootfs"];

/// Read size used while hashing layer archives.
const DIGEST_CHUNK_SIZE: usize = 4096;

/// `rootfs` section of an image config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<String>,
}

impl RootFs {
    /// A layered rootfs made of exactly one diff.
    pub fn single_layer(diff_id: impl Into<String>) -> Self {
        Self {
            kind: "layers".to_string(),
            diff_ids: vec![diff_id.into()],
        }
    }
}

/// One `history` record of an image config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created: String,
    pub comment: String,
}

/// Compute the SHA256 digest of a file, reading it in fixed-size chunks.
///
/// Returns the lowercase hex digest without the `sha256:` prefix.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        FlattenError::ArchiveError(format!(
            "Failed to open file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; DIGEST_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(|e| {
            FlattenError::ArchiveError(format!(
                "Failed to read file for hashing {}: {}",
                path.display(),
                e
            ))
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Format a `history.created` timestamp: UTC, whole seconds, literal `Z`.
pub fn history_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Load an image config document.
///
/// # Errors
///
/// Returns `FormatError` if the file cannot be read, is not JSON, or is not
/// a JSON object.
pub fn load_config(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        FlattenError::FormatError(format!(
            "Failed to read image config {}: {}",
            path.display(),
            e
        ))
    })?;

    let config: Value = serde_json::from_str(&content).map_err(|e| {
        FlattenError::FormatError(format!(
            "Failed to parse image config {}: {}",
            path.display(),
            e
        ))
    })?;

    if !config.is_object() {
        return Err(FlattenError::FormatError(format!(
            "Image config {} is not a JSON object",
            path.display()
        )));
    }

    Ok(config)
}

/// Replace the lineage fields of `config` with a single-layer description.
///
/// `diff_id` is the prefixed digest (`sha256:<hex>`) of the flattened layer.
pub fn rewrite_config(mut config: Value, diff_id: &str, created: &str) -> Result<Value> {
    let fields = config.as_object_mut().ok_or_else(|| {
        FlattenError::FormatError("Image config is not a JSON object".to_string())
    })?;

    for field in LINEAGE_FIELDS {
        fields.remove(*field);
    }

    fields.insert(
        "rootfs".to_string(),
        serde_json::to_value(RootFs::single_layer(diff_id))?,
    );
    fields.insert(
        "history".to_string(),
        serde_json::to_value(vec![HistoryEntry {
            created: created.to_string(),
            comment: FLATTEN_COMMENT.to_string(),
        }])?,
    );

    Ok(config)
}

/// Write a config document as compact UTF-8 JSON.
pub fn write_config(config: &Value, path: &Path) -> Result<()> {
    let bytes = serde_json::to_vec(config)?;
    std::fs::write(path, bytes).map_err(|e| {
        FlattenError::ArchiveError(format!(
            "Failed to write image config {}: {}",
            path.display(),
            e
        ))
    })
}
