use std::path::{Path, PathBuf};

use crate::error::{FlattenError, Result};

/// File name of the flattened layer archive, before the prefix is applied.
pub const LAYER_FILE_NAME: &str = "layer.tar";

/// File name of the rewritten image config, before the prefix is applied.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Settings for one flatten run.
///
/// Built once from the command line and handed to every stage; nothing
/// reads these values from process state after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenConfig {
    /// Image export archive (`docker save` output)
    input: PathBuf,

    /// Directory receiving the two artifacts
    output_dir: PathBuf,

    /// Prepended verbatim to both artifact file names
    prefix: String,
}

impl FlattenConfig {
    /// Validate and build a run configuration.
    ///
    /// # Errors
    ///
    /// Returns `InputError` if:
    /// - `input` is not an existing regular file
    /// - `output_dir` is not an existing directory
    pub fn new(
        input: impl Into<PathBuf>,
        output_dir: impl AsRef<Path>,
        prefix: Option<String>,
    ) -> Result<Self> {
        let input = input.into();
        if !input.is_file() {
            return Err(FlattenError::InputError(format!(
                "Input must be a tar file: {}",
                input.display()
            )));
        }

        let output_dir = normalize_dir(output_dir.as_ref());
        if !output_dir.is_dir() {
            return Err(FlattenError::InputError(format!(
                "Output must be a directory: {}",
                output_dir.display()
            )));
        }

        Ok(Self {
            input,
            output_dir,
            prefix: prefix.unwrap_or_default(),
        })
    }

    /// Path of the image export archive.
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// Output directory, without trailing separators.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Artifact file name prefix (may be empty).
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Destination of the flattened layer: `<output_dir>/<prefix>layer.tar`.
    pub fn layer_output_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}{}", self.prefix, LAYER_FILE_NAME))
    }

    /// Destination of the rewritten config: `<output_dir>/<prefix>config.json`.
    pub fn config_output_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("{}{}", self.prefix, CONFIG_FILE_NAME))
    }
}

/// Drop trailing separators (and repeated ones) from a directory path.
fn normalize_dir(path: &Path) -> PathBuf {
    path.components().collect()
}
