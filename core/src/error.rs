use thiserror::Error;

/// Errors produced while flattening an image export.
///
/// Every variant is fatal for the run: nothing is retried and no partial
/// result is kept.
#[derive(Error, Debug)]
pub enum FlattenError {
    /// Required command-line inputs are missing or malformed
    #[error("Usage error: {0}")]
    UsageError(String),

    /// Input is not a regular file, or output is not a directory
    #[error("Invalid input: {0}")]
    InputError(String),

    /// Manifest or config is unreadable, malformed, or missing a required key
    #[error("Format error: {0}")]
    FormatError(String),

    /// An archive could not be opened, extracted, or written
    #[error("Archive error: {0}")]
    ArchiveError(String),
}

impl FlattenError {
    /// Process exit status for this error.
    ///
    /// Usage errors follow the clap convention (2); everything else exits 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            FlattenError::UsageError(_) => 2,
            _ => 1,
        }
    }
}

impl From<serde_json::Error> for FlattenError {
    fn from(err: serde_json::Error) -> Self {
        FlattenError::FormatError(err.to_string())
    }
}

/// Result type alias for monolayer operations
pub type Result<T> = std::result::Result<T, FlattenError>;
