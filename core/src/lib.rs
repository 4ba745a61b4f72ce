//! monolayer core - foundational types shared by the flattening engine and CLI.
//!
//! Provides the error taxonomy and the immutable run configuration.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{FlattenConfig, CONFIG_FILE_NAME, LAYER_FILE_NAME};
pub use error::{FlattenError, Result};

/// monolayer version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
