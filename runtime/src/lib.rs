//! monolayer runtime - flattens a multi-layer image export into one layer.
//!
//! This crate holds the merge engine: manifest lookup, ordered layer overlay,
//! deterministic repackaging and image config rewriting, plus the
//! [`Flattener`] pipeline tying them together.

pub mod flatten;
pub mod oci;

// Re-export common types
pub use flatten::{Flattener, FlattenReport};
pub use oci::{ManifestEntry, OverlayStats, PackagedLayer};

/// monolayer runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
