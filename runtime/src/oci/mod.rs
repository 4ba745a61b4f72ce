//! Image export handling for monolayer.
//!
//! Each stage of the flattening pipeline lives in its own module:
//!
//! - `manifest` — locate and validate `manifest.json`
//! - `layers` — overlay layer archives onto one tree
//! - `package` — serialize the merged tree into one layer archive
//! - `config` — digest the layer and rewrite the image config
//!
//! # Export layout
//!
//! ```text
//! image.tar
//! ├── manifest.json        [{"Config": ..., "Layers": [...]}]
//! ├── <config>.json        image configuration
//! └── <id>/layer.tar       one archive per layer, oldest first
//! ```

pub mod config;
mod layers;
mod manifest;
mod package;

pub use config::{sha256_file, HistoryEntry, RootFs, FLATTEN_COMMENT};
pub use layers::{
    extract_layer, is_whiteout, overlay_layers, restore_owner_access, OverlayStats, WHITEOUT_PREFIX,
};
pub use manifest::{load_manifest, parse_manifest, ManifestEntry, CONFIG_KEYS, LAYER_KEYS};
pub use package::{package_dir, PackagedLayer};
