//! Stagecraft Session - the on-disk contract between pipeline stages
//!
//! A session is a directory holding generated asset files plus three JSON
//! artifacts (`asset_manifest.json`, `layout_solution_v1.json`,
//! `blender_object_map.json`) that downstream consumers, including the
//! out-of-process scene assembler, read without further coordination.

pub mod artifacts;
pub mod metadata;
pub mod store;
pub mod validate;

pub use artifacts::{
    AssetManifest, LayoutSolution, ManifestEntry, NamingConvention, ObjectMap, Placement,
};
pub use metadata::{AssetMetadata, GenerationStatus};
pub use store::{generate_session_id, SessionArtifactStore, SessionHandle};
