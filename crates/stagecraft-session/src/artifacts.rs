//! Session artifact types
//!
//! The three artifacts share one object-ID namespace: every key of
//! `LayoutSolution::object_placements` and `ObjectMap::mapping` is expected
//! to be a key of `AssetManifest::assets`. That cross-artifact check belongs
//! to the assembly step, not to these types.

use crate::metadata::AssetMetadata;
use serde::{Deserialize, Serialize};
use stagecraft_core::{ContentHash, Result, StagecraftError};
use std::collections::BTreeMap;
use std::path::Path;

pub const MANIFEST_FILE: &str = "asset_manifest.json";
pub const LAYOUT_FILE: &str = "layout_solution_v1.json";
pub const OBJECT_MAP_FILE: &str = "blender_object_map.json";
/// Written by the scene-extraction stage; read-only here
pub const OBJECTS_FILE: &str = "objects.json";
/// Written by the constraint stage; read-only here
pub const CONSTRAINTS_FILE: &str = "constraints_v1.json";

pub const ARTIFACT_VERSION: &str = "v1";

/// One generated asset as recorded in the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the session directory (e.g. `assets/chair_1.glb`)
    pub asset_path: String,
    pub format: String,
    pub size_bytes: u64,
    /// `sha256:<hex>`
    pub checksum: String,
    /// Provenance of the file: producing backend, job id, parameters
    pub metadata: AssetMetadata,
}

impl ManifestEntry {
    /// Build an entry from a successful generation, reading the asset file
    /// for its size and checksum.
    pub fn from_metadata(metadata: &AssetMetadata, session_dir: &Path) -> Result<Self> {
        if !metadata.is_success() {
            return Err(StagecraftError::Validation(format!(
                "Cannot add failed asset '{}' to the manifest",
                metadata.object_id
            )));
        }

        let local = Path::new(&metadata.local_path);
        let size_bytes = std::fs::metadata(local)
            .map_err(|_| StagecraftError::NotFound(local.to_path_buf()))?
            .len();
        let checksum = ContentHash::from_file(local)?.to_prefixed_hex();

        let asset_path = local
            .strip_prefix(session_dir)
            .unwrap_or(local)
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join("/");

        Ok(Self {
            asset_path,
            format: format_from_path(local),
            size_bytes,
            checksum,
            metadata: metadata.clone(),
        })
    }
}

/// Lowercased file extension, defaulting to `glb`
pub fn format_from_path(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "glb".to_string())
}

/// `asset_manifest.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetManifest {
    pub version: String,
    pub assets: BTreeMap<String, ManifestEntry>,
    pub total_assets: usize,
    pub total_size_mb: f64,
}

impl AssetManifest {
    pub fn new() -> Self {
        Self {
            version: ARTIFACT_VERSION.to_string(),
            assets: BTreeMap::new(),
            total_assets: 0,
            total_size_mb: 0.0,
        }
    }

    /// Insert or replace an entry and refresh the totals
    pub fn insert(&mut self, object_id: &str, entry: ManifestEntry) {
        self.assets.insert(object_id.to_string(), entry);
        self.refresh_totals();
    }

    pub fn get(&self, object_id: &str) -> Option<&ManifestEntry> {
        self.assets.get(object_id)
    }

    pub fn contains(&self, object_id: &str) -> bool {
        self.assets.contains_key(object_id)
    }

    fn refresh_totals(&mut self) {
        let bytes: u64 = self.assets.values().map(|e| e.size_bytes).sum();
        self.total_assets = self.assets.len();
        self.total_size_mb = (bytes as f64 / (1024.0 * 1024.0) * 1000.0).round() / 1000.0;
    }
}

impl Default for AssetManifest {
    fn default() -> Self {
        Self::new()
    }
}

/// Position, Euler rotation (radians) and scale of one placed object
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub pos: [f64; 3],
    pub rot_euler: [f64; 3],
    pub scale: [f64; 3],
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            pos: [0.0; 3],
            rot_euler: [0.0; 3],
            scale: [1.0; 3],
        }
    }
}

/// `layout_solution_v1.json`, produced by the layout solver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutSolution {
    pub version: String,
    pub success: bool,
    pub object_placements: BTreeMap<String, Placement>,
}

impl LayoutSolution {
    pub fn new(success: bool) -> Self {
        Self {
            version: ARTIFACT_VERSION.to_string(),
            success,
            object_placements: BTreeMap::new(),
        }
    }

    pub fn place(&mut self, object_id: &str, placement: Placement) {
        self.object_placements
            .insert(object_id.to_string(), placement);
    }
}

/// How artifact object IDs become object names inside the authoring tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NamingConvention {
    #[serde(rename = "object_name_equals_id")]
    ObjectNameEqualsId,
}

impl NamingConvention {
    pub fn as_str(&self) -> &'static str {
        match self {
            NamingConvention::ObjectNameEqualsId => "object_name_equals_id",
        }
    }

    /// Object name the authoring tool must use for `object_id`
    pub fn object_name<'a>(&self, object_id: &'a str) -> &'a str {
        match self {
            NamingConvention::ObjectNameEqualsId => object_id,
        }
    }
}

/// `blender_object_map.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMap {
    pub naming_convention: NamingConvention,
    pub description: String,
    pub mapping: BTreeMap<String, String>,
}

impl ObjectMap {
    /// Map each ID to itself under `object_name_equals_id`
    pub fn identity<I, S>(object_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mapping = object_ids
            .into_iter()
            .map(|id| (id.as_ref().to_string(), id.as_ref().to_string()))
            .collect();
        Self {
            naming_convention: NamingConvention::ObjectNameEqualsId,
            description: "Object names in the authoring tool equal the artifact object_id"
                .to_string(),
            mapping,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn entry(size: u64) -> ManifestEntry {
        ManifestEntry {
            asset_path: "assets/x.glb".to_string(),
            format: "glb".to_string(),
            size_bytes: size,
            checksum: "sha256:00".to_string(),
            metadata: AssetMetadata::success("x", "mock", "mock-x-1", "assets/x.glb", 0.1, size, BTreeMap::new()),
        }
    }

    #[test]
    fn test_manifest_totals_follow_inserts() {
        let mut manifest = AssetManifest::new();
        manifest.insert("table", entry(1024 * 1024));
        manifest.insert("chair", entry(512 * 1024));
        assert_eq!(manifest.total_assets, 2);
        assert_eq!(manifest.total_size_mb, 1.5);

        manifest.insert("chair", entry(1024 * 1024));
        assert_eq!(manifest.total_assets, 2);
        assert_eq!(manifest.total_size_mb, 2.0);
    }

    #[test]
    fn test_layout_wire_format() {
        let mut layout = LayoutSolution::new(true);
        layout.place("chair_1", Placement::default());
        let json = serde_json::to_value(&layout).unwrap();
        assert_eq!(json["version"], "v1");
        assert_eq!(json["object_placements"]["chair_1"]["rot_euler"][2], 0.0);
        assert_eq!(json["object_placements"]["chair_1"]["scale"][0], 1.0);
    }

    #[test]
    fn test_identity_object_map() {
        let map = ObjectMap::identity(["chair_1", "table"]);
        assert_eq!(map.mapping["chair_1"], "chair_1");
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["naming_convention"], "object_name_equals_id");
    }

    #[test]
    fn test_entry_from_metadata_relative_path() {
        let dir = std::env::temp_dir().join(format!("stagecraft_art_test_{}", uuid::Uuid::new_v4()));
        let assets = dir.join("assets");
        std::fs::create_dir_all(&assets).unwrap();
        let glb = assets.join("chair_1.glb");
        std::fs::write(&glb, b"glTF0000").unwrap();

        let meta = AssetMetadata::success(
            "chair_1",
            "mock",
            "J1",
            &glb.to_string_lossy(),
            1.0,
            8,
            BTreeMap::new(),
        );
        let entry = ManifestEntry::from_metadata(&meta, &dir).unwrap();
        assert_eq!(entry.asset_path, "assets/chair_1.glb");
        assert_eq!(entry.format, "glb");
        assert_eq!(entry.size_bytes, 8);
        assert!(entry.checksum.starts_with("sha256:"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_entry_rejects_failed_metadata() {
        let meta = AssetMetadata::failed("x", "sf3d", "", 0.0, "nope", BTreeMap::new());
        let err = ManifestEntry::from_metadata(&meta, Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, StagecraftError::Validation(_)));
    }
}
