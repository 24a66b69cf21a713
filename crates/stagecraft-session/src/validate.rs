//! Structural validation of session artifacts
//!
//! Runs on the raw JSON value before typed deserialization so that a bad
//! artifact is reported with the path of the offending field.

use serde_json::{Map, Value};
use stagecraft_core::{Result, StagecraftError};

const MANIFEST: &str = "asset_manifest";
const LAYOUT: &str = "layout_solution";
const OBJECT_MAP: &str = "blender_object_map";

/// Validate an `asset_manifest.json` document
pub fn validate_manifest(value: &Value) -> Result<()> {
    let root = require_object(MANIFEST, "", value)?;
    require_str(MANIFEST, root, "version")?;
    require_number(MANIFEST, root, "total_assets")?;
    require_number(MANIFEST, root, "total_size_mb")?;

    let assets = require_field(MANIFEST, root, "assets")?;
    let assets = require_object(MANIFEST, "assets", assets)?;
    for (object_id, entry) in assets {
        let path = format!("assets.{}", object_id);
        let entry = require_object(MANIFEST, &path, entry)?;
        for key in ["asset_path", "format", "checksum"] {
            require_str_at(MANIFEST, &path, entry, key)?;
        }
        let size = entry
            .get("size_bytes")
            .ok_or_else(|| StagecraftError::schema(MANIFEST, format!("{}.size_bytes", path), "missing field"))?;
        if size.as_u64().is_none() {
            return Err(StagecraftError::schema(
                MANIFEST,
                format!("{}.size_bytes", path),
                "expected a non-negative integer",
            ));
        }

        let meta_path = format!("{}.metadata", path);
        let metadata = entry
            .get("metadata")
            .ok_or_else(|| StagecraftError::schema(MANIFEST, meta_path.clone(), "missing field"))?;
        let metadata = require_object(MANIFEST, &meta_path, metadata)?;
        if require_str_at(MANIFEST, &meta_path, metadata, "object_id")? != object_id {
            return Err(StagecraftError::schema(
                MANIFEST,
                format!("{}.object_id", meta_path),
                "does not match the asset key",
            ));
        }
        if require_str_at(MANIFEST, &meta_path, metadata, "status")? != "success" {
            return Err(StagecraftError::schema(
                MANIFEST,
                format!("{}.status", meta_path),
                "only successful assets belong in the manifest",
            ));
        }
    }

    Ok(())
}

/// Validate a `layout_solution_v1.json` document
pub fn validate_layout(value: &Value) -> Result<()> {
    let root = require_object(LAYOUT, "", value)?;
    require_str(LAYOUT, root, "version")?;
    match root.get("success") {
        Some(Value::Bool(_)) => {}
        Some(_) => return Err(StagecraftError::schema(LAYOUT, "success", "expected a boolean")),
        None => return Err(StagecraftError::schema(LAYOUT, "success", "missing field")),
    }

    let placements = require_field(LAYOUT, root, "object_placements")?;
    let placements = require_object(LAYOUT, "object_placements", placements)?;
    for (object_id, placement) in placements {
        let path = format!("object_placements.{}", object_id);
        let placement = require_object(LAYOUT, &path, placement)?;
        for key in ["pos", "rot_euler", "scale"] {
            let field = format!("{}.{}", path, key);
            let v = placement
                .get(key)
                .ok_or_else(|| StagecraftError::schema(LAYOUT, field.clone(), "missing field"))?;
            validate_vec3(LAYOUT, &field, v)?;
        }
    }

    Ok(())
}

/// Validate a `blender_object_map.json` document
pub fn validate_object_map(value: &Value) -> Result<()> {
    let root = require_object(OBJECT_MAP, "", value)?;
    let convention = require_str(OBJECT_MAP, root, "naming_convention")?;
    if convention != "object_name_equals_id" {
        return Err(StagecraftError::schema(
            OBJECT_MAP,
            "naming_convention",
            format!("unsupported convention '{}'", convention),
        ));
    }
    require_str(OBJECT_MAP, root, "description")?;

    let mapping = require_field(OBJECT_MAP, root, "mapping")?;
    let mapping = require_object(OBJECT_MAP, "mapping", mapping)?;
    for (object_id, name) in mapping {
        if !name.is_string() {
            return Err(StagecraftError::schema(
                OBJECT_MAP,
                format!("mapping.{}", object_id),
                "expected a string",
            ));
        }
    }

    Ok(())
}

fn validate_vec3(artifact: &str, field: &str, value: &Value) -> Result<()> {
    let arr = value
        .as_array()
        .ok_or_else(|| StagecraftError::schema(artifact, field, "expected an array of 3 numbers"))?;
    if arr.len() != 3 {
        return Err(StagecraftError::schema(
            artifact,
            field,
            format!("expected exactly 3 elements, found {}", arr.len()),
        ));
    }
    for (i, n) in arr.iter().enumerate() {
        match n.as_f64() {
            Some(f) if f.is_finite() => {}
            _ => {
                return Err(StagecraftError::schema(
                    artifact,
                    format!("{}[{}]", field, i),
                    "expected a finite number",
                ))
            }
        }
    }
    Ok(())
}

fn require_object<'a>(artifact: &str, field: &str, value: &'a Value) -> Result<&'a Map<String, Value>> {
    value.as_object().ok_or_else(|| {
        let field = if field.is_empty() { "<root>" } else { field };
        StagecraftError::schema(artifact, field, "expected an object")
    })
}

fn require_field<'a>(artifact: &str, root: &'a Map<String, Value>, key: &str) -> Result<&'a Value> {
    root.get(key)
        .ok_or_else(|| StagecraftError::schema(artifact, key, "missing field"))
}

fn require_str<'a>(artifact: &str, root: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    require_field(artifact, root, key)?
        .as_str()
        .ok_or_else(|| StagecraftError::schema(artifact, key, "expected a string"))
}

fn require_str_at<'a>(
    artifact: &str,
    prefix: &str,
    obj: &'a Map<String, Value>,
    key: &str,
) -> Result<&'a str> {
    let field = format!("{}.{}", prefix, key);
    obj.get(key)
        .ok_or_else(|| StagecraftError::schema(artifact, field.clone(), "missing field"))?
        .as_str()
        .ok_or_else(|| StagecraftError::schema(artifact, field, "expected a string"))
}

fn require_number(artifact: &str, root: &Map<String, Value>, key: &str) -> Result<()> {
    if require_field(artifact, root, key)?.is_number() {
        Ok(())
    } else {
        Err(StagecraftError::schema(artifact, key, "expected a number"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field_of(err: StagecraftError) -> String {
        match err {
            StagecraftError::Schema { field, .. } => field,
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_layout() {
        let layout = json!({
            "version": "v1",
            "success": true,
            "object_placements": {
                "chair_1": {"pos": [1.0, 2.0, 0.0], "rot_euler": [0, 0, 1.57], "scale": [1, 1, 1]}
            }
        });
        assert!(validate_layout(&layout).is_ok());
    }

    #[test]
    fn test_layout_vec3_must_have_three_elements() {
        let layout = json!({
            "version": "v1",
            "success": true,
            "object_placements": {
                "chair_1": {"pos": [1.0, 2.0], "rot_euler": [0, 0, 0], "scale": [1, 1, 1]}
            }
        });
        let field = field_of(validate_layout(&layout).unwrap_err());
        assert_eq!(field, "object_placements.chair_1.pos");
    }

    #[test]
    fn test_layout_rejects_non_numeric_component() {
        let layout = json!({
            "version": "v1",
            "success": true,
            "object_placements": {
                "lamp": {"pos": [0, 0, 0], "rot_euler": [0, "x", 0], "scale": [1, 1, 1]}
            }
        });
        let field = field_of(validate_layout(&layout).unwrap_err());
        assert_eq!(field, "object_placements.lamp.rot_euler[1]");
    }

    #[test]
    fn test_manifest_missing_checksum() {
        let manifest = json!({
            "version": "v1",
            "assets": {
                "table": {"asset_path": "assets/table.glb", "format": "glb", "size_bytes": 10}
            },
            "total_assets": 1,
            "total_size_mb": 0.0
        });
        let field = field_of(validate_manifest(&manifest).unwrap_err());
        assert_eq!(field, "assets.table.checksum");
    }

    #[test]
    fn test_manifest_entry_requires_provenance() {
        let mut manifest = json!({
            "version": "v1",
            "assets": {
                "table": {"asset_path": "assets/table.glb", "format": "glb", "size_bytes": 10, "checksum": "sha256:00"}
            },
            "total_assets": 1,
            "total_size_mb": 0.0
        });
        assert_eq!(field_of(validate_manifest(&manifest).unwrap_err()), "assets.table.metadata");

        manifest["assets"]["table"]["metadata"] = json!({"object_id": "chair", "status": "success"});
        assert_eq!(
            field_of(validate_manifest(&manifest).unwrap_err()),
            "assets.table.metadata.object_id"
        );

        manifest["assets"]["table"]["metadata"] = json!({"object_id": "table", "status": "failed"});
        assert_eq!(
            field_of(validate_manifest(&manifest).unwrap_err()),
            "assets.table.metadata.status"
        );

        manifest["assets"]["table"]["metadata"] = json!({"object_id": "table", "status": "success"});
        assert!(validate_manifest(&manifest).is_ok());
    }

    #[test]
    fn test_object_map_unknown_convention() {
        let map = json!({
            "naming_convention": "prefix_with_scene",
            "description": "",
            "mapping": {}
        });
        let field = field_of(validate_object_map(&map).unwrap_err());
        assert_eq!(field, "naming_convention");
    }

    #[test]
    fn test_root_must_be_object() {
        let field = field_of(validate_manifest(&json!([])).unwrap_err());
        assert_eq!(field, "<root>");
    }
}
