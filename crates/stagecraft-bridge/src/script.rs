//! Assembly script: a minimal instruction set rendered as Blender Python
//!
//! For every placed object the script imports the mesh, renames the
//! imported root to the object ID, and applies position, Euler rotation and
//! scale in that order. Objects are emitted in sorted object-ID order so the
//! same artifacts always produce the same script.

use serde::{Deserialize, Serialize};
use stagecraft_core::{atomic_write, Result, StagecraftError};
use stagecraft_session::{AssetManifest, LayoutSolution, ObjectMap, SessionArtifactStore, SessionHandle};
use std::fmt;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

pub const SCRIPT_FILE: &str = "assembly_script.py";
pub const SCENE_FILE: &str = "blender_scene.blend";

/// Mesh formats the authoring tool can import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportFormat {
    Glb,
    Gltf,
    Fbx,
    Obj,
}

impl ImportFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "glb" => Some(ImportFormat::Glb),
            "gltf" => Some(ImportFormat::Gltf),
            "fbx" => Some(ImportFormat::Fbx),
            "obj" => Some(ImportFormat::Obj),
            _ => None,
        }
    }
}

impl fmt::Display for ImportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportFormat::Glb => write!(f, "glb"),
            ImportFormat::Gltf => write!(f, "gltf"),
            ImportFormat::Fbx => write!(f, "fbx"),
            ImportFormat::Obj => write!(f, "obj"),
        }
    }
}

/// One step of the assembly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    ClearScene,
    Import {
        object_id: String,
        path: PathBuf,
        format: ImportFormat,
    },
    Rename {
        object_id: String,
        name: String,
    },
    SetTransform {
        object_id: String,
        location: [f64; 3],
        rotation_euler: [f64; 3],
        scale: [f64; 3],
    },
    SaveScene {
        path: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct AssemblyOptions {
    /// Directory that manifest `asset_path`s are relative to
    pub session_dir: PathBuf,
    /// Reset the scene before importing
    pub clear_scene: bool,
    /// Where the assembled scene is saved; defaults to `blender_scene.blend`
    /// in the session directory
    pub output_path: Option<PathBuf>,
    /// Fail with `NotFound` when a referenced asset file is absent
    pub require_files: bool,
}

impl AssemblyOptions {
    pub fn for_session(session_dir: &Path) -> Self {
        Self {
            session_dir: session_dir.to_path_buf(),
            clear_scene: false,
            output_path: None,
            require_files: true,
        }
    }
}

/// Generated, immutable instruction list
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyScript {
    instructions: Vec<Instruction>,
    output_path: PathBuf,
}

/// Build the assembly script for a session's artifacts.
///
/// Every placed object must have a manifest entry, and every object-map key
/// must have one too; otherwise this fails with `MissingAsset` naming the
/// object. Nothing is ever skipped.
pub fn build_assembly_script(
    manifest: &AssetManifest,
    layout: &LayoutSolution,
    object_map: &ObjectMap,
    options: &AssemblyOptions,
) -> Result<AssemblyScript> {
    if !layout.success {
        return Err(StagecraftError::schema(
            "layout_solution",
            "success",
            "layout solver reported failure; refusing to assemble",
        ));
    }

    for object_id in object_map.mapping.keys() {
        if !manifest.contains(object_id) {
            return Err(StagecraftError::MissingAsset {
                object_id: object_id.clone(),
            });
        }
    }

    let mut instructions = Vec::with_capacity(layout.object_placements.len() * 3 + 2);
    if options.clear_scene {
        instructions.push(Instruction::ClearScene);
    }

    // BTreeMap iteration gives sorted object IDs
    for (object_id, placement) in &layout.object_placements {
        let entry = manifest.get(object_id).ok_or_else(|| StagecraftError::MissingAsset {
            object_id: object_id.clone(),
        })?;

        let format = ImportFormat::parse(&entry.format).ok_or_else(|| {
            StagecraftError::schema(
                "asset_manifest",
                format!("assets.{}.format", object_id),
                format!("unsupported import format '{}'", entry.format),
            )
        })?;

        let path = resolve_asset_path(&options.session_dir, &entry.asset_path);
        if options.require_files && !path.is_file() {
            return Err(StagecraftError::NotFound(path));
        }

        for (field, v) in [
            ("pos", placement.pos),
            ("rot_euler", placement.rot_euler),
            ("scale", placement.scale),
        ] {
            if v.iter().any(|c| !c.is_finite()) {
                return Err(StagecraftError::schema(
                    "layout_solution",
                    format!("object_placements.{}.{}", object_id, field),
                    "non-finite component",
                ));
            }
        }

        instructions.push(Instruction::Import {
            object_id: object_id.clone(),
            path,
            format,
        });
        instructions.push(Instruction::Rename {
            object_id: object_id.clone(),
            name: object_map.naming_convention.object_name(object_id).to_string(),
        });
        instructions.push(Instruction::SetTransform {
            object_id: object_id.clone(),
            location: placement.pos,
            rotation_euler: placement.rot_euler,
            scale: placement.scale,
        });
    }

    let output_path = options
        .output_path
        .clone()
        .unwrap_or_else(|| options.session_dir.join(SCENE_FILE));
    instructions.push(Instruction::SaveScene {
        path: output_path.clone(),
    });

    Ok(AssemblyScript {
        instructions,
        output_path,
    })
}

/// Read the three artifacts of a session and build its script
pub fn assemble_session(
    store: &SessionArtifactStore,
    session: &SessionHandle,
    clear_scene: bool,
) -> Result<AssemblyScript> {
    let manifest = store.read_manifest(session)?;
    let layout = store.read_layout(session)?;
    let object_map = store.read_object_map(session)?;
    let mut options = AssemblyOptions::for_session(&session.dir);
    options.clear_scene = clear_scene;
    build_assembly_script(&manifest, &layout, &object_map, &options)
}

fn resolve_asset_path(session_dir: &Path, asset_path: &str) -> PathBuf {
    let p = Path::new(asset_path);
    let joined = if p.is_absolute() {
        p.to_path_buf()
    } else {
        session_dir.join(p)
    };
    std::path::absolute(&joined).unwrap_or(joined)
}

impl AssemblyScript {
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// The scene file the script saves; its existence signals success
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Object IDs in the order they are imported
    pub fn object_ids(&self) -> Vec<&str> {
        self.instructions
            .iter()
            .filter_map(|i| match i {
                Instruction::Import { object_id, .. } => Some(object_id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Render as a Blender Python script. All strings are emitted as
    /// escaped literals; the script exits non-zero on the first error.
    pub fn render_python(&self) -> String {
        let mut out = String::new();
        out.push_str(PYTHON_PRELUDE);
        out.push_str("\ntry:\n");
        for instruction in &self.instructions {
            let line = render_instruction(instruction);
            let _ = writeln!(out, "    {}", line);
        }
        out.push_str(PYTHON_EPILOGUE);
        out
    }

    /// Write `assembly_script.py` into `dir`, replacing any earlier one
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(SCRIPT_FILE);
        atomic_write(&path, self.render_python().as_bytes())?;
        Ok(path)
    }
}

const PYTHON_PRELUDE: &str = r#"# Generated by stagecraft. Do not edit.
import sys

import bpy

objects = {}


def _clear_scene():
    bpy.ops.wm.read_factory_settings(use_empty=True)


def _import(path, fmt):
    before = set(bpy.data.objects)
    if fmt in ("glb", "gltf"):
        bpy.ops.import_scene.gltf(filepath=path)
    elif fmt == "fbx":
        bpy.ops.import_scene.fbx(filepath=path)
    elif fmt == "obj":
        bpy.ops.wm.obj_import(filepath=path)
    else:
        raise RuntimeError("unsupported format " + fmt)
    new = [o for o in bpy.data.objects if o not in before]
    roots = [o for o in new if o.parent is None or o.parent not in new]
    if not roots:
        raise RuntimeError("nothing imported from " + path)
    if len(roots) == 1:
        return roots[0]
    root = bpy.data.objects.new("import_root", None)
    bpy.context.scene.collection.objects.link(root)
    for o in roots:
        o.parent = root
    return root


def _rename(object_id, name):
    obj = objects[object_id]
    obj.name = name
    if obj.name != name:
        raise RuntimeError("name already taken: " + name)


def _transform(object_id, location, rotation, scale):
    obj = objects[object_id]
    obj.location = location
    obj.rotation_mode = "XYZ"
    obj.rotation_euler = rotation
    obj.scale = scale


def _save(path):
    bpy.ops.wm.save_as_mainfile(filepath=path)

"#;

const PYTHON_EPILOGUE: &str = r#"except Exception as exc:
    print("stagecraft assembly failed: %s" % exc, file=sys.stderr)
    sys.exit(1)
"#;

fn render_instruction(instruction: &Instruction) -> String {
    match instruction {
        Instruction::ClearScene => "_clear_scene()".to_string(),
        Instruction::Import {
            object_id,
            path,
            format,
        } => format!(
            "objects[{}] = _import({}, {})",
            py_str(object_id),
            py_str(&path.to_string_lossy()),
            py_str(&format.to_string())
        ),
        Instruction::Rename { object_id, name } => {
            format!("_rename({}, {})", py_str(object_id), py_str(name))
        }
        Instruction::SetTransform {
            object_id,
            location,
            rotation_euler,
            scale,
        } => format!(
            "_transform({}, {}, {}, {})",
            py_str(object_id),
            py_vec3(location),
            py_vec3(rotation_euler),
            py_vec3(scale)
        ),
        Instruction::SaveScene { path } => format!("_save({})", py_str(&path.to_string_lossy())),
    }
}

/// JSON string literals are valid Python string literals
fn py_str(s: &str) -> String {
    serde_json::Value::from(s).to_string()
}

fn py_vec3(v: &[f64; 3]) -> String {
    format!("({:?}, {:?}, {:?})", v[0], v[1], v[2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagecraft_session::{AssetMetadata, ManifestEntry, Placement};

    fn session_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("stagecraft_script_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("assets")).unwrap();
        dir
    }

    fn manifest_with(dir: &Path, ids: &[&str]) -> AssetManifest {
        let mut manifest = AssetManifest::new();
        for id in ids {
            let rel = format!("assets/{}.glb", id);
            std::fs::write(dir.join(&rel), b"glTF").unwrap();
            manifest.insert(
                id,
                ManifestEntry {
                    asset_path: rel.clone(),
                    format: "glb".to_string(),
                    size_bytes: 4,
                    checksum: "sha256:00".to_string(),
                    metadata: AssetMetadata::success(id, "mock", "mock-1", &rel, 0.1, 4, Default::default()),
                },
            );
        }
        manifest
    }

    #[test]
    fn test_single_chair_yields_import_rename_transform() {
        let dir = session_dir();
        let manifest = manifest_with(&dir, &["chair_1"]);
        let mut layout = LayoutSolution::new(true);
        layout.place(
            "chair_1",
            Placement {
                pos: [0.0, 0.0, 0.0],
                rot_euler: [0.0, 0.0, 0.0],
                scale: [1.0, 1.0, 1.0],
            },
        );
        let map = ObjectMap::identity(["chair_1"]);

        let script = build_assembly_script(&manifest, &layout, &map, &AssemblyOptions::for_session(&dir)).unwrap();
        let ops = script.instructions();
        assert_eq!(ops.len(), 4);
        assert!(matches!(&ops[0], Instruction::Import { object_id, format: ImportFormat::Glb, .. } if object_id == "chair_1"));
        assert!(matches!(&ops[1], Instruction::Rename { name, .. } if name == "chair_1"));
        assert!(matches!(
            &ops[2],
            Instruction::SetTransform { location, scale, .. } if *location == [0.0; 3] && *scale == [1.0; 3]
        ));
        assert!(matches!(&ops[3], Instruction::SaveScene { .. }));
        assert_eq!(script.output_path(), dir.join(SCENE_FILE));

        let py = script.render_python();
        assert_eq!(py.matches("objects[\"chair_1\"] = _import(").count(), 1);
        assert_eq!(py.matches("_rename(\"chair_1\", \"chair_1\")").count(), 1);
        assert_eq!(py.matches("_transform(\"chair_1\", (0.0, 0.0, 0.0), (0.0, 0.0, 0.0), (1.0, 1.0, 1.0))").count(), 1);
        let import_at = py.find("= _import(").unwrap();
        let rename_at = py.find("_rename(\"chair_1\"").unwrap();
        let transform_at = py.find("_transform(\"chair_1\"").unwrap();
        assert!(import_at < rename_at && rename_at < transform_at);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_placement_without_asset_fails_naming_object() {
        let dir = session_dir();
        let manifest = manifest_with(&dir, &["table"]);
        let mut layout = LayoutSolution::new(true);
        layout.place("table", Placement::default());
        layout.place("lamp_3", Placement::default());
        let map = ObjectMap::identity(["table"]);

        match build_assembly_script(&manifest, &layout, &map, &AssemblyOptions::for_session(&dir)) {
            Err(StagecraftError::MissingAsset { object_id }) => assert_eq!(object_id, "lamp_3"),
            other => panic!("expected MissingAsset, got {other:?}"),
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_mapping_key_without_asset_fails() {
        let dir = session_dir();
        let manifest = manifest_with(&dir, &["table"]);
        let layout = LayoutSolution::new(true);
        let map = ObjectMap::identity(["table", "ghost"]);

        let err = build_assembly_script(&manifest, &layout, &map, &AssemblyOptions::for_session(&dir)).unwrap_err();
        assert!(matches!(err, StagecraftError::MissingAsset { object_id } if object_id == "ghost"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_failed_layout_is_refused() {
        let dir = session_dir();
        let manifest = manifest_with(&dir, &[]);
        let err = build_assembly_script(
            &manifest,
            &LayoutSolution::new(false),
            &ObjectMap::identity(Vec::<String>::new()),
            &AssemblyOptions::for_session(&dir),
        )
        .unwrap_err();
        assert!(matches!(err, StagecraftError::Schema { field, .. } if field == "success"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unsupported_format_is_schema_error() {
        let dir = session_dir();
        let mut manifest = manifest_with(&dir, &["vase"]);
        let mut entry = manifest.get("vase").unwrap().clone();
        entry.format = "usdz".to_string();
        manifest.insert("vase", entry);
        let mut layout = LayoutSolution::new(true);
        layout.place("vase", Placement::default());

        let err = build_assembly_script(&manifest, &layout, &ObjectMap::identity(["vase"]), &AssemblyOptions::for_session(&dir))
            .unwrap_err();
        assert!(matches!(err, StagecraftError::Schema { field, .. } if field == "assets.vase.format"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_objects_sorted_and_strings_escaped() {
        let dir = session_dir();
        let manifest = manifest_with(&dir, &["b\"q", "a"]);
        let mut layout = LayoutSolution::new(true);
        layout.place("b\"q", Placement::default());
        layout.place("a", Placement::default());
        let mut options = AssemblyOptions::for_session(&dir);
        options.clear_scene = true;

        let script = build_assembly_script(&manifest, &layout, &ObjectMap::identity(["a"]), &options).unwrap();
        assert_eq!(script.object_ids(), vec!["a", "b\"q"]);
        assert_eq!(script.instructions()[0], Instruction::ClearScene);
        assert!(script.render_python().contains(r#"_rename("b\"q", "b\"q")"#));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_asset_file_is_not_found() {
        let dir = session_dir();
        let manifest = manifest_with(&dir, &["sofa"]);
        std::fs::remove_file(dir.join("assets/sofa.glb")).unwrap();
        let mut layout = LayoutSolution::new(true);
        layout.place("sofa", Placement::default());

        let err = build_assembly_script(&manifest, &layout, &ObjectMap::identity(["sofa"]), &AssemblyOptions::for_session(&dir))
            .unwrap_err();
        assert!(matches!(err, StagecraftError::NotFound(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_save_writes_script_file() {
        let dir = session_dir();
        let script = build_assembly_script(
            &manifest_with(&dir, &[]),
            &LayoutSolution::new(true),
            &ObjectMap::identity(Vec::<String>::new()),
            &AssemblyOptions::for_session(&dir),
        )
        .unwrap();
        let path = script.save(&dir).unwrap();
        assert_eq!(path, dir.join(SCRIPT_FILE));
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# Generated by stagecraft"));
        assert!(content.contains("_save("));
        std::fs::remove_dir_all(&dir).ok();
    }
}
