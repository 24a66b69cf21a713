//! Session-scoped artifact store
//!
//! A session is one directory under the store root:
//!
//! ```text
//! <root>/<session_id>/
//!     assets/                    generated meshes
//!     asset_manifest.json
//!     layout_solution_v1.json
//!     blender_object_map.json
//!     objects.json               (collaborator-owned, read only)
//!     constraints_v1.json        (collaborator-owned, read only)
//! ```
//!
//! Every artifact write goes through [`atomic_write`], so readers never see a
//! partial file. Manifest writes also hold the session's manifest lock, so
//! concurrent generators adding distinct objects through
//! [`SessionArtifactStore::update_manifest`] never lose each other's entries.

use crate::artifacts::{
    AssetManifest, LayoutSolution, ObjectMap, CONSTRAINTS_FILE, LAYOUT_FILE, MANIFEST_FILE,
    OBJECTS_FILE, OBJECT_MAP_FILE,
};
use crate::validate::{validate_layout, validate_manifest, validate_object_map};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use stagecraft_core::{atomic_write, FileLock, Result, StagecraftError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const ASSET_DIR: &str = "assets";
pub const DEFAULT_ROOT: &str = "workspace/sessions";

const MANIFEST_LOCK_FILE: &str = ".asset_manifest.lock";
const MANIFEST_LOCK_WAIT: Duration = Duration::from_secs(30);
/// Longer than any single read-modify-write could take
const MANIFEST_LOCK_STALE: Duration = Duration::from_secs(120);

/// Generate a sortable session identifier: `YYYY-MM-DDTHH-MM-SSZ_<8 hex>`
pub fn generate_session_id() -> String {
    let stamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%SZ");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", stamp, &suffix[..8])
}

/// A located session directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
    pub dir: PathBuf,
}

impl SessionHandle {
    /// Directory that generated asset files are written into
    pub fn asset_dir(&self) -> PathBuf {
        self.dir.join(ASSET_DIR)
    }

    pub fn artifact_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(file_name)
    }
}

/// File-based store rooted at a sessions directory
pub struct SessionArtifactStore {
    root: PathBuf,
}

impl SessionArtifactStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory for session `id`.
    ///
    /// Fails with `AlreadyExists` if the directory exists and is non-empty,
    /// unless `overwrite` is set, in which case its contents are removed.
    pub fn create_session(&self, id: &str, overwrite: bool) -> Result<SessionHandle> {
        validate_session_id(id)?;
        let dir = self.root.join(id);

        if dir.exists() && !is_empty_dir(&dir)? {
            if !overwrite {
                return Err(StagecraftError::AlreadyExists(dir));
            }
            info!(session_id = id, "Overwriting existing session");
            std::fs::remove_dir_all(&dir)?;
        }

        std::fs::create_dir_all(dir.join(ASSET_DIR))?;
        debug!(session_id = id, dir = %dir.display(), "Created session");
        Ok(SessionHandle {
            id: id.to_string(),
            dir,
        })
    }

    /// Locate an existing session
    pub fn open_session(&self, id: &str) -> Result<SessionHandle> {
        validate_session_id(id)?;
        let dir = self.root.join(id);
        if !dir.is_dir() {
            return Err(StagecraftError::NotFound(dir));
        }
        Ok(SessionHandle {
            id: id.to_string(),
            dir,
        })
    }

    /// IDs of all sessions under the root, sorted
    pub fn list_sessions(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !self.root.exists() {
            return Ok(ids);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if !name.starts_with('.') {
                        ids.push(name.to_string());
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn write_manifest(&self, handle: &SessionHandle, manifest: &AssetManifest) -> Result<PathBuf> {
        let _lock = lock_manifest(handle)?;
        write_artifact(handle, MANIFEST_FILE, manifest, validate_manifest)
    }

    /// Read-modify-write of the manifest under the session's manifest lock.
    ///
    /// Starts from an empty manifest when none exists yet. Nothing is written
    /// if `update` fails.
    pub fn update_manifest<F>(&self, handle: &SessionHandle, update: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut AssetManifest) -> Result<()>,
    {
        let _lock = lock_manifest(handle)?;
        let mut manifest = if handle.artifact_path(MANIFEST_FILE).is_file() {
            read_artifact(handle, MANIFEST_FILE, "asset_manifest", validate_manifest)?
        } else {
            AssetManifest::new()
        };
        update(&mut manifest)?;
        write_artifact(handle, MANIFEST_FILE, &manifest, validate_manifest)
    }

    pub fn write_layout(&self, handle: &SessionHandle, layout: &LayoutSolution) -> Result<PathBuf> {
        write_artifact(handle, LAYOUT_FILE, layout, validate_layout)
    }

    pub fn write_object_map(&self, handle: &SessionHandle, map: &ObjectMap) -> Result<PathBuf> {
        write_artifact(handle, OBJECT_MAP_FILE, map, validate_object_map)
    }

    pub fn read_manifest(&self, handle: &SessionHandle) -> Result<AssetManifest> {
        read_artifact(handle, MANIFEST_FILE, "asset_manifest", validate_manifest)
    }

    pub fn read_layout(&self, handle: &SessionHandle) -> Result<LayoutSolution> {
        read_artifact(handle, LAYOUT_FILE, "layout_solution", validate_layout)
    }

    pub fn read_object_map(&self, handle: &SessionHandle) -> Result<ObjectMap> {
        read_artifact(handle, OBJECT_MAP_FILE, "blender_object_map", validate_object_map)
    }

    /// Scene objects written by the extraction stage
    pub fn read_objects(&self, handle: &SessionHandle) -> Result<Value> {
        read_collaborator_file(handle, OBJECTS_FILE, "objects")
    }

    /// Constraint set written by the constraint stage
    pub fn read_constraints(&self, handle: &SessionHandle) -> Result<Value> {
        read_collaborator_file(handle, CONSTRAINTS_FILE, "constraints")
    }
}

fn validate_session_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StagecraftError::Validation(format!(
            "Invalid session id '{}': use letters, digits, '-', '_' or '.'",
            id
        )))
    }
}

fn lock_manifest(handle: &SessionHandle) -> Result<FileLock> {
    FileLock::acquire(
        &handle.artifact_path(MANIFEST_LOCK_FILE),
        MANIFEST_LOCK_WAIT,
        MANIFEST_LOCK_STALE,
    )
}

fn is_empty_dir(dir: &Path) -> Result<bool> {
    Ok(std::fs::read_dir(dir)?.next().is_none())
}

fn write_artifact<T: Serialize>(
    handle: &SessionHandle,
    file_name: &str,
    artifact: &T,
    validate: fn(&Value) -> Result<()>,
) -> Result<PathBuf> {
    let value = serde_json::to_value(artifact)?;
    validate(&value)?;
    let mut content = serde_json::to_string_pretty(&value)?;
    content.push('\n');

    let path = handle.artifact_path(file_name);
    atomic_write(&path, content.as_bytes())?;
    debug!(session_id = %handle.id, artifact = file_name, "Wrote artifact");
    Ok(path)
}

fn read_artifact<T: DeserializeOwned>(
    handle: &SessionHandle,
    file_name: &str,
    artifact: &str,
    validate: fn(&Value) -> Result<()>,
) -> Result<T> {
    let value = read_json(handle, file_name, artifact)?;
    validate(&value)?;
    serde_json::from_value(value).map_err(|e| StagecraftError::schema(artifact, "<root>", e.to_string()))
}

fn read_collaborator_file(handle: &SessionHandle, file_name: &str, artifact: &str) -> Result<Value> {
    let value = read_json(handle, file_name, artifact)?;
    if !value.is_object() {
        return Err(StagecraftError::schema(artifact, "<root>", "expected an object"));
    }
    Ok(value)
}

fn read_json(handle: &SessionHandle, file_name: &str, artifact: &str) -> Result<Value> {
    let path = handle.artifact_path(file_name);
    if !path.is_file() {
        return Err(StagecraftError::NotFound(path));
    }
    let content = std::fs::read_to_string(&path)?;
    serde_json::from_str(&content).map_err(|e| {
        StagecraftError::schema(artifact, "<root>", format!("invalid JSON: {}", e))
    })
}
