//! Build the assembly script without running it

use anyhow::{Context, Result};
use serde_json::json;
use stagecraft_bridge::assemble_session;
use stagecraft_session::SessionArtifactStore;

pub fn run(store: &SessionArtifactStore, session_id: &str, clear_scene: bool) -> Result<serde_json::Value> {
    let session = store
        .open_session(session_id)
        .with_context(|| format!("opening session '{}'", session_id))?;
    let script = assemble_session(store, &session, clear_scene)?;
    let script_path = script.save(&session.dir)?;

    Ok(json!({
        "success": true,
        "session_id": session.id,
        "script_path": script_path,
        "objects": script.object_ids(),
        "instructions": script.instructions(),
        "output_path": script.output_path(),
    }))
}
