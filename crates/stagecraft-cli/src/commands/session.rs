//! Session management commands

use anyhow::Result;
use clap::Subcommand;
use serde_json::json;
use stagecraft_session::{generate_session_id, SessionArtifactStore};

#[derive(Subcommand)]
pub enum SessionCommands {
    /// Create a session directory
    Create {
        /// Session ID (generated when omitted)
        id: Option<String>,

        /// Replace an existing non-empty session
        #[arg(long)]
        overwrite: bool,
    },

    /// List sessions under the root
    List,
}

pub fn run(store: &SessionArtifactStore, cmd: SessionCommands) -> Result<serde_json::Value> {
    match cmd {
        SessionCommands::Create { id, overwrite } => {
            let id = id.unwrap_or_else(generate_session_id);
            let handle = store.create_session(&id, overwrite)?;
            Ok(json!({
                "success": true,
                "session_id": handle.id,
                "session_dir": handle.dir,
            }))
        }
        SessionCommands::List => {
            let sessions = store.list_sessions()?;
            Ok(json!({
                "success": true,
                "root": store.root(),
                "sessions": sessions,
            }))
        }
    }
}
