//! Assemble a session and run the script in the authoring tool

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use stagecraft_bridge::{assemble_session, dispatch, ExecutorEndpoint};
use stagecraft_core::StagecraftError;
use stagecraft_gen::StagecraftConfig;
use stagecraft_session::SessionArtifactStore;
use std::time::Duration;

#[derive(Args, Debug)]
pub struct DispatchArgs {
    /// Session ID
    #[arg(long)]
    pub session: String,

    /// Authoring tool executable (defaults to the configured one)
    #[arg(long)]
    pub executable: Option<String>,

    /// Kill the tool after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Reset the scene before importing
    #[arg(long)]
    pub clear_scene: bool,
}

pub async fn run(store: &SessionArtifactStore, args: DispatchArgs) -> Result<serde_json::Value> {
    let session = store
        .open_session(&args.session)
        .with_context(|| format!("opening session '{}'", args.session))?;
    let config = StagecraftConfig::load()?;

    let executable = args.executable.unwrap_or(config.assembly.executable);
    let timeout = Duration::from_secs(args.timeout_secs.unwrap_or(config.assembly.timeout_secs));
    let endpoint = ExecutorEndpoint::blender(executable, timeout);

    let script = assemble_session(store, &session, args.clear_scene)?;
    match dispatch(&script, &endpoint).await {
        Ok(report) => Ok(json!({
            "success": true,
            "session_id": session.id,
            "report": report,
        })),
        Err(StagecraftError::Execution {
            message,
            exit_code,
            stderr,
        }) => Ok(json!({
            "success": false,
            "session_id": session.id,
            "error": message,
            "error_kind": "execution",
            "exit_code": exit_code,
            "stderr": stderr,
        })),
        Err(e) => Err(e.into()),
    }
}
