//! Batch generation from an objects file

use super::{load_orchestrator, BackendArgs};
use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use stagecraft_gen::{generate_batch, manifest_from_metadata, requests_from_objects, BackendPriority};
use stagecraft_session::SessionArtifactStore;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct BatchArgs {
    /// Session ID
    #[arg(long)]
    pub session: String,

    /// Objects file (defaults to the session's objects.json)
    #[arg(long)]
    pub objects: Option<String>,

    /// Maximum concurrent generations (defaults to the configured value)
    #[arg(long)]
    pub max_parallel: Option<usize>,

    #[command(flatten)]
    pub backend: BackendArgs,
}

pub async fn run(store: &SessionArtifactStore, args: BatchArgs) -> Result<serde_json::Value> {
    let session = store
        .open_session(&args.session)
        .with_context(|| format!("opening session '{}'", args.session))?;
    let priority = BackendPriority::parse(&args.backend.backend)?;

    let doc = match &args.objects {
        Some(path) => {
            let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
            serde_json::from_str(&content).with_context(|| format!("parsing {}", path))?
        }
        None => store.read_objects(&session)?,
    };
    let requests = requests_from_objects(&doc)?;

    let (config, orchestrator) = load_orchestrator()?;
    let max_parallel = args.max_parallel.unwrap_or(config.generation.max_parallel);
    let report = generate_batch(Arc::new(orchestrator), &session, requests, &priority, max_parallel).await?;

    let generated = manifest_from_metadata(report.successes(), &session)?;
    let manifest_path = store.update_manifest(&session, |manifest| {
        for (object_id, entry) in generated.assets {
            manifest.insert(&object_id, entry);
        }
        Ok(())
    })?;

    Ok(json!({
        "success": report.failed == 0,
        "session_id": session.id,
        "succeeded": report.succeeded,
        "failed": report.failed,
        "success_rate": report.success_rate,
        "total_time_sec": report.total_time_sec,
        "results": report.results,
        "manifest_path": manifest_path,
    }))
}
