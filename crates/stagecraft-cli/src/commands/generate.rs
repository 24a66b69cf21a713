//! Single-object generation

use super::{load_orchestrator, BackendArgs};
use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use stagecraft_gen::{BackendPriority, GenerationRequest};
use stagecraft_session::{ManifestEntry, SessionArtifactStore};
use tracing::info;

#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Session ID
    #[arg(long)]
    pub session: String,

    /// Object ID (also the asset file stem)
    #[arg(long)]
    pub object: String,

    /// Text prompt describing the object
    #[arg(long, short)]
    pub prompt: String,

    /// Style hint appended to the prompt
    #[arg(long)]
    pub style: Option<String>,

    /// Target size in metres (comma-separated x,y,z)
    #[arg(long, value_parser = parse_vec3)]
    pub size: Option<[f64; 3]>,

    /// Hosted reference image
    #[arg(long)]
    pub image_url: Option<String>,

    /// Local reference image, uploaded to backends that accept one
    #[arg(long)]
    pub image: Option<String>,

    #[command(flatten)]
    pub backend: BackendArgs,
}

pub(crate) fn parse_vec3(s: &str) -> Result<[f64; 3], String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 3 {
        return Err(format!("expected 3 comma-separated values, got {}", parts.len()));
    }
    let x: f64 = parts[0].trim().parse().map_err(|e| format!("invalid x: {}", e))?;
    let y: f64 = parts[1].trim().parse().map_err(|e| format!("invalid y: {}", e))?;
    let z: f64 = parts[2].trim().parse().map_err(|e| format!("invalid z: {}", e))?;
    Ok([x, y, z])
}

pub async fn run(store: &SessionArtifactStore, args: GenerateArgs) -> Result<serde_json::Value> {
    let session = store
        .open_session(&args.session)
        .with_context(|| format!("opening session '{}'", args.session))?;
    let priority = BackendPriority::parse(&args.backend.backend)?;
    let (_, orchestrator) = load_orchestrator()?;

    let mut request = GenerationRequest::new(&args.object, &args.prompt);
    request.style = args.style;
    request.target_size = args.size;
    request.image_url = args.image_url;
    request.image_path = args.image.map(Into::into);

    let metadata = orchestrator.generate_asset(&session, &request, &priority).await?;

    let manifest_path = if metadata.is_success() {
        let entry = ManifestEntry::from_metadata(&metadata, &session.dir)?;
        let path = store.update_manifest(&session, |manifest| {
            manifest.insert(&metadata.object_id, entry);
            Ok(())
        })?;
        info!(object_id = %metadata.object_id, manifest = %path.display(), "Manifest updated");
        Some(path)
    } else {
        None
    };

    Ok(json!({
        "success": metadata.is_success(),
        "session_id": session.id,
        "asset": metadata,
        "manifest_path": manifest_path,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vec3() {
        assert_eq!(parse_vec3("0.5, 1,2").unwrap(), [0.5, 1.0, 2.0]);
        assert!(parse_vec3("1,2").is_err());
        assert!(parse_vec3("1,x,2").is_err());
    }
}
