//! Bounded concurrent generation for many objects
//!
//! One task per object, at most `max_parallel` in flight. Attempts for a
//! single object stay sequential inside the orchestrator; only distinct
//! objects overlap.

use crate::backend::GenerationRequest;
use crate::orchestrator::{BackendOrchestrator, BackendPriority};
use stagecraft_core::{Result, StagecraftError};
use serde_json::Value;
use stagecraft_session::{AssetManifest, AssetMetadata, ManifestEntry, SessionHandle};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Summary of a batch run
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// One entry per requested object, in request order
    pub results: Vec<AssetMetadata>,
    pub succeeded: usize,
    pub failed: usize,
    pub total_time_sec: f64,
    pub success_rate: f64,
}

impl BatchReport {
    fn from_results(results: Vec<AssetMetadata>, total_time_sec: f64) -> Self {
        let succeeded = results.iter().filter(|m| m.is_success()).count();
        let failed = results.len() - succeeded;
        let success_rate = if results.is_empty() {
            0.0
        } else {
            succeeded as f64 / results.len() as f64
        };
        Self {
            results,
            succeeded,
            failed,
            total_time_sec,
            success_rate,
        }
    }

    pub fn successes(&self) -> impl Iterator<Item = &AssetMetadata> {
        self.results.iter().filter(|m| m.is_success())
    }
}

/// Generate every request, at most `max_parallel` at a time.
///
/// Duplicate object IDs are rejected up front: concurrent generation of the
/// same object is not safe. An object whose generation errors out is
/// reported as failed; the rest of the batch carries on.
pub async fn generate_batch(
    orchestrator: Arc<BackendOrchestrator>,
    session: &SessionHandle,
    requests: Vec<GenerationRequest>,
    priority: &BackendPriority,
    max_parallel: usize,
) -> Result<BatchReport> {
    let mut seen = HashSet::new();
    for request in &requests {
        if !seen.insert(request.object_id.as_str()) {
            return Err(StagecraftError::Validation(format!(
                "Duplicate object id '{}' in batch",
                request.object_id
            )));
        }
    }

    let start = Instant::now();
    let total = requests.len();
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut tasks = JoinSet::new();

    info!(session_id = %session.id, objects = total, max_parallel, %priority, "Starting batch generation");

    for (index, request) in requests.into_iter().enumerate() {
        let orchestrator = Arc::clone(&orchestrator);
        let semaphore = Arc::clone(&semaphore);
        let session = session.clone();
        let priority = priority.clone();

        tasks.spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => orchestrator.generate_asset(&session, &request, &priority).await,
                Err(e) => Err(StagecraftError::Validation(format!("worker pool closed: {}", e))),
            };
            let metadata = outcome.unwrap_or_else(|e| {
                warn!(object_id = %request.object_id, "Generation errored: {}", e);
                AssetMetadata::failed(&request.object_id, "", "", 0.0, &e.to_string(), request.describe())
            });
            (index, metadata)
        });
    }

    let mut slots: Vec<Option<AssetMetadata>> = vec![None; total];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, metadata)) => slots[index] = Some(metadata),
            Err(e) => warn!("Generation task aborted: {}", e),
        }
    }

    let results: Vec<AssetMetadata> = slots.into_iter().flatten().collect();
    let report = BatchReport::from_results(results, start.elapsed().as_secs_f64());
    info!(
        session_id = %session.id,
        succeeded = report.succeeded,
        failed = report.failed,
        total_time_sec = report.total_time_sec,
        "Batch generation finished"
    );
    Ok(report)
}

/// Manifest covering the successful results, paths relative to the session
pub fn manifest_from_metadata<'a, I>(results: I, session: &SessionHandle) -> Result<AssetManifest>
where
    I: IntoIterator<Item = &'a AssetMetadata>,
{
    let mut entries = BTreeMap::new();
    for metadata in results.into_iter().filter(|m| m.is_success()) {
        entries.insert(
            metadata.object_id.clone(),
            ManifestEntry::from_metadata(metadata, &session.dir)?,
        );
    }

    let mut manifest = AssetManifest::new();
    for (object_id, entry) in entries {
        manifest.insert(&object_id, entry);
    }
    Ok(manifest)
}

/// Requests from an `objects.json` document: `{"objects": [{...}]}`.
///
/// Each object needs an `object_id`. The prompt is taken from `prompt`,
/// then `description`, then `name`. `style`, `target_size` (three numbers)
/// and `image_url` are optional.
pub fn requests_from_objects(doc: &Value) -> Result<Vec<GenerationRequest>> {
    let objects = doc
        .get("objects")
        .and_then(Value::as_array)
        .ok_or_else(|| StagecraftError::schema("objects", "objects", "expected an array of objects"))?;

    let mut requests = Vec::with_capacity(objects.len());
    for (i, object) in objects.iter().enumerate() {
        let field = |name: &str| object.get(name).and_then(Value::as_str).map(str::to_string);

        let object_id = field("object_id").ok_or_else(|| {
            StagecraftError::schema("objects", format!("objects[{}].object_id", i), "missing or not a string")
        })?;
        let prompt = field("prompt")
            .or_else(|| field("description"))
            .or_else(|| field("name"))
            .ok_or_else(|| {
                StagecraftError::schema("objects", format!("objects[{}].prompt", i), "no prompt, description or name")
            })?;

        let mut request = GenerationRequest::new(&object_id, &prompt);
        request.style = field("style");
        request.image_url = field("image_url");
        if let Some(size) = object.get("target_size") {
            request.target_size = Some(parse_size(size).ok_or_else(|| {
                StagecraftError::schema("objects", format!("objects[{}].target_size", i), "expected three numbers")
            })?);
        }
        requests.push(request);
    }
    Ok(requests)
}

fn parse_size(value: &Value) -> Option<[f64; 3]> {
    let arr = value.as_array()?;
    if arr.len() != 3 {
        return None;
    }
    Some([arr[0].as_f64()?, arr[1].as_f64()?, arr[2].as_f64()?])
}
