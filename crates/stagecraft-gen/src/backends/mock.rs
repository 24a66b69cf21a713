//! Scripted, network-free backend
//!
//! Plays back a queue of status responses, counts every call, and serves an
//! in-memory minimal GLB. Used by tests and for offline CLI runs.

use crate::backend::{GenerationBackend, GenerationRequest, QueryResponse, StatusCode};
use crate::config::MOCK;
use async_trait::async_trait;
use stagecraft_core::{Result, StagecraftError};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct MockBackend {
    name: String,
    configured: bool,
    job_id: Option<String>,
    statuses: Mutex<VecDeque<StatusCode>>,
    result_uris: Option<Vec<String>>,
    failure: Option<(String, String)>,
    failing_objects: HashSet<String>,
    submit_errors: AtomicUsize,
    query_errors: AtomicUsize,
    payload: Vec<u8>,
    broken_downloads: HashSet<String>,
    submit_calls: AtomicUsize,
    query_calls: AtomicUsize,
    download_calls: AtomicUsize,
}

impl MockBackend {
    /// A backend that accepts every job and reports success on the first poll
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            configured: true,
            job_id: None,
            statuses: Mutex::new(VecDeque::new()),
            result_uris: None,
            failure: None,
            failing_objects: HashSet::new(),
            submit_errors: AtomicUsize::new(0),
            query_errors: AtomicUsize::new(0),
            payload: minimal_glb(),
            broken_downloads: HashSet::new(),
            submit_calls: AtomicUsize::new(0),
            query_calls: AtomicUsize::new(0),
            download_calls: AtomicUsize::new(0),
        }
    }

    /// Same as `new("mock")`
    pub fn offline() -> Self {
        Self::new(MOCK)
    }

    /// Every submission gets this job id
    pub fn with_job_id(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }

    /// Statuses returned by successive queries before the terminal answer
    pub fn with_statuses(self, statuses: Vec<StatusCode>) -> Self {
        if let Ok(mut queue) = self.statuses.lock() {
            queue.extend(statuses);
        }
        self
    }

    pub fn with_result_uris(mut self, uris: Vec<String>) -> Self {
        self.result_uris = Some(uris);
        self
    }

    /// Every job ends in `Failure` with this code and message
    pub fn always_failing(mut self, code: &str, message: &str) -> Self {
        self.failure = Some((code.to_string(), message.to_string()));
        self
    }

    /// Jobs for this object end in `Failure`; others succeed
    pub fn failing_for(mut self, object_id: &str) -> Self {
        self.failing_objects.insert(object_id.to_string());
        self
    }

    /// `check_config` reports a missing credential
    pub fn unconfigured(mut self) -> Self {
        self.configured = false;
        self
    }

    /// The first `n` submissions fail with a transport error
    pub fn with_submit_errors(self, n: usize) -> Self {
        self.submit_errors.store(n, Ordering::SeqCst);
        self
    }

    /// The first `n` queries fail with a transport error
    pub fn with_query_errors(self, n: usize) -> Self {
        self.query_errors.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Downloads of this URI return an HTML error page instead of the payload
    pub fn with_broken_download(mut self, uri: &str) -> Self {
        self.broken_downloads.insert(uri.to_string());
        self
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.submit_calls() + self.query_calls() + self.download_calls()
    }

    fn take_error(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn check_config(&self) -> Result<()> {
        if self.configured {
            Ok(())
        } else {
            Err(StagecraftError::Configuration(format!(
                "{} backend has no credentials",
                self.name
            )))
        }
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<String> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_error(&self.submit_errors) {
            return Err(StagecraftError::Transport(format!("{}: connection reset", self.name)));
        }

        let job_id = match &self.job_id {
            Some(id) => id.clone(),
            None => format!("{}-{}-{}", self.name, request.object_id, n + 1),
        };
        if self.failing_objects.contains(&request.object_id) {
            return Ok(format!("fail:{}", job_id));
        }
        Ok(job_id)
    }

    async fn query(&self, job_id: &str) -> Result<QueryResponse> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_error(&self.query_errors) {
            return Err(StagecraftError::Transport(format!("{}: poll timed out", self.name)));
        }

        if let Some(status) = self.statuses.lock().ok().and_then(|mut q| q.pop_front()) {
            return Ok(QueryResponse::with_status(status));
        }

        if let Some((code, message)) = &self.failure {
            return Ok(QueryResponse::failure(code, message));
        }
        if job_id.starts_with("fail:") {
            return Ok(QueryResponse::failure("MockFailure", "scripted failure for this object"));
        }

        let uris = self
            .result_uris
            .clone()
            .unwrap_or_else(|| vec![format!("mock://{}/{}.glb", self.name, job_id)]);
        Ok(QueryResponse::success(uris))
    }

    async fn download(&self, uri: &str) -> Result<Vec<u8>> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        if self.broken_downloads.contains(uri) {
            return Ok(b"<html>502 Bad Gateway</html>".to_vec());
        }
        Ok(self.payload.clone())
    }
}

/// Smallest valid glTF 2.0 binary: one triangle
pub fn minimal_glb() -> Vec<u8> {
    let json = serde_json::json!({
        "asset": { "version": "2.0", "generator": "stagecraft-mock" },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": [{ "mesh": 0 }],
        "meshes": [{ "primitives": [{ "attributes": { "POSITION": 0 }, "indices": 1 }] }],
        "accessors": [
            { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
              "max": [1.0, 1.0, 0.0], "min": [-1.0, 0.0, 0.0] },
            { "bufferView": 1, "componentType": 5123, "count": 3, "type": "SCALAR",
              "max": [2], "min": [0] }
        ],
        "bufferViews": [
            { "buffer": 0, "byteOffset": 0, "byteLength": 36, "target": 34962 },
            { "buffer": 0, "byteOffset": 36, "byteLength": 6, "target": 34963 }
        ],
        "buffers": [{ "byteLength": 44 }]
    });

    let mut json_chunk = json.to_string().into_bytes();
    json_chunk.resize((json_chunk.len() + 3) & !3, b' ');

    let vertices: [f32; 9] = [-1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    let indices: [u16; 3] = [0, 1, 2];
    let mut bin_chunk = Vec::with_capacity(44);
    for v in vertices {
        bin_chunk.extend_from_slice(&v.to_le_bytes());
    }
    for i in indices {
        bin_chunk.extend_from_slice(&i.to_le_bytes());
    }
    bin_chunk.resize((bin_chunk.len() + 3) & !3, 0);

    let total_len = 12 + 8 + json_chunk.len() + 8 + bin_chunk.len();
    let mut out = Vec::with_capacity(total_len);
    out.extend_from_slice(b"glTF");
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&(total_len as u32).to_le_bytes());
    out.extend_from_slice(&(json_chunk.len() as u32).to_le_bytes());
    out.extend_from_slice(b"JSON");
    out.extend_from_slice(&json_chunk);
    out.extend_from_slice(&(bin_chunk.len() as u32).to_le_bytes());
    out.extend_from_slice(b"BIN\0");
    out.extend_from_slice(&bin_chunk);
    out
}
