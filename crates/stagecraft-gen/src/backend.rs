//! Generation backend trait and the normalized request/response types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagecraft_core::Result;
use std::collections::BTreeMap;
use std::fmt;

/// What to generate for one scene object. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub object_id: String,
    pub prompt: String,
    #[serde(default)]
    pub style: Option<String>,
    /// Target bounding-box dimensions in metres
    #[serde(default)]
    pub target_size: Option<[f64; 3]>,
    /// Reference image, already hosted
    #[serde(default)]
    pub image_url: Option<String>,
    /// Reference image on local disk (uploaded by backends that accept it)
    #[serde(default)]
    pub image_path: Option<std::path::PathBuf>,
}

impl GenerationRequest {
    pub fn new(object_id: &str, prompt: &str) -> Self {
        Self {
            object_id: object_id.to_string(),
            prompt: prompt.to_string(),
            style: None,
            target_size: None,
            image_url: None,
            image_path: None,
        }
    }

    /// Prompt with the style hint folded in
    pub fn full_prompt(&self) -> String {
        match self.style.as_deref() {
            Some(style) if !style.trim().is_empty() => format!("{}, {} style", self.prompt, style),
            _ => self.prompt.clone(),
        }
    }

    /// Request fields worth recording on the resulting metadata
    pub fn describe(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("prompt".to_string(), self.prompt.clone());
        if let Some(style) = &self.style {
            params.insert("style".to_string(), style.clone());
        }
        if let Some([x, y, z]) = self.target_size {
            params.insert("target_size".to_string(), format!("{},{},{}", x, y, z));
        }
        params
    }
}

/// Backend-reported job status, normalized.
///
/// Codes follow the common wire convention `pending=0, running=1,
/// success=2, failure=3`. Anything else is kept verbatim in `Unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusCode {
    Pending,
    Running,
    Success,
    Failure,
    Unknown(String),
}

impl StatusCode {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => StatusCode::Pending,
            1 => StatusCode::Running,
            2 => StatusCode::Success,
            3 => StatusCode::Failure,
            other => StatusCode::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusCode::Pending => write!(f, "pending"),
            StatusCode::Running => write!(f, "running"),
            StatusCode::Success => write!(f, "success"),
            StatusCode::Failure => write!(f, "failure"),
            StatusCode::Unknown(raw) => write!(f, "unknown({})", raw),
        }
    }
}

/// One `Query(jobId)` answer
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub status: StatusCode,
    pub result_uris: Vec<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl QueryResponse {
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            result_uris: Vec::new(),
            error_code: None,
            error_message: None,
        }
    }

    pub fn success(uris: Vec<String>) -> Self {
        Self {
            result_uris: uris,
            ..Self::with_status(StatusCode::Success)
        }
    }

    pub fn failure(code: &str, message: &str) -> Self {
        Self {
            error_code: Some(code.to_string()),
            error_message: Some(message.to_string()),
            ..Self::with_status(StatusCode::Failure)
        }
    }
}

/// A remote (or local) service that turns a request into a mesh.
///
/// Every method is a single round-trip. Polling cadence, timeouts and
/// fallback live above this trait.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Short identifier (e.g. "hunyuan", "sf3d")
    fn name(&self) -> &str;

    /// `Configuration` error when credentials or endpoint are missing
    fn check_config(&self) -> Result<()>;

    /// Submit a job and return the backend-assigned job id
    async fn submit(&self, request: &GenerationRequest) -> Result<String>;

    /// Query the status of a previously submitted job
    async fn query(&self, job_id: &str) -> Result<QueryResponse>;

    /// Retrieve one result artifact
    async fn download(&self, uri: &str) -> Result<Vec<u8>>;
}
