//! Normalized per-asset generation result

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome recorded on an [`AssetMetadata`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Success,
    Failed,
}

/// Backend-independent record of one asset generation.
///
/// Built once by the orchestrator at the end of an attempt sequence and then
/// handed by value to the artifact store. Backend-specific details live in
/// the open `parameters` map; `backend` and `job_id` are always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub object_id: String,
    pub backend_name: String,
    pub local_path: String,
    pub generation_time_sec: f64,
    pub file_size_mb: f64,
    pub status: GenerationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

pub const PARAM_BACKEND: &str = "backend";
pub const PARAM_JOB_ID: &str = "job_id";
pub const PARAM_ATTEMPTED: &str = "attempted_backends";
pub const PARAM_FAILED: &str = "failed_backends";

impl AssetMetadata {
    /// Metadata for an asset that was generated and saved to `local_path`.
    pub fn success(
        object_id: &str,
        backend_name: &str,
        job_id: &str,
        local_path: &str,
        generation_time_sec: f64,
        file_size_bytes: u64,
        mut parameters: BTreeMap<String, String>,
    ) -> Self {
        parameters.insert(PARAM_BACKEND.to_string(), backend_name.to_string());
        parameters.insert(PARAM_JOB_ID.to_string(), job_id.to_string());
        Self {
            object_id: object_id.to_string(),
            backend_name: backend_name.to_string(),
            local_path: local_path.to_string(),
            generation_time_sec,
            file_size_mb: bytes_to_mb(file_size_bytes),
            status: GenerationStatus::Success,
            error_message: None,
            parameters,
        }
    }

    /// Metadata for an object whose candidate backends were all exhausted.
    ///
    /// `backend_name` / `job_id` describe the last attempt; `job_id` is empty
    /// when that attempt never got as far as a submission.
    pub fn failed(
        object_id: &str,
        backend_name: &str,
        job_id: &str,
        generation_time_sec: f64,
        error_message: &str,
        mut parameters: BTreeMap<String, String>,
    ) -> Self {
        parameters.insert(PARAM_BACKEND.to_string(), backend_name.to_string());
        parameters.insert(PARAM_JOB_ID.to_string(), job_id.to_string());
        Self {
            object_id: object_id.to_string(),
            backend_name: backend_name.to_string(),
            local_path: String::new(),
            generation_time_sec,
            file_size_mb: 0.0,
            status: GenerationStatus::Failed,
            error_message: Some(error_message.to_string()),
            parameters,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == GenerationStatus::Success
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(|s| s.as_str())
    }

    /// Backends tried for this object, in order
    pub fn attempted_backends(&self) -> Vec<&str> {
        split_list(self.param(PARAM_ATTEMPTED))
    }

    /// Backends that were tried and did not produce the asset
    pub fn failed_backends(&self) -> Vec<&str> {
        split_list(self.param(PARAM_FAILED))
    }
}

fn split_list(value: Option<&str>) -> Vec<&str> {
    value
        .map(|v| v.split(',').filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

fn bytes_to_mb(bytes: u64) -> f64 {
    let mb = bytes as f64 / (1024.0 * 1024.0);
    (mb * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_records_provenance() {
        let meta = AssetMetadata::success(
            "chair_1",
            "sf3d",
            "J1",
            "/tmp/s/assets/chair_1.glb",
            12.5,
            2 * 1024 * 1024,
            BTreeMap::new(),
        );
        assert!(meta.is_success());
        assert_eq!(meta.param("backend"), Some("sf3d"));
        assert_eq!(meta.param("job_id"), Some("J1"));
        assert_eq!(meta.file_size_mb, 2.0);
        assert!(meta.error_message.is_none());
    }

    #[test]
    fn test_failed_carries_message_and_lists() {
        let mut params = BTreeMap::new();
        params.insert(PARAM_ATTEMPTED.to_string(), "hunyuan,sf3d".to_string());
        params.insert(PARAM_FAILED.to_string(), "hunyuan,sf3d".to_string());
        let meta = AssetMetadata::failed("lamp", "sf3d", "", 3.0, "queue full", params);

        assert!(!meta.is_success());
        assert_eq!(meta.error_message.as_deref(), Some("queue full"));
        assert_eq!(meta.attempted_backends(), vec!["hunyuan", "sf3d"]);
        assert_eq!(meta.failed_backends(), vec!["hunyuan", "sf3d"]);
        assert!(meta.local_path.is_empty());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&GenerationStatus::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
    }
}
