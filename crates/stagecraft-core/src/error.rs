//! Error types for stagecraft

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for stagecraft operations
#[derive(Debug, Error)]
pub enum StagecraftError {
    /// Missing or invalid backend credentials / settings. Fatal, never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A single network call could not complete.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Job failed on backend '{backend}': [{code}] {message}")]
    JobFailed {
        backend: String,
        code: String,
        message: String,
    },

    #[error("Job on backend '{backend}' timed out after {attempts} polls ({elapsed_secs:.1}s)")]
    TimedOut {
        backend: String,
        attempts: u32,
        elapsed_secs: f64,
    },

    #[error("Download error: {0}")]
    Download(String),

    #[error("Already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Another writer kept the lock file for longer than the wait budget.
    #[error("Timed out waiting for lock: {}", .0.display())]
    Locked(PathBuf),

    #[error("Schema error in {artifact} at '{field}': {message}")]
    Schema {
        artifact: String,
        field: String,
        message: String,
    },

    #[error("Missing asset for object '{object_id}'")]
    MissingAsset { object_id: String },

    #[error("Execution error: {message} (exit code {exit_code:?})\n{stderr}")]
    Execution {
        message: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(String),
}

/// Result type alias for stagecraft operations
pub type Result<T> = std::result::Result<T, StagecraftError>;

impl StagecraftError {
    pub fn schema(artifact: &str, field: impl Into<String>, message: impl Into<String>) -> Self {
        StagecraftError::Schema {
            artifact: artifact.to_string(),
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether the orchestrator may absorb this error and move on to the
    /// next candidate backend.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(
            self,
            StagecraftError::Configuration(_)
                | StagecraftError::Transport(_)
                | StagecraftError::JobFailed { .. }
                | StagecraftError::TimedOut { .. }
                | StagecraftError::Download(_)
        )
    }

    /// Stable snake_case label used in diagnostics and metadata parameters.
    pub fn kind(&self) -> &'static str {
        match self {
            StagecraftError::Configuration(_) => "configuration",
            StagecraftError::Transport(_) => "transport",
            StagecraftError::JobFailed { .. } => "job_failed",
            StagecraftError::TimedOut { .. } => "timed_out",
            StagecraftError::Download(_) => "download",
            StagecraftError::AlreadyExists(_) => "already_exists",
            StagecraftError::NotFound(_) => "not_found",
            StagecraftError::Locked(_) => "locked",
            StagecraftError::Schema { .. } => "schema",
            StagecraftError::MissingAsset { .. } => "missing_asset",
            StagecraftError::Execution { .. } => "execution",
            StagecraftError::Validation(_) => "validation",
            StagecraftError::Io(_) => "io",
            StagecraftError::Json(_) => "json",
            StagecraftError::TomlParse(_) => "toml_parse",
        }
    }
}

impl From<toml::de::Error> for StagecraftError {
    fn from(err: toml::de::Error) -> Self {
        StagecraftError::TomlParse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_eligibility() {
        assert!(StagecraftError::Configuration("no key".into()).is_fallback_eligible());
        assert!(StagecraftError::TimedOut {
            backend: "sf3d".into(),
            attempts: 3,
            elapsed_secs: 9.0
        }
        .is_fallback_eligible());
        assert!(!StagecraftError::MissingAsset {
            object_id: "chair_1".into()
        }
        .is_fallback_eligible());
        assert!(!StagecraftError::schema("asset_manifest", "assets", "bad").is_fallback_eligible());
    }

    #[test]
    fn test_timed_out_kept_distinct_from_job_failed() {
        let timed_out = StagecraftError::TimedOut {
            backend: "hunyuan".into(),
            attempts: 200,
            elapsed_secs: 600.0,
        };
        let failed = StagecraftError::JobFailed {
            backend: "hunyuan".into(),
            code: "3".into(),
            message: "boom".into(),
        };
        assert_eq!(timed_out.kind(), "timed_out");
        assert_eq!(failed.kind(), "job_failed");
    }

    #[test]
    fn test_messages_name_the_offender() {
        let err = StagecraftError::MissingAsset {
            object_id: "lamp_3".into(),
        };
        assert!(err.to_string().contains("lamp_3"));

        let err = StagecraftError::schema("layout_solution", "object_placements.chair_1.pos", "expected 3 elements");
        let msg = err.to_string();
        assert!(msg.contains("layout_solution"));
        assert!(msg.contains("object_placements.chair_1.pos"));
    }
}
