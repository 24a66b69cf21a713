//! Backend selection and fallback
//!
//! For one object the orchestrator walks a list of candidate backends
//! strictly in order, running at most one attempt at a time. Backend-local
//! failures (`Configuration`, `Transport`, `JobFailed`, `TimedOut`,
//! `Download`) move it to the next candidate; anything else is returned to
//! the caller immediately. The result is always a normalized
//! [`AssetMetadata`].

use crate::backend::{GenerationBackend, GenerationRequest};
use crate::backends::{HunyuanBackend, MockBackend, Sf3dBackend};
use crate::client::{FetchedArtifact, GenerationJobClient, JobResult, PollPolicy, RetryPolicy};
use crate::config::{StagecraftConfig, HUNYUAN, MOCK, SF3D};
use stagecraft_core::{Result, StagecraftError};
use stagecraft_session::metadata::{PARAM_ATTEMPTED, PARAM_FAILED};
use stagecraft_session::{AssetMetadata, SessionHandle};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

pub const PARAM_RESULT_URI: &str = "result_uri";
pub const PARAM_CHECKSUM: &str = "checksum";
pub const PARAM_OUTCOME_PREFIX: &str = "outcome.";

/// Which backends may serve a request, and in what order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendPriority {
    /// Exactly this backend; no fallback
    PrimaryOnly(String),
    /// These backends in order, advancing on failure
    OrderedFallback(Vec<String>),
    /// Every configured backend in the canonical order
    Auto,
}

impl BackendPriority {
    /// `"auto"`, a single name, or a comma-separated fallback list
    pub fn parse(s: &str) -> Result<Self> {
        let names: Vec<String> = s
            .split(',')
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty())
            .collect();
        match names.as_slice() {
            [] => Err(StagecraftError::Validation("Backend priority is empty".to_string())),
            [one] if one == "auto" => Ok(BackendPriority::Auto),
            [one] => Ok(BackendPriority::PrimaryOnly(one.clone())),
            many => {
                if many.iter().any(|n| n == "auto") {
                    return Err(StagecraftError::Validation(
                        "'auto' cannot be combined with explicit backend names".to_string(),
                    ));
                }
                Ok(BackendPriority::OrderedFallback(many.to_vec()))
            }
        }
    }
}

impl fmt::Display for BackendPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendPriority::PrimaryOnly(name) => write!(f, "{}", name),
            BackendPriority::OrderedFallback(names) => write!(f, "{}", names.join(",")),
            BackendPriority::Auto => write!(f, "auto"),
        }
    }
}

/// Named backends plus the canonical `Auto` order
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn GenerationBackend>>,
    unavailable: BTreeMap<String, String>,
    auto_order: Vec<String>,
}

impl BackendRegistry {
    pub fn new(auto_order: Vec<String>) -> Self {
        Self {
            backends: BTreeMap::new(),
            unavailable: BTreeMap::new(),
            auto_order,
        }
    }

    /// Build every known backend from configuration. A backend whose client
    /// cannot even be constructed is recorded with the reason.
    pub fn from_config(config: &StagecraftConfig) -> Self {
        let mut registry = Self::new(config.generation.backend_priority.clone());

        match HunyuanBackend::new(config.backends.hunyuan.clone(), &config.transport) {
            Ok(backend) => registry.register(Arc::new(backend)),
            Err(e) => registry.mark_unavailable(HUNYUAN, &e.to_string()),
        }
        match Sf3dBackend::new(config.backends.sf3d.clone(), &config.transport) {
            Ok(backend) => registry.register(Arc::new(backend)),
            Err(e) => registry.mark_unavailable(SF3D, &e.to_string()),
        }
        registry.register(Arc::new(MockBackend::offline()));

        registry
    }

    pub fn register(&mut self, backend: Arc<dyn GenerationBackend>) {
        let name = backend.name().to_string();
        self.unavailable.remove(&name);
        self.backends.insert(name, backend);
    }

    fn mark_unavailable(&mut self, name: &str, reason: &str) {
        warn!(backend = name, "Backend unavailable: {}", reason);
        self.unavailable.insert(name.to_string(), reason.to_string());
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.keys().map(|s| s.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GenerationBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.backends
            .get(name)
            .map(|b| b.check_config().is_ok())
            .unwrap_or(false)
    }

    /// Candidate backend names for `priority`, in attempt order
    pub fn resolve(&self, priority: &BackendPriority) -> Result<Vec<String>> {
        let candidates = match priority {
            BackendPriority::PrimaryOnly(name) => vec![name.clone()],
            BackendPriority::OrderedFallback(names) => names.clone(),
            BackendPriority::Auto => {
                let chosen: Vec<String> = self
                    .auto_order
                    .iter()
                    .filter(|n| n.as_str() != MOCK && self.is_configured(n))
                    .cloned()
                    .collect();
                if chosen.is_empty() {
                    return Err(StagecraftError::Configuration(format!(
                        "No generation backend is configured ({})",
                        self.describe_unconfigured()
                    )));
                }
                chosen
            }
        };

        if candidates.is_empty() {
            return Err(StagecraftError::Validation("No candidate backends given".to_string()));
        }
        for name in &candidates {
            if !self.backends.contains_key(name) && !self.unavailable.contains_key(name) {
                return Err(StagecraftError::Configuration(format!(
                    "Unknown backend '{}' (known: {})",
                    name,
                    self.names().join(", ")
                )));
            }
        }
        Ok(candidates)
    }

    fn describe_unconfigured(&self) -> String {
        self.auto_order
            .iter()
            .map(|name| {
                let reason = match (self.backends.get(name), self.unavailable.get(name)) {
                    (Some(b), _) => b.check_config().err().map(|e| e.to_string()).unwrap_or_default(),
                    (None, Some(reason)) => reason.clone(),
                    (None, None) => "not registered".to_string(),
                };
                format!("{}: {}", name, reason)
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Outcome of one backend attempt
struct Attempt {
    job_id: String,
    result: Result<Vec<FetchedArtifact>>,
}

/// Drives one job client at a time per object and applies fallback policy
pub struct BackendOrchestrator {
    registry: BackendRegistry,
    poll_policy: PollPolicy,
    retry_policy: RetryPolicy,
}

impl BackendOrchestrator {
    pub fn new(registry: BackendRegistry, poll_policy: PollPolicy, retry_policy: RetryPolicy) -> Self {
        Self {
            registry,
            poll_policy,
            retry_policy,
        }
    }

    pub fn from_config(config: &StagecraftConfig) -> Self {
        Self::new(
            BackendRegistry::from_config(config),
            PollPolicy::from(&config.polling),
            RetryPolicy::from(&config.transport),
        )
    }

    /// Generate one asset into the session's asset directory.
    ///
    /// Returns `Ok` with `status = failed` once every candidate has been
    /// exhausted; `Err` is reserved for problems no other backend could fix
    /// (bad request, unknown backend name, local I/O).
    pub async fn generate_asset(
        &self,
        session: &SessionHandle,
        request: &GenerationRequest,
        priority: &BackendPriority,
    ) -> Result<AssetMetadata> {
        validate_object_id(&request.object_id)?;
        let candidates = self.registry.resolve(priority)?;
        let asset_dir = session.asset_dir();
        std::fs::create_dir_all(&asset_dir)?;

        let start = Instant::now();
        let mut params = request.describe();
        let mut attempted: Vec<String> = Vec::new();
        let mut failed: Vec<String> = Vec::new();
        let mut last_error: Option<StagecraftError> = None;
        let mut last_job_id = String::new();

        for name in &candidates {
            attempted.push(name.clone());
            info!(object_id = %request.object_id, backend = %name, attempt = attempted.len(), "Generating asset");

            let attempt = match self.registry.get(name) {
                Some(backend) => self.attempt(backend, request, &asset_dir).await,
                None => Attempt {
                    job_id: String::new(),
                    result: Err(StagecraftError::Configuration(format!(
                        "backend '{}' is unavailable",
                        name
                    ))),
                },
            };
            last_job_id = attempt.job_id.clone();

            match attempt.result {
                Ok(files) => {
                    let Some(primary) = files.first() else {
                        return Err(StagecraftError::Download(format!(
                            "{} returned no files for '{}'",
                            name, request.object_id
                        )));
                    };
                    params.insert(format!("{}{}", PARAM_OUTCOME_PREFIX, name), "succeeded".to_string());
                    params.insert(PARAM_ATTEMPTED.to_string(), attempted.join(","));
                    params.insert(PARAM_FAILED.to_string(), failed.join(","));
                    params.insert(PARAM_RESULT_URI.to_string(), primary.uri.clone());
                    params.insert(PARAM_CHECKSUM.to_string(), primary.checksum.to_prefixed_hex());

                    let elapsed = start.elapsed().as_secs_f64();
                    info!(
                        object_id = %request.object_id,
                        backend = %name,
                        job_id = %attempt.job_id,
                        elapsed_secs = elapsed,
                        "Asset generated"
                    );
                    return Ok(AssetMetadata::success(
                        &request.object_id,
                        name,
                        &attempt.job_id,
                        &primary.path.to_string_lossy(),
                        elapsed,
                        primary.size_bytes,
                        params,
                    ));
                }
                Err(e) if e.is_fallback_eligible() => {
                    warn!(
                        object_id = %request.object_id,
                        backend = %name,
                        kind = e.kind(),
                        "Attempt failed: {}",
                        e
                    );
                    params.insert(format!("{}{}", PARAM_OUTCOME_PREFIX, name), e.kind().to_string());
                    failed.push(name.clone());
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        let last_backend = attempted.last().cloned().unwrap_or_default();
        let message = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no backend attempted".to_string());
        params.insert(PARAM_ATTEMPTED.to_string(), attempted.join(","));
        params.insert(PARAM_FAILED.to_string(), failed.join(","));

        error!(
            object_id = %request.object_id,
            attempted = %attempted.join(","),
            elapsed_secs = elapsed,
            "All backends exhausted: {}",
            message
        );
        Ok(AssetMetadata::failed(
            &request.object_id,
            &last_backend,
            &last_job_id,
            elapsed,
            &message,
            params,
        ))
    }

    async fn attempt(&self, backend: Arc<dyn GenerationBackend>, request: &GenerationRequest, dest: &Path) -> Attempt {
        let client = GenerationJobClient::new(backend, self.poll_policy.clone(), self.retry_policy.clone());

        let mut handle = match client.submit(request).await {
            Ok(h) => h,
            Err(e) => {
                return Attempt {
                    job_id: String::new(),
                    result: Err(e),
                }
            }
        };

        let result = match client.wait(&mut handle).await {
            Ok(JobResult::Failed { error_code, error_message }) => Err(StagecraftError::JobFailed {
                backend: handle.backend.clone(),
                code: error_code,
                message: error_message,
            }),
            Ok(JobResult::TimedOut) => Err(StagecraftError::TimedOut {
                backend: handle.backend.clone(),
                attempts: handle.polls,
                elapsed_secs: handle.elapsed().as_secs_f64(),
            }),
            Ok(success) => client.fetch(&handle, &success, dest).await,
            Err(e) => Err(e),
        };

        Attempt {
            job_id: handle.job_id,
            result,
        }
    }
}

/// Object IDs double as file names and authoring-tool object names
pub fn validate_object_id(object_id: &str) -> Result<()> {
    let ok = !object_id.is_empty()
        && object_id != "."
        && object_id != ".."
        && !object_id.contains(['/', '\\'])
        && !object_id.chars().any(|c| c.is_control());
    if ok {
        Ok(())
    } else {
        Err(StagecraftError::Validation(format!("Invalid object id '{}'", object_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StatusCode;
    use stagecraft_session::SessionArtifactStore;
    use std::time::Duration;

    fn policies() -> (PollPolicy, RetryPolicy) {
        (
            PollPolicy {
                interval: Duration::from_millis(1),
                max_attempts: 5,
                max_wall_clock: Duration::from_secs(30),
                max_consecutive_errors: 2,
            },
            RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                request_timeout: Duration::from_secs(5),
            },
        )
    }

    fn orchestrator(backends: Vec<Arc<MockBackend>>, auto_order: &[&str]) -> BackendOrchestrator {
        let mut registry = BackendRegistry::new(auto_order.iter().map(|s| s.to_string()).collect());
        for b in backends {
            registry.register(b);
        }
        let (poll, retry) = policies();
        BackendOrchestrator::new(registry, poll, retry)
    }

    fn session() -> (SessionHandle, std::path::PathBuf) {
        let root = std::env::temp_dir().join(format!("stagecraft_orch_test_{}", uuid::Uuid::new_v4()));
        let store = SessionArtifactStore::new(&root);
        (store.create_session("s", false).unwrap(), root)
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!(BackendPriority::parse("auto").unwrap(), BackendPriority::Auto);
        assert_eq!(
            BackendPriority::parse(" SF3D ").unwrap(),
            BackendPriority::PrimaryOnly("sf3d".to_string())
        );
        assert_eq!(
            BackendPriority::parse("hunyuan,sf3d").unwrap(),
            BackendPriority::OrderedFallback(vec!["hunyuan".to_string(), "sf3d".to_string()])
        );
        assert!(BackendPriority::parse("").is_err());
        assert!(BackendPriority::parse("auto,sf3d").is_err());
    }

    #[tokio::test]
    async fn test_primary_only_never_contacts_alternate() {
        let sf3d = Arc::new(MockBackend::new("sf3d"));
        let hunyuan = Arc::new(MockBackend::new("hunyuan"));
        let orch = orchestrator(vec![sf3d.clone(), hunyuan.clone()], &["hunyuan", "sf3d"]);
        let (session, root) = session();

        for i in 0..3 {
            let request = GenerationRequest::new(&format!("obj_{}", i), "a thing");
            let meta = orch
                .generate_asset(&session, &request, &BackendPriority::PrimaryOnly("sf3d".to_string()))
                .await
                .unwrap();
            assert_eq!(meta.backend_name, "sf3d");
            assert_eq!(meta.param("backend"), Some("sf3d"));
        }
        assert_eq!(hunyuan.total_calls(), 0);
        assert_eq!(sf3d.submit_calls(), 3);

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_primary_only_failure_does_not_fall_back() {
        let sf3d = Arc::new(MockBackend::new("sf3d").always_failing("OOM", "out of memory"));
        let hunyuan = Arc::new(MockBackend::new("hunyuan"));
        let orch = orchestrator(vec![sf3d, hunyuan.clone()], &["hunyuan", "sf3d"]);
        let (session, root) = session();

        let meta = orch
            .generate_asset(
                &session,
                &GenerationRequest::new("lamp", "a lamp"),
                &BackendPriority::PrimaryOnly("sf3d".to_string()),
            )
            .await
            .unwrap();
        assert!(!meta.is_success());
        assert_eq!(meta.backend_name, "sf3d");
        assert!(meta.error_message.unwrap().contains("out of memory"));
        assert_eq!(hunyuan.total_calls(), 0);

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_auto_selects_only_configured_backend() {
        let hunyuan = Arc::new(MockBackend::new("hunyuan").unconfigured());
        let sf3d = Arc::new(MockBackend::new("sf3d"));
        let orch = orchestrator(vec![hunyuan.clone(), sf3d], &["hunyuan", "sf3d"]);
        let (session, root) = session();

        let meta = orch
            .generate_asset(&session, &GenerationRequest::new("desk", "a desk"), &BackendPriority::Auto)
            .await
            .unwrap();
        assert!(meta.is_success());
        assert_eq!(meta.backend_name, "sf3d");
        assert_eq!(meta.attempted_backends(), vec!["sf3d"]);
        assert_eq!(hunyuan.total_calls(), 0);

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_auto_with_nothing_configured_is_configuration_error() {
        let hunyuan = Arc::new(MockBackend::new("hunyuan").unconfigured());
        let orch = orchestrator(vec![hunyuan], &["hunyuan", "sf3d"]);
        let (session, root) = session();

        let err = orch
            .generate_asset(&session, &GenerationRequest::new("desk", "a desk"), &BackendPriority::Auto)
            .await
            .unwrap_err();
        assert!(matches!(err, StagecraftError::Configuration(_)));

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_ordered_fallback_records_failed_backend() {
        let a = Arc::new(MockBackend::new("a").always_failing("E1", "backend a broke"));
        let b = Arc::new(MockBackend::new("b"));
        let orch = orchestrator(vec![a.clone(), b.clone()], &[]);
        let (session, root) = session();

        let priority = BackendPriority::OrderedFallback(vec!["a".to_string(), "b".to_string()]);
        let meta = orch
            .generate_asset(&session, &GenerationRequest::new("chair_1", "a chair"), &priority)
            .await
            .unwrap();

        assert!(meta.is_success());
        assert_eq!(meta.backend_name, "b");
        assert_eq!(meta.attempted_backends(), vec!["a", "b"]);
        assert_eq!(meta.failed_backends(), vec!["a"]);
        assert_eq!(meta.param("outcome.a"), Some("job_failed"));
        assert_eq!(meta.param("outcome.b"), Some("succeeded"));
        assert!(meta.param("checksum").unwrap().starts_with("sha256:"));
        assert!(std::path::Path::new(&meta.local_path).exists());
        assert_eq!(a.download_calls(), 0);

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_timeout_and_config_errors_advance_and_last_error_wins() {
        let slow = Arc::new(MockBackend::new("slow").with_statuses(vec![StatusCode::Running; 10]));
        let nocreds = Arc::new(MockBackend::new("nocreds").unconfigured());
        let broken = Arc::new(MockBackend::new("broken").always_failing("E9", "final failure"));
        let orch = orchestrator(vec![slow, nocreds.clone(), broken], &[]);
        let (session, root) = session();

        let priority = BackendPriority::parse("slow,nocreds,broken").unwrap();
        let meta = orch
            .generate_asset(&session, &GenerationRequest::new("rug", "a rug"), &priority)
            .await
            .unwrap();

        assert!(!meta.is_success());
        assert_eq!(meta.backend_name, "broken");
        assert_eq!(meta.attempted_backends(), vec!["slow", "nocreds", "broken"]);
        assert_eq!(meta.param("outcome.slow"), Some("timed_out"));
        assert_eq!(meta.param("outcome.nocreds"), Some("configuration"));
        assert!(meta.error_message.unwrap().contains("final failure"));
        assert!(meta.local_path.is_empty());
        assert_eq!(nocreds.total_calls(), 0);
        assert!(meta.generation_time_sec >= 0.0);

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_unknown_backend_name_is_rejected() {
        let orch = orchestrator(vec![Arc::new(MockBackend::new("sf3d"))], &[]);
        let (session, root) = session();
        let err = orch
            .generate_asset(
                &session,
                &GenerationRequest::new("x", "y"),
                &BackendPriority::PrimaryOnly("meshy".to_string()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StagecraftError::Configuration(_)));
        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_object_id_with_path_separator_is_rejected() {
        let orch = orchestrator(vec![Arc::new(MockBackend::new("sf3d"))], &[]);
        let (session, root) = session();
        let err = orch
            .generate_asset(
                &session,
                &GenerationRequest::new("../evil", "y"),
                &BackendPriority::PrimaryOnly("sf3d".to_string()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StagecraftError::Validation(_)));
        std::fs::remove_dir_all(&root).ok();
    }
}
