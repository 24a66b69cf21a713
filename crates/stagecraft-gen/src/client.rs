//! Per-backend job client: submit, poll until terminal, fetch results
//!
//! One [`GenerationJobClient`] wraps one backend. It owns the polling state
//! machine:
//!
//! ```text
//! Submitted -> Running -> { Succeeded | Failed }
//!      \__________\______> TimedOut   (attempt or wall-clock budget spent)
//! ```
//!
//! It never moves on to another backend; that is the orchestrator's job.

use crate::backend::{GenerationBackend, GenerationRequest, QueryResponse, StatusCode};
use crate::config::{PollingConfig, TransportConfig};
use chrono::{DateTime, Utc};
use stagecraft_core::{atomic_write, ContentHash, Result, StagecraftError};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Polling state of one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::TimedOut)
    }
}

/// A submitted job. Owned by the client that created it until terminal.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: String,
    pub backend: String,
    pub object_id: String,
    pub submitted_at: DateTime<Utc>,
    pub state: JobState,
    /// `Submitted` followed by the state observed after every poll
    pub transitions: Vec<JobState>,
    /// Poll round-trips made so far, failed ones included
    pub polls: u32,
    started: Instant,
}

impl JobHandle {
    fn new(job_id: String, backend: &str, object_id: &str) -> Self {
        Self {
            job_id,
            backend: backend.to_string(),
            object_id: object_id.to_string(),
            submitted_at: Utc::now(),
            state: JobState::Submitted,
            transitions: vec![JobState::Submitted],
            polls: 0,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn transition(&mut self, next: JobState) {
        self.state = next;
        self.transitions.push(next);
    }
}

/// Terminal outcome of a job. Never transitions further.
#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Success {
        artifact_uris: Vec<String>,
        elapsed_secs: f64,
    },
    Failed {
        error_code: String,
        error_message: String,
    },
    TimedOut,
}

/// Result of a single poll
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Pending(JobState),
    Done(JobResult),
}

/// Cadence and budget for `wait`
#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
    pub max_wall_clock: Duration,
    /// Consecutive transport failures tolerated before giving up
    pub max_consecutive_errors: u32,
}

impl From<&PollingConfig> for PollPolicy {
    fn from(config: &PollingConfig) -> Self {
        Self {
            interval: Duration::from_secs_f64(config.interval_secs.max(0.0)),
            max_attempts: config.max_attempts,
            max_wall_clock: Duration::from_secs(config.max_wall_clock_secs),
            max_consecutive_errors: config.max_consecutive_errors.max(1),
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from(&PollingConfig::default())
    }
}

/// Transport-level retry for submit and download
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub request_timeout: Duration,
}

impl From<&TransportConfig> for RetryPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            request_timeout: config.request_timeout(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&TransportConfig::default())
    }
}

/// Run `op` until it succeeds or fails with something other than a
/// transport error, at most `max_retries` times, backing off
/// `base_delay * 2^attempt` between tries. Each try is bounded by
/// `request_timeout`.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        let outcome = match tokio::time::timeout(policy.request_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(StagecraftError::Transport(format!(
                "{} timed out after {:?}",
                label, policy.request_timeout
            ))),
        };

        match outcome {
            Err(StagecraftError::Transport(msg)) if attempt + 1 < policy.max_retries => {
                let delay = policy.base_delay.saturating_mul(1u32 << attempt.min(16));
                warn!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "{} failed: {}; retrying", label, msg);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// One artifact written to disk by `fetch`
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedArtifact {
    pub uri: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub checksum: ContentHash,
}

/// Talks to exactly one backend
pub struct GenerationJobClient {
    backend: Arc<dyn GenerationBackend>,
    poll_policy: PollPolicy,
    retry_policy: RetryPolicy,
}

impl GenerationJobClient {
    pub fn new(backend: Arc<dyn GenerationBackend>, poll_policy: PollPolicy, retry_policy: RetryPolicy) -> Self {
        Self {
            backend,
            poll_policy,
            retry_policy,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Submit `request`.
    ///
    /// Fails with `Configuration` before any network traffic when the
    /// backend is not configured, and with `Transport` when the call could
    /// not complete within the retry budget.
    pub async fn submit(&self, request: &GenerationRequest) -> Result<JobHandle> {
        self.backend.check_config()?;

        let label = format!("{} submit", self.backend.name());
        let job_id = with_retry(&self.retry_policy, &label, || self.backend.submit(request)).await?;

        info!(
            backend = self.backend.name(),
            object_id = %request.object_id,
            job_id = %job_id,
            "Submitted generation job"
        );
        Ok(JobHandle::new(job_id, self.backend.name(), &request.object_id))
    }

    /// One status round-trip.
    ///
    /// A failed round-trip returns `Transport` and leaves the handle's state
    /// untouched; the caller decides whether to poll again.
    pub async fn poll(&self, handle: &mut JobHandle) -> Result<PollOutcome> {
        if handle.state.is_terminal() {
            return Err(StagecraftError::Validation(format!(
                "Job {} is already terminal ({:?})",
                handle.job_id, handle.state
            )));
        }

        handle.polls += 1;
        let response = match tokio::time::timeout(self.retry_policy.request_timeout, self.backend.query(&handle.job_id)).await {
            Ok(r) => r?,
            Err(_) => {
                return Err(StagecraftError::Transport(format!(
                    "{} query for job {} timed out",
                    handle.backend, handle.job_id
                )))
            }
        };

        Ok(self.apply(handle, response))
    }

    fn apply(&self, handle: &mut JobHandle, response: QueryResponse) -> PollOutcome {
        match response.status {
            StatusCode::Pending => {
                let next = if handle.state == JobState::Running {
                    JobState::Running
                } else {
                    JobState::Submitted
                };
                handle.transition(next);
                PollOutcome::Pending(next)
            }
            StatusCode::Running => {
                handle.transition(JobState::Running);
                PollOutcome::Pending(JobState::Running)
            }
            StatusCode::Unknown(raw) => {
                warn!(
                    backend = %handle.backend,
                    job_id = %handle.job_id,
                    status = %raw,
                    "Unrecognized job status, treating as running"
                );
                handle.transition(JobState::Running);
                PollOutcome::Pending(JobState::Running)
            }
            StatusCode::Success => {
                handle.transition(JobState::Succeeded);
                PollOutcome::Done(JobResult::Success {
                    artifact_uris: response.result_uris,
                    elapsed_secs: handle.elapsed().as_secs_f64(),
                })
            }
            StatusCode::Failure => {
                handle.transition(JobState::Failed);
                PollOutcome::Done(JobResult::Failed {
                    error_code: response.error_code.unwrap_or_else(|| "unknown".to_string()),
                    error_message: response
                        .error_message
                        .unwrap_or_else(|| "backend reported failure without a message".to_string()),
                })
            }
        }
    }

    /// Poll until the job is terminal or the policy budget is spent.
    ///
    /// Budget exhaustion yields `Ok(JobResult::TimedOut)`. More than
    /// `max_consecutive_errors` transport failures in a row surface the last
    /// transport error.
    pub async fn wait(&self, handle: &mut JobHandle) -> Result<JobResult> {
        let mut consecutive_errors = 0u32;

        loop {
            if handle.polls >= self.poll_policy.max_attempts
                || handle.elapsed() >= self.poll_policy.max_wall_clock
            {
                warn!(
                    backend = %handle.backend,
                    job_id = %handle.job_id,
                    polls = handle.polls,
                    elapsed_secs = handle.elapsed().as_secs_f64(),
                    "Polling budget exhausted"
                );
                handle.transition(JobState::TimedOut);
                return Ok(JobResult::TimedOut);
            }

            match self.poll(handle).await {
                Ok(PollOutcome::Done(result)) => return Ok(result),
                Ok(PollOutcome::Pending(state)) => {
                    consecutive_errors = 0;
                    debug!(job_id = %handle.job_id, poll = handle.polls, ?state, "Job pending");
                }
                Err(StagecraftError::Transport(msg)) => {
                    consecutive_errors += 1;
                    if consecutive_errors >= self.poll_policy.max_consecutive_errors {
                        return Err(StagecraftError::Transport(format!(
                            "{} consecutive poll failures for job {}: {}",
                            consecutive_errors, handle.job_id, msg
                        )));
                    }
                    warn!(job_id = %handle.job_id, consecutive_errors, "Poll failed: {}", msg);
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(self.poll_policy.interval).await;
        }
    }

    /// Download every artifact of a successful result into `dest_dir`.
    ///
    /// The first file is named `{object_id}.{ext}`, later ones
    /// `{object_id}_{n}.{ext}`. Any artifact that cannot be retrieved or
    /// fails the integrity check fails the whole fetch with `Download`, and
    /// files already written by that fetch are removed.
    pub async fn fetch(&self, handle: &JobHandle, result: &JobResult, dest_dir: &Path) -> Result<Vec<FetchedArtifact>> {
        let uris = match result {
            JobResult::Success { artifact_uris, .. } => artifact_uris,
            other => {
                return Err(StagecraftError::Download(format!(
                    "job {} has no artifacts to fetch ({:?})",
                    handle.job_id, other
                )))
            }
        };
        if uris.is_empty() {
            return Err(StagecraftError::Download(format!(
                "job {} succeeded without any result URI",
                handle.job_id
            )));
        }

        let mut fetched: Vec<FetchedArtifact> = Vec::with_capacity(uris.len());
        for (i, uri) in uris.iter().enumerate() {
            match self.fetch_one(handle, i, uri, dest_dir).await {
                Ok(artifact) => fetched.push(artifact),
                Err(e) => {
                    for artifact in &fetched {
                        if let Err(rm) = std::fs::remove_file(&artifact.path) {
                            warn!(path = %artifact.path.display(), "Failed to remove partial artifact: {}", rm);
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(fetched)
    }

    async fn fetch_one(&self, handle: &JobHandle, index: usize, uri: &str, dest_dir: &Path) -> Result<FetchedArtifact> {
        let label = format!("{} download", handle.backend);
        let bytes = with_retry(&self.retry_policy, &label, || self.backend.download(uri))
            .await
            .map_err(|e| match e {
                StagecraftError::Download(_) => e,
                other => StagecraftError::Download(format!("{}: {}", uri, other)),
            })?;

        let ext = extension_from_uri(uri);
        check_integrity(uri, &ext, &bytes)?;

        let file_name = if index == 0 {
            format!("{}.{}", handle.object_id, ext)
        } else {
            format!("{}_{}.{}", handle.object_id, index, ext)
        };
        let path = dest_dir.join(file_name);
        atomic_write(&path, &bytes)?;

        debug!(job_id = %handle.job_id, path = %path.display(), bytes = bytes.len(), "Fetched artifact");
        Ok(FetchedArtifact {
            uri: uri.to_string(),
            path,
            size_bytes: bytes.len() as u64,
            checksum: ContentHash::from_bytes(&bytes),
        })
    }
}

/// File extension of the artifact a URI points at, defaulting to `glb`.
///
/// Handles both plain paths (`.../mesh.glb?sig=..`) and query-addressed
/// files (`/view?filename=mesh.glb&type=output`).
pub fn extension_from_uri(uri: &str) -> String {
    let (path, query) = match uri.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (uri, None),
    };

    let from_name = |name: &str| {
        let name = name.rsplit('/').next().unwrap_or(name);
        name.rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
    };

    if let Some(ext) = from_name(path) {
        return ext;
    }
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(name) = pair.strip_prefix("filename=") {
                if let Some(ext) = from_name(name) {
                    return ext;
                }
            }
        }
    }
    "glb".to_string()
}

fn check_integrity(uri: &str, ext: &str, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(StagecraftError::Download(format!("{}: empty payload", uri)));
    }
    if ext == "glb" && !bytes.starts_with(b"glTF") {
        return Err(StagecraftError::Download(format!(
            "{}: payload is not a binary glTF (bad magic)",
            uri
        )));
    }
    Ok(())
}
