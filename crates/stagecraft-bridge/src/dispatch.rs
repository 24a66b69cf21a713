//! Run an assembly script in the authoring tool
//!
//! The executor is a plain subprocess: stdout and stderr are captured (each
//! capped), the run is bounded by a timeout, and the child is killed if the
//! timeout fires. Success means exit code 0 and the expected scene file on
//! disk afterwards.

use crate::script::AssemblyScript;
use serde::Serialize;
use stagecraft_core::{Result, StagecraftError};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Captured output beyond this is dropped
const MAX_OUTPUT_BYTES: u64 = 10 * 1024 * 1024;

/// Grace period for the output readers once the child is gone
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How to invoke the authoring tool.
///
/// `{script}` and `{output}` in `args` are replaced with the script path and
/// the expected output path. The output path itself belongs to the script
/// (`AssemblyOptions::output_path`).
#[derive(Debug, Clone)]
pub struct ExecutorEndpoint {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl ExecutorEndpoint {
    /// Headless Blender running the script and exiting non-zero on a Python error
    pub fn blender(executable: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: executable.into(),
            args: vec![
                "--background".to_string(),
                "--factory-startup".to_string(),
                "--python-exit-code".to_string(),
                "1".to_string(),
                "--python".to_string(),
                "{script}".to_string(),
            ],
            timeout,
        }
    }

    fn resolved_args(&self, script: &Path, output: &Path) -> Vec<String> {
        let script = script.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace("{script}", &script).replace("{output}", &output))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub output_path: PathBuf,
    pub script_path: PathBuf,
}

/// Save the script next to its output scene and run it.
///
/// Success is judged against the scene path the script itself saves to.
/// Any stale output file is removed first so that only this run can
/// produce it.
pub async fn dispatch(script: &AssemblyScript, endpoint: &ExecutorEndpoint) -> Result<ExecutionReport> {
    let output_path = script.output_path().to_path_buf();
    let script_dir = script
        .output_path()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let script_path = script.save(&script_dir)?;
    run_script(&script_path, &output_path, endpoint).await
}

/// Run an already saved script
pub async fn run_script(
    script_path: &Path,
    output_path: &Path,
    endpoint: &ExecutorEndpoint,
) -> Result<ExecutionReport> {
    if output_path.exists() {
        std::fs::remove_file(output_path)?;
    }

    let args = endpoint.resolved_args(script_path, output_path);
    info!(program = %endpoint.program, script = %script_path.display(), "Dispatching assembly script");
    debug!(?args, "Executor arguments");

    let start = Instant::now();
    let mut child = Command::new(&endpoint.program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| StagecraftError::Execution {
            message: format!("failed to start '{}': {}", endpoint.program, e),
            exit_code: None,
            stderr: String::new(),
        })?;

    let stdout_task = child.stdout.take().map(|s| tokio::spawn(read_stream(s)));
    let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_stream(s)));

    let waited = tokio::time::timeout(endpoint.timeout, child.wait()).await;
    let status = match waited {
        Ok(status) => Some(status?),
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill timed out executor: {}", e);
            }
            None
        }
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    let (stdout, stderr) = tokio::join!(collect(stdout_task), collect(stderr_task));

    let Some(status) = status else {
        warn!(duration_ms, "Assembly script timed out");
        return Err(StagecraftError::Execution {
            message: format!("executor timed out after {:.1}s", endpoint.timeout.as_secs_f64()),
            exit_code: None,
            stderr,
        });
    };

    let exit_code = status.code();
    if exit_code != Some(0) {
        warn!(?exit_code, duration_ms, "Assembly script failed");
        return Err(StagecraftError::Execution {
            message: "executor exited with an error".to_string(),
            exit_code,
            stderr,
        });
    }

    if !output_path.is_file() {
        return Err(StagecraftError::Execution {
            message: format!("expected output not produced: {}", output_path.display()),
            exit_code,
            stderr,
        });
    }

    info!(duration_ms, output = %output_path.display(), "Assembly script finished");
    Ok(ExecutionReport {
        exit_code: 0,
        stdout,
        stderr,
        duration_ms,
        output_path: output_path.to_path_buf(),
        script_path: script_path.to_path_buf(),
    })
}

async fn read_stream<R: AsyncRead + Unpin>(stream: R) -> String {
    let mut buf = Vec::new();
    let _ = stream.take(MAX_OUTPUT_BYTES).read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(task: Option<tokio::task::JoinHandle<String>>) -> String {
    let Some(task) = task else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
        Ok(Ok(s)) => s,
        _ => String::new(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::script::{build_assembly_script, AssemblyOptions};
    use stagecraft_session::{AssetManifest, LayoutSolution, ObjectMap};

    fn sh(command: &str, timeout: Duration) -> ExecutorEndpoint {
        ExecutorEndpoint {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), command.to_string()],
            timeout,
        }
    }

    fn paths() -> (PathBuf, PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("stagecraft_dispatch_test_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("assembly_script.py");
        std::fs::write(&script, "# empty\n").unwrap();
        let output = dir.join("scene.blend");
        (dir, script, output)
    }

    #[tokio::test]
    async fn test_success_requires_output_file() {
        let (dir, script, output) = paths();
        let endpoint = sh("echo running {script}; touch {output}", Duration::from_secs(10));
        let report = run_script(&script, &output, &endpoint).await.unwrap();
        assert_eq!(report.exit_code, 0);
        assert!(report.stdout.contains("assembly_script.py"));
        assert_eq!(report.output_path, output);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_code_and_stderr() {
        let (dir, script, output) = paths();
        let endpoint = sh("echo boom >&2; exit 3", Duration::from_secs(10));
        match run_script(&script, &output, &endpoint).await {
            Err(StagecraftError::Execution { exit_code, stderr, .. }) => {
                assert_eq!(exit_code, Some(3));
                assert!(stderr.contains("boom"));
            }
            other => panic!("expected Execution error, got {other:?}"),
        }
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_timeout_kills_executor() {
        let (dir, script, output) = paths();
        let endpoint = sh("sleep 5", Duration::from_millis(200));
        let start = Instant::now();
        match run_script(&script, &output, &endpoint).await {
            Err(StagecraftError::Execution { message, exit_code, .. }) => {
                assert!(message.contains("timed out"));
                assert_eq!(exit_code, None);
            }
            other => panic!("expected Execution error, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(4));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_clean_exit_without_output_is_failure() {
        let (dir, script, output) = paths();
        let endpoint = sh("true", Duration::from_secs(10));
        let err = run_script(&script, &output, &endpoint).await.unwrap_err();
        assert!(matches!(err, StagecraftError::Execution { message, .. } if message.contains("expected output")));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_stale_output_is_removed_before_run() {
        let (dir, script, output) = paths();
        std::fs::write(&output, b"old").unwrap();
        let endpoint = sh("true", Duration::from_secs(10));
        assert!(run_script(&script, &output, &endpoint).await.is_err());
        assert!(!output.exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn test_missing_program_is_execution_error() {
        let (dir, script, output) = paths();
        let endpoint = ExecutorEndpoint::blender("/nonexistent/stagecraft-blender", Duration::from_secs(1));
        let err = run_script(&script, &output, &endpoint).await.unwrap_err();
        assert!(matches!(err, StagecraftError::Execution { exit_code: None, .. }));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_blender_args_substitute_script() {
        let endpoint = ExecutorEndpoint::blender("blender", Duration::from_secs(1));
        let args = endpoint.resolved_args(Path::new("/s/a.py"), Path::new("/s/o.blend"));
        assert_eq!(args.last().map(String::as_str), Some("/s/a.py"));
        assert!(args.contains(&"--background".to_string()));
    }

    #[tokio::test]
    async fn test_dispatch_checks_the_scene_path_the_script_saves_to() {
        let (dir, _, _) = paths();
        let custom = dir.join("renders").join("custom.blend");
        std::fs::create_dir_all(custom.parent().unwrap()).unwrap();

        let mut options = AssemblyOptions::for_session(&dir);
        options.output_path = Some(custom.clone());
        let script = build_assembly_script(
            &AssetManifest::new(),
            &LayoutSolution::new(true),
            &ObjectMap::identity(Vec::<String>::new()),
            &options,
        )
        .unwrap();

        // Stands in for the authoring tool: create whatever the script's _save(...) names
        let endpoint = sh(
            r#"out=$(sed -n 's/^ *_save("\(.*\)")$/\1/p' {script}); touch "$out""#,
            Duration::from_secs(10),
        );
        let report = dispatch(&script, &endpoint).await.unwrap();
        assert_eq!(report.output_path, custom);
        assert!(custom.is_file());
        assert_eq!(report.script_path, dir.join("renders").join(crate::script::SCRIPT_FILE));
        std::fs::remove_dir_all(&dir).ok();
    }
}
