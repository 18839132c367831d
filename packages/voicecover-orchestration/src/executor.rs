//! Stage executor: one external tool, one subprocess, one outcome.
//!
//! Commands are structured argument lists, never shell strings. stdout and
//! stderr are captured in full and kept verbatim. A stage that is expected to
//! produce files only succeeds when every expected file exists and is
//! non-empty. No retries happen here.

use crate::error::{PipelineError, Result};
use crate::job::StageId;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long to wait for pipe readers after the child is gone
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Program + argument vector + extra environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl CommandSpec {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Human-readable rendering for logs (not for execution)
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| {
                let s = a.to_string_lossy();
                if s.contains(char::is_whitespace) {
                    format!("{:?}", s)
                } else {
                    s.into_owned()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Why a stage failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Process could not be started
    Launch,
    /// Process exited unsuccessfully (`None` = killed by signal)
    Exit(Option<i32>),
    /// Deadline expired, process killed
    Timeout { timeout_ms: u64 },
    /// Exit was clean but an expected artifact is missing or empty
    MissingOutput { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct StageFailure {
    pub stage: StageId,
    pub kind: FailureKind,
    /// Verbatim stderr (or launch error text)
    pub diagnostic: String,
}

impl StageFailure {
    pub fn into_error(self) -> PipelineError {
        match self.kind {
            FailureKind::Timeout { timeout_ms } => PipelineError::Timeout {
                stage: self.stage,
                timeout_ms,
                diagnostic: self.diagnostic,
            },
            FailureKind::MissingOutput { path } => PipelineError::MissingOutput {
                stage: self.stage,
                path: path.display().to_string(),
                diagnostic: self.diagnostic,
            },
            FailureKind::Launch | FailureKind::Exit(_) => PipelineError::ToolInvocation {
                stage: self.stage,
                diagnostic: self.diagnostic,
            },
        }
    }
}

/// Successful run: verified artifacts plus captured streams
#[derive(Debug, Clone, Default)]
pub struct StageArtifacts {
    pub artifacts: Vec<PathBuf>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl StageArtifacts {
    /// Non-blank stdout then stderr, verbatim
    pub fn transcript(&self) -> String {
        [self.stdout.as_str(), self.stderr.as_str()]
            .iter()
            .filter(|s| !s.trim().is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone)]
pub enum StageOutcome {
    Success(StageArtifacts),
    Failure(StageFailure),
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success(_))
    }

    /// Diagnostic text worth keeping in the job log, success or not
    pub fn diagnostic(&self) -> &str {
        match self {
            StageOutcome::Success(a) => &a.stderr,
            StageOutcome::Failure(f) => &f.diagnostic,
        }
    }
}

/// Runs external tools as isolated subprocesses
#[derive(Debug, Clone, Default)]
pub struct StageExecutor;

impl StageExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run without expected artifacts
    pub async fn run(
        &self,
        stage: StageId,
        spec: &CommandSpec,
        working_dir: &Path,
        timeout: Duration,
    ) -> StageOutcome {
        self.run_expecting(stage, spec, working_dir, timeout, &[])
            .await
    }

    /// Run and require every path in `expected` to exist and be non-empty
    pub async fn run_expecting(
        &self,
        stage: StageId,
        spec: &CommandSpec,
        working_dir: &Path,
        timeout: Duration,
        expected: &[PathBuf],
    ) -> StageOutcome {
        let start = Instant::now();
        info!("Stage {}: running {}", stage, spec.display());

        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Stage {}: failed to launch {:?}: {}", stage, spec.program, e);
                return StageOutcome::Failure(StageFailure {
                    stage,
                    kind: FailureKind::Launch,
                    diagnostic: format!(
                        "failed to launch {}: {}",
                        spec.program.to_string_lossy(),
                        e
                    ),
                });
            }
        };

        let stdout_reader = spawn_pipe_reader(child.stdout.take());
        let stderr_reader = spawn_pipe_reader(child.stderr.take());

        let waited = tokio::time::timeout(timeout, child.wait()).await;

        let status = match waited {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                let stderr = drain(stderr_reader).await;
                drain(stdout_reader).await;
                return StageOutcome::Failure(StageFailure {
                    stage,
                    kind: FailureKind::Launch,
                    diagnostic: format!("failed waiting for process: {}\n{}", e, stderr),
                });
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Stage {}: failed to kill timed out process: {}", stage, e);
                }
                None
            }
        };

        let stdout = drain(stdout_reader).await;
        let stderr = drain(stderr_reader).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let status = match status {
            Some(status) => status,
            None => {
                let timeout_ms = timeout.as_millis() as u64;
                error!("Stage {}: timed out after {}ms, process killed", stage, timeout_ms);
                return StageOutcome::Failure(StageFailure {
                    stage,
                    kind: FailureKind::Timeout { timeout_ms },
                    diagnostic: format!(
                        "{} timed out after {}ms\n{}",
                        spec.program.to_string_lossy(),
                        timeout_ms,
                        stderr
                    ),
                });
            }
        };

        if !status.success() {
            error!(
                "Stage {}: {} exited with {} after {}ms",
                stage,
                spec.program.to_string_lossy(),
                status,
                duration_ms
            );
            // Some tools log errors to stdout only
            let diagnostic = if stderr.trim().is_empty() { stdout } else { stderr };
            return StageOutcome::Failure(StageFailure {
                stage,
                kind: FailureKind::Exit(status.code()),
                diagnostic,
            });
        }

        for path in expected {
            if let Err(reason) = check_artifact(path).await {
                warn!("Stage {}: {}", stage, reason);
                return StageOutcome::Failure(StageFailure {
                    stage,
                    kind: FailureKind::MissingOutput { path: path.clone() },
                    diagnostic: format!("{}\n{}", reason, stderr),
                });
            }
        }

        debug!("Stage {}: finished in {}ms", stage, duration_ms);
        StageOutcome::Success(StageArtifacts {
            artifacts: expected.to_vec(),
            stdout,
            stderr,
            duration_ms,
        })
    }
}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf).await;
            buf
        })
    })
}

async fn drain(reader: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(mut handle) = reader else {
        return String::new();
    };
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(buf)) => String::from_utf8_lossy(&buf).into_owned(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            // A grandchild still holds the pipe open
            handle.abort();
            String::new()
        }
    }
}

async fn check_artifact(path: &Path) -> std::result::Result<(), String> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        Ok(meta) if meta.is_file() => Err(format!("{} is empty", path.display())),
        Ok(_) => Err(format!("{} is not a file", path.display())),
        Err(_) => Err(format!("{} does not exist", path.display())),
    }
}

/// Hand-off check between stages: the artifact must exist and be non-empty
pub async fn verify_artifact(stage: StageId, path: &Path) -> Result<()> {
    check_artifact(path)
        .await
        .map_err(|reason| PipelineError::MissingOutput {
            stage,
            path: path.display().to_string(),
            diagnostic: reason,
        })
}
