//! Process Sandbox Runner
//!
//! Runs the harness in a child interpreter with a cleared environment, a
//! private temporary working directory and its own process group. Resource
//! limits are applied between fork and exec via direct `rlimit` syscalls.
//! The runner races process exit against its deadline and the cancellation
//! token; on either of the latter it kills the whole process group.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::harness::{HARNESS_SOURCE, INTERPRETER_ARGS};
use super::output::{read_bounded, BoundedOutput};
use super::{RunOutcome, RunReport, RunRequest, SandboxRunner};
use crate::config::Config;
use crate::types::SandboxError;

/// How long to wait for output pipes to close after the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Headroom on the stdout ceiling for envelope framing and printed text.
const ENVELOPE_OVERHEAD_BYTES: usize = 64 * 1024;

/// Configuration for the process runner
#[derive(Debug, Clone)]
pub struct ProcessRunnerConfig {
    /// Interpreter to run (name on `PATH` or absolute path)
    pub interpreter: String,
    /// Interpreters `interpreter` may name
    pub allowed_interpreters: Vec<String>,
    /// Parent of per-run working directories
    pub working_root: Option<PathBuf>,
    /// CPU seconds granted on top of the wall-clock timeout
    pub cpu_slack: Duration,
    /// Ceiling on stdout, which carries the result envelope
    pub max_stdout_bytes: usize,
    /// Ceiling on stderr
    pub max_stderr_bytes: usize,
    /// `RLIMIT_FSIZE`
    pub max_file_size_bytes: u64,
    /// `RLIMIT_NOFILE`
    pub max_open_files: u64,
}

impl ProcessRunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        let policy = &config.sandbox;
        // Figures travel base64-encoded: 4 output bytes per 3 input bytes.
        let figure_bytes = config
            .capture
            .max_figures
            .saturating_mul(config.capture.max_figure_bytes)
            .saturating_mul(4)
            / 3;

        Self {
            interpreter: policy.interpreter.clone(),
            allowed_interpreters: policy.allowed_interpreters.clone(),
            working_root: policy.working_root.clone(),
            cpu_slack: Duration::from_secs(policy.cpu_slack_seconds),
            max_stdout_bytes: policy
                .max_output_bytes
                .saturating_add(figure_bytes)
                .saturating_add(ENVELOPE_OVERHEAD_BYTES),
            max_stderr_bytes: policy.max_output_bytes,
            max_file_size_bytes: policy.max_file_size_bytes,
            max_open_files: policy.max_open_files,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), SandboxError> {
        let name = interpreter_name(&self.interpreter);
        if !self
            .allowed_interpreters
            .iter()
            .any(|allowed| allowed == &self.interpreter || allowed == name)
        {
            return Err(SandboxError::InvalidConfig(format!(
                "Interpreter '{}' not in allowed list: {:?}",
                self.interpreter, self.allowed_interpreters
            )));
        }

        if let Some(root) = &self.working_root {
            if !root.is_absolute() {
                return Err(SandboxError::InvalidConfig(format!(
                    "Working root must be absolute path: {}",
                    root.display()
                )));
            }
        }

        if self.max_stdout_bytes == 0 || self.max_stderr_bytes == 0 {
            return Err(SandboxError::InvalidConfig(
                "Output ceilings must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ProcessRunnerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

fn interpreter_name(interpreter: &str) -> &str {
    interpreter.rsplit('/').next().unwrap_or(interpreter)
}

/// Locate the interpreter before the child environment is cleared.
fn resolve_interpreter(interpreter: &str) -> Result<PathBuf, SandboxError> {
    let not_found = |reason: &str| SandboxError::SpawnFailed {
        interpreter: interpreter.to_string(),
        reason: reason.to_string(),
    };

    if interpreter.contains('/') {
        let path = PathBuf::from(interpreter);
        return if path.is_file() {
            Ok(path)
        } else {
            Err(not_found("no such file"))
        };
    }

    let search_path = std::env::var_os("PATH").ok_or_else(|| not_found("PATH is not set"))?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(interpreter))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| not_found("not found on PATH"))
}

/// The complete environment of a run unit.
fn sandbox_env(workdir: &Path) -> Vec<(&'static str, OsString)> {
    let dir = workdir.as_os_str().to_os_string();
    vec![
        ("PATH", OsString::from("/usr/local/bin:/usr/bin:/bin")),
        ("HOME", dir.clone()),
        ("TMPDIR", dir.clone()),
        ("MPLCONFIGDIR", dir),
        ("MPLBACKEND", OsString::from("Agg")),
        ("PYTHONHASHSEED", OsString::from("0")),
        ("PYTHONDONTWRITEBYTECODE", OsString::from("1")),
        ("PYTHONNOUSERSITE", OsString::from("1")),
        ("PYTHONIOENCODING", OsString::from("utf-8")),
        ("LANG", OsString::from("C.UTF-8")),
        ("OPENBLAS_NUM_THREADS", OsString::from("1")),
        ("OMP_NUM_THREADS", OsString::from("1")),
        ("MKL_NUM_THREADS", OsString::from("1")),
    ]
}

/// Limits applied in the child before exec.
#[derive(Debug, Clone, Copy)]
struct ProcessLimits {
    memory_bytes: u64,
    cpu_seconds: u64,
    file_size_bytes: u64,
    open_files: u64,
}

/// Kills the run unit's process group unless disarmed.
struct ProcessGroupGuard {
    pgid: Option<i32>,
    armed: bool,
}

impl ProcessGroupGuard {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|p| i32::try_from(p).ok()),
            armed: true,
        }
    }

    fn kill(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid {
            // SAFETY: killpg only sends a signal; the group was created by
            // setpgid in the child and contains nothing but the run unit.
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
        self.armed = false;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.armed {
            self.kill();
        }
    }
}

fn exit_outcome(status: std::process::ExitStatus) -> RunOutcome {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;

    RunOutcome::Exited {
        code: status.code(),
        signal,
    }
}

/// Process runner for untrusted Python submissions
#[derive(Debug)]
pub struct ProcessRunner {
    config: ProcessRunnerConfig,
    interpreter_path: PathBuf,
}

impl ProcessRunner {
    /// Create a runner, validating the configuration and locating the interpreter.
    pub fn new(config: ProcessRunnerConfig) -> Result<Self, SandboxError> {
        config.validate()?;
        let interpreter_path = resolve_interpreter(&config.interpreter)?;

        tracing::debug!(
            interpreter = %interpreter_path.display(),
            "Process runner ready"
        );

        Ok(Self {
            config,
            interpreter_path,
        })
    }

    fn working_directory(&self) -> Result<tempfile::TempDir, SandboxError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("scoutbox-run-");
        let dir = match &self.config.working_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        dir.map_err(|e| SandboxError::WorkingDirectory(e.to_string()))
    }

    fn limits_for(&self, request: &RunRequest) -> ProcessLimits {
        let cpu_seconds = (request.timeout.as_secs_f64().ceil() as u64)
            .saturating_add(self.config.cpu_slack.as_secs());
        ProcessLimits {
            memory_bytes: request.memory_limit_bytes,
            cpu_seconds: cpu_seconds.max(1),
            file_size_bytes: self.config.max_file_size_bytes,
            open_files: self.config.max_open_files,
        }
    }

    /// Put the child in its own process group and apply rlimits (Unix only).
    #[cfg(unix)]
    fn apply_resource_limits(command: &mut Command, limits: ProcessLimits) {
        use rlimit::Resource;

        // Never raise a limit above the hard limit we inherited.
        fn cap(resource: Resource, soft: u64, hard: u64) -> std::io::Result<()> {
            let (_, inherited) = resource.get()?;
            resource.set(soft.min(inherited), hard.min(inherited))
        }

        // SAFETY: pre_exec runs between fork() and exec() in the child process.
        // setpgid, getrlimit and setrlimit are async-signal-safe.
        unsafe {
            command.pre_exec(move || {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                cap(Resource::AS, limits.memory_bytes, limits.memory_bytes)?;
                // Hard limit one second later so the soft limit delivers SIGXCPU.
                cap(Resource::CPU, limits.cpu_seconds, limits.cpu_seconds.saturating_add(1))?;
                cap(Resource::FSIZE, limits.file_size_bytes, limits.file_size_bytes)?;
                cap(Resource::NOFILE, limits.open_files, limits.open_files)?;
                cap(Resource::CORE, 0, 0)?;
                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn apply_resource_limits(_command: &mut Command, _limits: ProcessLimits) {
        tracing::warn!("Resource limits are not supported on this platform; only the watchdog applies");
    }

    async fn drain(task: tokio::task::JoinHandle<BoundedOutput>, stream: &str) -> BoundedOutput {
        match tokio::time::timeout(DRAIN_TIMEOUT, task).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!("{} reader failed: {}", stream, e);
                BoundedOutput::default()
            }
            Err(_) => {
                tracing::warn!("{} did not close within {:?}", stream, DRAIN_TIMEOUT);
                BoundedOutput::default()
            }
        }
    }
}

#[async_trait]
impl SandboxRunner for ProcessRunner {
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunReport, SandboxError> {
        let workdir = self.working_directory()?;
        let limits = self.limits_for(&request);

        let mut command = Command::new(&self.interpreter_path);
        command.args(INTERPRETER_ARGS);
        command.arg(HARNESS_SOURCE);
        command.env_clear();
        command.envs(sandbox_env(workdir.path()));
        command.current_dir(workdir.path());
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);
        Self::apply_resource_limits(&mut command, limits);

        let start = Instant::now();
        let mut child = command.spawn().map_err(|e| SandboxError::SpawnFailed {
            interpreter: self.interpreter_path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut group = ProcessGroupGuard::new(child.id());

        tracing::debug!(
            submission = %request.submission_id,
            pid = ?child.id(),
            timeout = ?request.timeout,
            memory_limit_bytes = limits.memory_bytes,
            "Run unit started"
        );

        let stdin = child.stdin.take();
        let payload = request.payload;
        let writer = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!("Run unit closed stdin early: {}", e);
                }
            }
        });

        let max_stdout = self.config.max_stdout_bytes;
        let max_stderr = self.config.max_stderr_bytes;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = tokio::spawn(async move {
            match stdout {
                Some(mut out) => read_bounded(&mut out, max_stdout).await,
                None => BoundedOutput::default(),
            }
        });
        let stderr_reader = tokio::spawn(async move {
            match stderr {
                Some(mut err) => read_bounded(&mut err, max_stderr).await,
                None => BoundedOutput::default(),
            }
        });

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => {
                    group.disarm();
                    exit_outcome(status)
                }
                Err(e) => {
                    group.kill();
                    writer.abort();
                    return Err(SandboxError::Io(format!("Failed to wait on run unit: {}", e)));
                }
            },
            _ = tokio::time::sleep(request.timeout) => {
                tracing::warn!(
                    submission = %request.submission_id,
                    "Run unit exceeded {:?}; killing process group",
                    request.timeout
                );
                group.kill();
                RunOutcome::DeadlineExceeded
            },
            _ = cancel.cancelled() => {
                tracing::warn!(submission = %request.submission_id, "Run unit cancelled; killing process group");
                group.kill();
                RunOutcome::Cancelled
            },
        };

        if !matches!(outcome, RunOutcome::Exited { .. }) {
            if let Err(e) = child.kill().await {
                tracing::debug!("Run unit already gone: {}", e);
            }
        }
        writer.abort();

        let stdout = Self::drain(stdout_reader, "stdout").await;
        let stderr = Self::drain(stderr_reader, "stderr").await;
        let elapsed = start.elapsed();

        if stdout.truncated {
            tracing::warn!(
                submission = %request.submission_id,
                "stdout truncated at {} bytes",
                max_stdout
            );
        }
        if stderr.truncated {
            tracing::warn!(
                submission = %request.submission_id,
                "stderr truncated at {} bytes",
                max_stderr
            );
        }

        tracing::debug!(
            submission = %request.submission_id,
            outcome = ?outcome,
            elapsed = ?elapsed,
            "Run unit finished"
        );

        drop(workdir);

        Ok(RunReport {
            outcome,
            stdout: stdout.data,
            stderr: stderr.data,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            elapsed,
        })
    }
}
