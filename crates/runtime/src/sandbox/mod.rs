//! Sandbox abstraction layer
//!
//! A [`SandboxRunner`] takes an encoded run payload and drives one isolated
//! run unit to completion, a deadline, or cancellation. The default runner is
//! [`ProcessRunner`], which supervises a `python3` child under rlimits.

pub mod harness;
pub mod output;
pub mod process;
pub mod scope;

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::types::{SandboxError, SubmissionId};

pub use process::{ProcessRunner, ProcessRunnerConfig};
pub use scope::{CaptureSettings, SandboxScope};

/// Everything a runner needs for one run unit.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub submission_id: SubmissionId,
    /// JSON payload for the harness, written to stdin
    pub payload: Vec<u8>,
    pub timeout: Duration,
    pub memory_limit_bytes: u64,
}

/// How the run unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The process exited on its own or was killed by the kernel.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The runner's own deadline fired and it killed the process group.
    DeadlineExceeded,
    /// Cancellation was requested and the process group was killed.
    Cancelled,
}

impl RunOutcome {
    pub fn exited_cleanly(&self) -> bool {
        matches!(
            self,
            RunOutcome::Exited {
                code: Some(0),
                signal: None
            }
        )
    }
}

/// Raw result of a run unit, before capture.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub elapsed: Duration,
}

impl RunReport {
    /// A report with no output, for runners that end before producing any.
    pub fn empty(outcome: RunOutcome, elapsed: Duration) -> Self {
        Self {
            outcome,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            elapsed,
        }
    }
}

/// Trait for runners that execute one run unit
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Run the payload to a terminal outcome.
    ///
    /// `Err` is reserved for infrastructure failures (spawn, working
    /// directory, supervision I/O). Anything the submitted code does,
    /// including crashing the interpreter, is reported through `RunOutcome`.
    async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<RunReport, SandboxError>;
}
