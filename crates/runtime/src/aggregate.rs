//! Verdict aggregation
//!
//! Every admitted submission ends here: the analyzer verdict or the runner's
//! report is mapped onto exactly one [`ExecutionStatus`]. The mapping is a
//! single `match` per input so each outcome lands in one row only.

use std::time::Duration;

use analyzer::SafetyVerdict;

use crate::capture::{capture_artifacts, CaptureLimits, Envelope, EnvelopeStatus};
use crate::sandbox::{RunOutcome, RunReport};
use crate::types::{
    Artifact, CaptureError, ExecutionResult, ExecutionStatus, SandboxConfig, SandboxError,
    SubmissionId,
};

#[cfg(unix)]
mod signals {
    pub const KILL: i32 = libc::SIGKILL;
    pub const XCPU: i32 = libc::SIGXCPU;
    pub const XFSZ: i32 = libc::SIGXFSZ;
}

#[cfg(not(unix))]
mod signals {
    pub const KILL: i32 = 9;
    pub const XCPU: i32 = 24;
    pub const XFSZ: i32 = 25;
}

/// stderr fragments left behind when an allocation fails outside Python's
/// own `MemoryError` handling.
const ALLOCATOR_FAILURE_MARKERS: &[&str] = &[
    "MemoryError",
    "Cannot allocate memory",
    "std::bad_alloc",
    "out of memory",
];

/// Shown to callers in place of infrastructure detail.
pub const INTERNAL_FAILURE_DIAGNOSTIC: &str =
    "Internal error: the sandbox could not run this submission";

/// Lines of stderr kept in diagnostics for unexplained exits.
const STDERR_TAIL_LINES: usize = 5;

fn result(
    submission_id: SubmissionId,
    status: ExecutionStatus,
    artifacts: Vec<Artifact>,
    diagnostics: Vec<String>,
    elapsed_time: Duration,
) -> ExecutionResult {
    ExecutionResult {
        submission_id,
        status,
        artifacts,
        diagnostics,
        elapsed_time,
        violations: Vec::new(),
    }
}

/// Maps analyzer and runner outcomes to execution results
#[derive(Debug, Clone, Default)]
pub struct VerdictAggregator {
    limits: CaptureLimits,
}

impl VerdictAggregator {
    pub fn new(limits: CaptureLimits) -> Self {
        Self { limits }
    }

    /// The code was never run.
    pub fn rejected(
        &self,
        submission_id: SubmissionId,
        verdict: SafetyVerdict,
        elapsed: Duration,
    ) -> ExecutionResult {
        let diagnostics = verdict.violations.iter().map(ToString::to_string).collect();
        ExecutionResult {
            violations: verdict.violations,
            ..result(
                submission_id,
                ExecutionStatus::SafetyRejected,
                Vec::new(),
                diagnostics,
                elapsed,
            )
        }
    }

    pub fn cancelled(&self, submission_id: SubmissionId, elapsed: Duration) -> ExecutionResult {
        result(
            submission_id,
            ExecutionStatus::Cancelled,
            Vec::new(),
            vec!["Execution was cancelled".to_string()],
            elapsed,
        )
    }

    pub fn timed_out(
        &self,
        submission_id: SubmissionId,
        timeout: Duration,
        elapsed: Duration,
    ) -> ExecutionResult {
        result(
            submission_id,
            ExecutionStatus::Timeout,
            Vec::new(),
            vec![format!("Execution exceeded the time limit of {:?}", timeout)],
            elapsed,
        )
    }

    /// The run unit could not be started or supervised. Detail goes to the
    /// operator log only.
    pub fn infrastructure_failure(
        &self,
        submission_id: SubmissionId,
        error: &dyn std::error::Error,
        elapsed: Duration,
    ) -> ExecutionResult {
        tracing::error!(submission = %submission_id, "Sandbox infrastructure failure: {}", error);
        result(
            submission_id,
            ExecutionStatus::RuntimeError,
            Vec::new(),
            vec![INTERNAL_FAILURE_DIAGNOSTIC.to_string()],
            elapsed,
        )
    }

    pub fn sandbox_failure(
        &self,
        submission_id: SubmissionId,
        error: &SandboxError,
        elapsed: Duration,
    ) -> ExecutionResult {
        self.infrastructure_failure(submission_id, error, elapsed)
    }

    /// Map a finished run to its result.
    pub fn from_report(
        &self,
        submission_id: SubmissionId,
        report: &RunReport,
        config: &SandboxConfig,
        elapsed: Duration,
    ) -> ExecutionResult {
        let signal = match report.outcome {
            RunOutcome::Cancelled => return self.cancelled(submission_id, elapsed),
            RunOutcome::DeadlineExceeded => {
                return self.timed_out(submission_id, config.timeout(), elapsed)
            }
            RunOutcome::Exited { signal, .. } => signal,
        };

        if signal == Some(signals::XCPU) {
            return result(
                submission_id,
                ExecutionStatus::Timeout,
                Vec::new(),
                vec!["Execution exceeded its CPU time limit".to_string()],
                elapsed,
            );
        }

        match Envelope::parse(&report.stdout) {
            Ok(envelope) => self.from_envelope(submission_id, envelope, config, elapsed),
            Err(error) => self.from_bare_exit(submission_id, report, error, config, elapsed),
        }
    }

    fn from_envelope(
        &self,
        submission_id: SubmissionId,
        envelope: Envelope,
        config: &SandboxConfig,
        elapsed: Duration,
    ) -> ExecutionResult {
        match envelope.status {
            EnvelopeStatus::Ok => match capture_artifacts(&envelope, &self.limits) {
                Ok(captured) => result(
                    submission_id,
                    ExecutionStatus::Success,
                    captured.artifacts,
                    captured.diagnostics,
                    elapsed,
                ),
                Err(error @ CaptureError::FigureTooLarge { .. }) => result(
                    submission_id,
                    ExecutionStatus::ResourceExceeded,
                    Vec::new(),
                    vec![error.to_string()],
                    elapsed,
                ),
                Err(error) => {
                    tracing::warn!(submission = %submission_id, "Rejected run output: {}", error);
                    result(
                        submission_id,
                        ExecutionStatus::RuntimeError,
                        Vec::new(),
                        vec![error.to_string()],
                        elapsed,
                    )
                }
            },
            EnvelopeStatus::MemoryExceeded => {
                let mut diagnostics = vec![memory_diagnostic(config)];
                diagnostics.extend(envelope.printed_lines());
                result(
                    submission_id,
                    ExecutionStatus::ResourceExceeded,
                    Vec::new(),
                    diagnostics,
                    elapsed,
                )
            }
            EnvelopeStatus::Error => {
                let mut diagnostics = vec![envelope
                    .error
                    .as_ref()
                    .map(|e| e.describe())
                    .unwrap_or_else(|| "Execution failed".to_string())];
                diagnostics.extend(envelope.printed_lines());
                result(
                    submission_id,
                    ExecutionStatus::RuntimeError,
                    Vec::new(),
                    diagnostics,
                    elapsed,
                )
            }
            EnvelopeStatus::SetupError => {
                let detail = envelope
                    .error
                    .as_ref()
                    .map(|e| e.describe())
                    .unwrap_or_else(|| "unknown".to_string());
                tracing::error!(submission = %submission_id, "Harness setup failed: {}", detail);
                result(
                    submission_id,
                    ExecutionStatus::RuntimeError,
                    Vec::new(),
                    vec![INTERNAL_FAILURE_DIAGNOSTIC.to_string()],
                    elapsed,
                )
            }
        }
    }

    /// The process ended without a usable envelope.
    fn from_bare_exit(
        &self,
        submission_id: SubmissionId,
        report: &RunReport,
        error: CaptureError,
        config: &SandboxConfig,
        elapsed: Duration,
    ) -> ExecutionResult {
        let (code, signal) = match report.outcome {
            RunOutcome::Exited { code, signal } => (code, signal),
            _ => (None, None),
        };

        let killed_by_kernel = matches!(signal, Some(s) if s == signals::KILL || s == signals::XFSZ);
        let allocator_failed = ALLOCATOR_FAILURE_MARKERS
            .iter()
            .any(|marker| report.stderr.contains(marker));

        if killed_by_kernel || allocator_failed {
            let diagnostic = match signal {
                Some(s) if s == signals::XFSZ => "Execution exceeded the file size limit".to_string(),
                _ => memory_diagnostic(config),
            };
            return result(
                submission_id,
                ExecutionStatus::ResourceExceeded,
                Vec::new(),
                vec![diagnostic],
                elapsed,
            );
        }

        if report.stdout_truncated {
            return result(
                submission_id,
                ExecutionStatus::ResourceExceeded,
                Vec::new(),
                vec!["Execution output exceeded the capture limit".to_string()],
                elapsed,
            );
        }

        tracing::warn!(
            submission = %submission_id,
            code = ?code,
            signal = ?signal,
            "Run unit ended without a result: {}",
            error
        );

        let mut diagnostics = vec![match (code, signal) {
            (_, Some(s)) => format!("Execution terminated by signal {}", s),
            (Some(c), None) => format!("Execution exited with status {}", c),
            (None, None) => "Execution ended unexpectedly".to_string(),
        }];
        diagnostics.extend(stderr_tail(&report.stderr));

        result(
            submission_id,
            ExecutionStatus::RuntimeError,
            Vec::new(),
            diagnostics,
            elapsed,
        )
    }
}

fn memory_diagnostic(config: &SandboxConfig) -> String {
    format!(
        "Execution exceeded the memory limit of {} bytes",
        config.memory_limit_bytes()
    )
}

fn stderr_tail(stderr: &str) -> Vec<String> {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].iter().map(|l| l.to_string()).collect()
}
