//! Submission executor
//!
//! [`CodeSandbox`] is the entry point of the runtime. Each submission is
//! analyzed, and only an allowed verdict reaches a [`SandboxRunner`]. Run units
//! are bounded by a semaphore; an outer watchdog guarantees a terminal result
//! even when a runner never returns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use analyzer::{SafetyAnalyzer, SafetyVerdict};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::aggregate::VerdictAggregator;
use crate::capture::CaptureLimits;
use crate::config::{Config, OverflowPolicy};
use crate::sandbox::{
    CaptureSettings, ProcessRunner, ProcessRunnerConfig, RunRequest, SandboxRunner, SandboxScope,
};
use crate::types::{
    CapacityError, CodeSubmission, ExecutionResult, LifecycleError, RuntimeError, SandboxConfig,
    SubmissionId, SubmissionState,
};

/// Tracks one submission through its lifecycle.
#[derive(Debug)]
struct LifecycleTracker {
    submission_id: SubmissionId,
    state: SubmissionState,
}

impl LifecycleTracker {
    fn new(submission_id: SubmissionId) -> Self {
        tracing::debug!(submission = %submission_id, state = %SubmissionState::Received, "Submission received");
        Self {
            submission_id,
            state: SubmissionState::Received,
        }
    }

    fn try_advance(&mut self, next: SubmissionState) -> Result<(), LifecycleError> {
        if !self.state.can_transition_to(next) {
            return Err(LifecycleError::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }

        tracing::debug!(
            submission = %self.submission_id,
            from = %self.state,
            to = %next,
            "Submission state transition"
        );
        self.state = next;
        Ok(())
    }

    fn advance(&mut self, next: SubmissionState) {
        if let Err(e) = self.try_advance(next) {
            tracing::error!(submission = %self.submission_id, "{}", e);
        }
    }
}

/// Removes a submission's cancel token when `submit` returns.
struct Registration<'a> {
    registry: &'a DashMap<SubmissionId, CancellationToken>,
    submission_id: SubmissionId,
}

impl<'a> Registration<'a> {
    /// Register a cancel token; an id can be in flight only once.
    fn register(
        registry: &'a DashMap<SubmissionId, CancellationToken>,
        submission_id: SubmissionId,
        token: CancellationToken,
    ) -> Result<Self, CapacityError> {
        match registry.entry(submission_id) {
            Entry::Occupied(_) => Err(CapacityError::AlreadyInFlight { submission_id }),
            Entry::Vacant(slot) => {
                slot.insert(token);
                Ok(Self {
                    registry,
                    submission_id,
                })
            }
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.submission_id);
    }
}

/// Safety analysis plus resource-bounded execution of generated code
#[derive(Clone)]
pub struct CodeSandbox {
    config: Arc<Config>,
    analyzer: Arc<SafetyAnalyzer>,
    aggregator: VerdictAggregator,
    runner: Arc<dyn SandboxRunner>,
    slots: Arc<Semaphore>,
    in_flight: Arc<DashMap<SubmissionId, CancellationToken>>,
    shutdown: CancellationToken,
}

impl CodeSandbox {
    /// Create a sandbox backed by the process runner.
    pub fn new(config: Config) -> Result<Self, RuntimeError> {
        config.validate()?;
        let runner = ProcessRunner::new(ProcessRunnerConfig::from_config(&config))?;
        Self::assemble(config, Arc::new(runner))
    }

    /// Create a sandbox with a caller-supplied runner.
    pub fn with_runner(config: Config, runner: Arc<dyn SandboxRunner>) -> Result<Self, RuntimeError> {
        config.validate()?;
        Self::assemble(config, runner)
    }

    fn assemble(config: Config, runner: Arc<dyn SandboxRunner>) -> Result<Self, RuntimeError> {
        let analyzer = SafetyAnalyzer::with_custom_patterns(&config.analyzer.extra_deny_patterns)?;

        tracing::info!(
            max_concurrent = config.concurrency.max_concurrent,
            overflow = ?config.concurrency.overflow,
            timeout_seconds = config.sandbox.timeout_seconds,
            memory_limit_bytes = config.sandbox.memory_limit_bytes,
            "Code sandbox initialized"
        );

        Ok(Self {
            aggregator: VerdictAggregator::new(CaptureLimits::from_config(&config.capture)),
            slots: Arc::new(Semaphore::new(config.concurrency.max_concurrent)),
            config: Arc::new(config),
            analyzer: Arc::new(analyzer),
            runner,
            in_flight: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Per-run limits from the deployment configuration.
    pub fn default_sandbox_config(&self) -> SandboxConfig {
        self.config.sandbox.sandbox_config()
    }

    /// Number of submissions currently being analyzed, queued or run.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Run the analyzer with the policy `submit` would use, without executing.
    pub fn analyze(&self, submission: &CodeSubmission, config: &SandboxConfig) -> SafetyVerdict {
        let scope = SandboxScope::for_submission(submission, config);
        let policy = scope.analysis_policy(self.config.analyzer.max_source_len);
        self.analyzer.analyze(&submission.source_text, &policy)
    }

    /// Request cancellation of a queued or running submission.
    ///
    /// Returns `false` when the id is unknown or has already finished.
    pub fn cancel(&self, submission_id: &SubmissionId) -> bool {
        match self.in_flight.get(submission_id) {
            Some(entry) => {
                tracing::info!(submission = %submission_id, "Cancellation requested");
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel everything in flight and refuse new submissions.
    pub fn shutdown(&self) {
        tracing::info!(in_flight = self.in_flight(), "Code sandbox shutting down");
        self.shutdown.cancel();
        self.slots.close();
    }

    /// Analyze and, if allowed, execute a submission.
    ///
    /// The only errors are explicit refusals: no capacity, shutting down, or
    /// the same id already in flight. Every admitted submission yields exactly
    /// one `ExecutionResult`.
    pub async fn submit(
        &self,
        submission: CodeSubmission,
        config: &SandboxConfig,
    ) -> Result<ExecutionResult, CapacityError> {
        if self.shutdown.is_cancelled() {
            return Err(CapacityError::ShuttingDown);
        }

        let submission_id = submission.id;
        let cancel = self.shutdown.child_token();
        let _registration = match Registration::register(&self.in_flight, submission_id, cancel.clone()) {
            Ok(registration) => registration,
            Err(e) => {
                tracing::warn!(submission = %submission_id, "Submission refused: {}", e);
                return Err(e);
            }
        };
        let mut lifecycle = LifecycleTracker::new(submission_id);

        lifecycle.advance(SubmissionState::Analyzing);
        let analysis_started = Instant::now();
        let scope = SandboxScope::for_submission(&submission, config);
        let policy = scope.analysis_policy(self.config.analyzer.max_source_len);
        let verdict = self.analyzer.analyze(&submission.source_text, &policy);
        let analysis_time = analysis_started.elapsed();

        if !verdict.allowed {
            lifecycle.advance(SubmissionState::Rejected);
            tracing::info!(
                submission = %submission_id,
                violations = verdict.violations.len(),
                "Submission rejected by safety analysis"
            );
            return Ok(self.aggregator.rejected(submission_id, verdict, analysis_time));
        }
        lifecycle.advance(SubmissionState::Accepted);

        let permit = match self.acquire_slot(&cancel).await {
            Ok(Some(permit)) => permit,
            Ok(None) => {
                lifecycle.advance(SubmissionState::Cancelled);
                tracing::info!(submission = %submission_id, "Submission cancelled while queued");
                return Ok(self.aggregator.cancelled(submission_id, analysis_time));
            }
            Err(e) => {
                tracing::warn!(submission = %submission_id, "Submission refused: {}", e);
                return Err(e);
            }
        };

        lifecycle.advance(SubmissionState::Executing);
        let result = self
            .execute(&submission, &scope, config, cancel, analysis_time)
            .await;
        drop(permit);

        lifecycle.advance(SubmissionState::for_status(result.status));
        tracing::info!(
            submission = %submission_id,
            status = %result.status,
            elapsed = ?result.elapsed_time,
            artifacts = result.artifacts.len(),
            "Submission finished"
        );
        Ok(result)
    }

    /// Wait for a run-unit slot according to the overflow policy.
    ///
    /// `Ok(None)` means the submission was cancelled while waiting.
    async fn acquire_slot(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<OwnedSemaphorePermit>, CapacityError> {
        match self.config.concurrency.overflow {
            OverflowPolicy::Reject => match self.slots.clone().try_acquire_owned() {
                Ok(permit) => Ok(Some(permit)),
                Err(TryAcquireError::NoPermits) => Err(CapacityError::AtCapacity {
                    max_concurrent: self.config.concurrency.max_concurrent,
                }),
                Err(TryAcquireError::Closed) => Err(CapacityError::ShuttingDown),
            },
            OverflowPolicy::Queue => {
                let slots = self.slots.clone();
                let queue_timeout = self.config.concurrency.queue_timeout();
                let wait = async move {
                    let acquired = match queue_timeout {
                        Some(limit) => tokio::time::timeout(limit, slots.acquire_owned())
                            .await
                            .map_err(|_| CapacityError::QueueTimeout { waited: limit })?,
                        None => slots.acquire_owned().await,
                    };
                    acquired.map_err(|_| CapacityError::ShuttingDown)
                };

                tokio::select! {
                    permit = wait => permit.map(Some),
                    _ = cancel.cancelled() => Ok(None),
                }
            }
        }
    }

    async fn execute(
        &self,
        submission: &CodeSubmission,
        scope: &SandboxScope,
        config: &SandboxConfig,
        cancel: CancellationToken,
        analysis_time: Duration,
    ) -> ExecutionResult {
        let submission_id = submission.id;
        let started = Instant::now();

        let capture = CaptureSettings::new(&self.config.capture, self.config.sandbox.max_output_bytes);
        let payload = match scope.payload(&submission.source_text, capture) {
            Ok(payload) => payload,
            Err(e) => {
                return self.aggregator.sandbox_failure(
                    submission_id,
                    &e,
                    analysis_time + started.elapsed(),
                )
            }
        };

        let request = RunRequest {
            submission_id,
            payload,
            timeout: config.timeout(),
            memory_limit_bytes: config.memory_limit_bytes(),
        };
        let watchdog = config
            .timeout()
            .saturating_add(Duration::from_secs(self.config.sandbox.watchdog_grace_seconds));

        tokio::select! {
            run = tokio::time::timeout(watchdog, self.runner.run(request, cancel.clone())) => {
                let elapsed = analysis_time + started.elapsed();
                match run {
                    Ok(Ok(report)) => self.aggregator.from_report(submission_id, &report, config, elapsed),
                    Ok(Err(e)) => self.aggregator.sandbox_failure(submission_id, &e, elapsed),
                    Err(_) => {
                        tracing::warn!(
                            submission = %submission_id,
                            "Runner did not finish within {:?}; synthesizing timeout",
                            watchdog
                        );
                        cancel.cancel();
                        self.aggregator.timed_out(submission_id, config.timeout(), elapsed)
                    }
                }
            }
            _ = cancel.cancelled() => {
                self.aggregator.cancelled(submission_id, analysis_time + started.elapsed())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_follows_state_machine() {
        let mut tracker = LifecycleTracker::new(SubmissionId::new());
        for next in [
            SubmissionState::Analyzing,
            SubmissionState::Accepted,
            SubmissionState::Executing,
            SubmissionState::Succeeded,
        ] {
            tracker.try_advance(next).unwrap();
        }
        assert!(tracker.state.is_terminal());
    }

    #[test]
    fn test_lifecycle_refuses_skipped_states() {
        let mut tracker = LifecycleTracker::new(SubmissionId::new());
        let err = tracker.try_advance(SubmissionState::Executing).unwrap_err();
        assert_eq!(
            err,
            LifecycleError::InvalidStateTransition {
                from: "Received".to_string(),
                to: "Executing".to_string(),
            }
        );
        assert_eq!(tracker.state, SubmissionState::Received);
    }

    #[test]
    fn test_registration_is_removed_on_drop() {
        let registry = DashMap::new();
        let id = SubmissionId::new();
        {
            let _registration = Registration::register(&registry, id, CancellationToken::new()).unwrap();
            assert!(registry.contains_key(&id));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registration_refuses_an_id_already_in_flight() {
        let registry = DashMap::new();
        let id = SubmissionId::new();
        let first = CancellationToken::new();
        let _registration = Registration::register(&registry, id, first.clone()).unwrap();

        let err = Registration::register(&registry, id, CancellationToken::new())
            .err()
            .unwrap();
        assert_eq!(err, CapacityError::AlreadyInFlight { submission_id: id });

        // The refused duplicate must not have displaced the original token.
        registry.get(&id).unwrap().cancel();
        assert!(first.is_cancelled());
    }
}
