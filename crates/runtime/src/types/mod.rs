//! Core types and data structures for the sandbox runtime

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use analyzer::Violation;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::dataset::DatasetHandle;

pub mod error;

pub use error::*;

/// Unique identifier for submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionId(pub Uuid);

impl SubmissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubmissionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Groups of primitives a submission may ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// `df` and `pd`
    Tabular,
    /// `np`, `math`, `statistics`
    Numeric,
    /// `plt`
    Plotting,
    /// `Pitch`, `VerticalPitch`
    PitchDrawing,
    /// `print`
    TextOutput,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Tabular,
        Capability::Numeric,
        Capability::Plotting,
        Capability::PitchDrawing,
        Capability::TextOutput,
    ];

    pub fn all() -> BTreeSet<Capability> {
        Self::ALL.into_iter().collect()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Tabular => "tabular",
            Capability::Numeric => "numeric",
            Capability::Plotting => "plotting",
            Capability::PitchDrawing => "pitch_drawing",
            Capability::TextOutput => "text_output",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|cap| cap.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown capability '{}', expected one of: {}",
                    s,
                    Self::ALL.map(|c| c.as_str()).join(", ")
                )
            })
    }
}

/// Candidate source text plus the dataset it may read.
///
/// Created per request and consumed by [`CodeSandbox::submit`](crate::CodeSandbox::submit).
#[derive(Debug)]
pub struct CodeSubmission {
    pub id: SubmissionId,
    pub source_text: String,
    pub allowed_dataset_handle: DatasetHandle,
    pub requested_capabilities: BTreeSet<Capability>,
}

impl CodeSubmission {
    /// A submission requesting every capability.
    pub fn new(source_text: impl Into<String>, dataset: DatasetHandle) -> Self {
        Self {
            id: SubmissionId::new(),
            source_text: source_text.into(),
            allowed_dataset_handle: dataset,
            requested_capabilities: Capability::all(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.requested_capabilities = capabilities.into_iter().collect();
        self
    }
}

/// Shortest wall-clock budget a run is given.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(100);
/// Longest wall-clock budget a run is given.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
/// Smallest address space the interpreter can start in.
pub const MIN_MEMORY_LIMIT_BYTES: u64 = 16 * 1024 * 1024;

/// Per-run limits. Immutable once built.
///
/// Out-of-range limits are clamped to [`MIN_TIMEOUT`]..=[`MAX_TIMEOUT`] and
/// at least [`MIN_MEMORY_LIMIT_BYTES`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxConfig {
    #[serde(with = "humantime_serde")]
    timeout: Duration,
    memory_limit_bytes: u64,
    allowed_bindings: BTreeSet<String>,
}

impl SandboxConfig {
    pub fn new(
        timeout: Duration,
        memory_limit_bytes: u64,
        allowed_bindings: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            timeout: timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT),
            memory_limit_bytes: memory_limit_bytes.max(MIN_MEMORY_LIMIT_BYTES),
            allowed_bindings: allowed_bindings.into_iter().map(Into::into).collect(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn timeout_seconds(&self) -> f64 {
        self.timeout.as_secs_f64()
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_bytes
    }

    pub fn allowed_bindings(&self) -> &BTreeSet<String> {
        &self.allowed_bindings
    }
}

/// Terminal status of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    SafetyRejected,
    Timeout,
    ResourceExceeded,
    RuntimeError,
    Cancelled,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::SafetyRejected => "safety_rejected",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::ResourceExceeded => "resource_exceeded",
            ExecutionStatus::RuntimeError => "runtime_error",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Figure,
    TextOutput,
}

/// A transportable output of a run. Only bytes and strings cross this boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub media_type: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Hex SHA-256 of `payload`
    pub sha256: String,
}

impl Artifact {
    pub fn figure(png: Vec<u8>) -> Self {
        Self::new(ArtifactKind::Figure, "image/png", png)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(ArtifactKind::TextOutput, "text/plain; charset=utf-8", text.into().into_bytes())
    }

    fn new(kind: ArtifactKind, media_type: &str, payload: Vec<u8>) -> Self {
        let sha256 = hex::encode(Sha256::digest(&payload));
        Self {
            kind,
            media_type: media_type.to_string(),
            payload,
            sha256,
        }
    }

    /// The payload as text, for `TextOutput` artifacts.
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            ArtifactKind::TextOutput => std::str::from_utf8(&self.payload).ok(),
            ArtifactKind::Figure => None,
        }
    }

    /// Suggested file extension when writing the artifact to disk.
    pub fn extension(&self) -> &'static str {
        match self.kind {
            ArtifactKind::Figure => "png",
            ArtifactKind::TextOutput => "txt",
        }
    }
}

/// The single outcome handed back for every admitted submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub submission_id: SubmissionId,
    pub status: ExecutionStatus,
    pub artifacts: Vec<Artifact>,
    pub diagnostics: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub elapsed_time: Duration,
    /// Analyzer findings; non-empty only for `SafetyRejected`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn figures(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts
            .iter()
            .filter(|a| a.kind == ArtifactKind::Figure)
    }

    pub fn text_output(&self) -> Option<&str> {
        self.artifacts.iter().find_map(Artifact::as_text)
    }
}

/// Lifecycle of one submission inside the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubmissionState {
    Received,
    Analyzing,
    Rejected,
    Accepted,
    Executing,
    Succeeded,
    TimedOut,
    ResourceExceeded,
    RuntimeFailed,
    Cancelled,
}

impl SubmissionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionState::Rejected
                | SubmissionState::Succeeded
                | SubmissionState::TimedOut
                | SubmissionState::ResourceExceeded
                | SubmissionState::RuntimeFailed
                | SubmissionState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: SubmissionState) -> bool {
        use SubmissionState::*;
        matches!(
            (self, next),
            (Received, Analyzing)
                | (Analyzing, Rejected)
                | (Analyzing, Accepted)
                | (Accepted, Executing)
                | (Accepted, Cancelled)
                | (Executing, Succeeded)
                | (Executing, TimedOut)
                | (Executing, ResourceExceeded)
                | (Executing, RuntimeFailed)
                | (Executing, Cancelled)
        )
    }

    /// Terminal state matching a final status.
    pub fn for_status(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Success => SubmissionState::Succeeded,
            ExecutionStatus::SafetyRejected => SubmissionState::Rejected,
            ExecutionStatus::Timeout => SubmissionState::TimedOut,
            ExecutionStatus::ResourceExceeded => SubmissionState::ResourceExceeded,
            ExecutionStatus::RuntimeError => SubmissionState::RuntimeFailed,
            ExecutionStatus::Cancelled => SubmissionState::Cancelled,
        }
    }
}

impl fmt::Display for SubmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_parsing() {
        assert_eq!("pitch-drawing".parse::<Capability>().unwrap(), Capability::PitchDrawing);
        assert_eq!("Tabular".parse::<Capability>().unwrap(), Capability::Tabular);
        assert!("network".parse::<Capability>().is_err());
    }

    #[test]
    fn test_state_machine_transitions() {
        use SubmissionState::*;
        assert!(Received.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Rejected));
        assert!(Accepted.can_transition_to(Cancelled));
        assert!(Executing.can_transition_to(TimedOut));
        assert!(!Rejected.can_transition_to(Executing));
        assert!(!Received.can_transition_to(Executing));
        assert!(!Succeeded.can_transition_to(Cancelled));
        assert!(Rejected.is_terminal());
        assert!(!Accepted.is_terminal());
    }

    #[test]
    fn test_artifact_digest_and_text() {
        let artifact = Artifact::text("2\n");
        assert_eq!(artifact.as_text(), Some("2\n"));
        assert_eq!(artifact.sha256.len(), 64);
        assert_eq!(artifact.extension(), "txt");
    }

    #[test]
    fn test_artifact_payload_serializes_as_base64() {
        let artifact = Artifact::figure(vec![0x89, b'P', b'N', b'G']);
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["payload"], serde_json::json!("iVBORw=="));
        assert_eq!(json["kind"], serde_json::json!("figure"));

        let back: Artifact = serde_json::from_value(json).unwrap();
        assert_eq!(back, artifact);
    }

    #[test]
    fn test_sandbox_config_getters() {
        let config = SandboxConfig::new(Duration::from_secs(2), 1 << 28, ["df", "plt"]);
        assert_eq!(config.timeout_seconds(), 2.0);
        assert_eq!(config.memory_limit_bytes(), 1 << 28);
        assert!(config.allowed_bindings().contains("plt"));
    }

    #[test]
    fn test_sandbox_config_clamps_out_of_range_limits() {
        let unbounded = SandboxConfig::new(Duration::MAX, u64::MAX, ["print"]);
        assert_eq!(unbounded.timeout(), MAX_TIMEOUT);
        assert_eq!(unbounded.memory_limit_bytes(), u64::MAX);

        let empty = SandboxConfig::new(Duration::ZERO, 0, ["print"]);
        assert_eq!(empty.timeout(), MIN_TIMEOUT);
        assert_eq!(empty.memory_limit_bytes(), MIN_MEMORY_LIMIT_BYTES);
    }
}
