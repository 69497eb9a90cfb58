//! Result capture
//!
//! The harness writes one envelope line to the run unit's stdout. This module
//! finds and parses it against a closed schema, then turns its contents into
//! [`Artifact`]s: figures first, in creation order, then printed text.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;

use crate::config::CaptureConfig;
use crate::sandbox::harness::RESULT_MARKER;
use crate::types::{Artifact, CaptureError};

/// Signature every PNG file starts with.
pub const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// How the harness says the submission ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Ok,
    Error,
    MemoryExceeded,
    SetupError,
}

/// Exception raised inside the run unit.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvelopeError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    /// Line in the submission, when the error originated there
    pub line: Option<u64>,
}

impl EnvelopeError {
    pub fn describe(&self) -> String {
        let mut text = self.kind.clone();
        if !self.message.is_empty() {
            text.push_str(": ");
            text.push_str(&self.message);
        }
        if let Some(line) = self.line {
            text.push_str(&format!(" (line {})", line));
        }
        text
    }
}

/// The result envelope emitted by the harness.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub status: EnvelopeStatus,
    /// Text printed by the submission, already clipped by the harness
    pub stdout: String,
    /// Base64-encoded PNG figures
    pub figures: Vec<String>,
    /// Figures the harness did not render because of the figure cap
    pub figures_dropped: usize,
    pub error: Option<EnvelopeError>,
}

impl Envelope {
    /// Find and parse the envelope line in raw run-unit stdout.
    pub fn parse(stdout: &str) -> Result<Self, CaptureError> {
        let body = stdout
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix(RESULT_MARKER))
            .ok_or(CaptureError::MissingEnvelope)?;

        serde_json::from_str(body).map_err(|e| CaptureError::MalformedEnvelope(e.to_string()))
    }

    /// Printed lines, for use as diagnostics.
    pub fn printed_lines(&self) -> impl Iterator<Item = String> + '_ {
        self.stdout.lines().map(str::to_string)
    }
}

/// Limits enforced on captured figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    pub max_figures: usize,
    pub max_figure_bytes: usize,
}

impl CaptureLimits {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            max_figures: config.max_figures,
            max_figure_bytes: config.max_figure_bytes,
        }
    }
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self::from_config(&CaptureConfig::default())
    }
}

/// Artifacts and diagnostics recovered from a successful envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub artifacts: Vec<Artifact>,
    pub diagnostics: Vec<String>,
}

/// Decode the envelope's figures and text into artifacts.
pub fn capture_artifacts(envelope: &Envelope, limits: &CaptureLimits) -> Result<Captured, CaptureError> {
    let mut captured = Captured::default();

    for (index, encoded) in envelope.figures.iter().take(limits.max_figures).enumerate() {
        let png = decode_figure(index, encoded, limits.max_figure_bytes)?;
        captured.artifacts.push(Artifact::figure(png));
    }

    let dropped = envelope.figures_dropped + envelope.figures.len().saturating_sub(limits.max_figures);
    if dropped > 0 {
        tracing::warn!("Dropped {} figure(s) beyond the limit of {}", dropped, limits.max_figures);
        captured.diagnostics.push(format!(
            "{} figure(s) dropped; at most {} are captured per run",
            dropped, limits.max_figures
        ));
    }

    if !envelope.stdout.is_empty() {
        captured.artifacts.push(Artifact::text(envelope.stdout.clone()));
        captured.diagnostics.extend(envelope.printed_lines());
    }

    Ok(captured)
}

fn decode_figure(index: usize, encoded: &str, max_bytes: usize) -> Result<Vec<u8>, CaptureError> {
    // Reject before decoding when the encoded size alone proves it is too big.
    let estimated = encoded.len() / 4 * 3;
    if estimated > max_bytes.saturating_add(2) {
        return Err(CaptureError::FigureTooLarge {
            index,
            bytes: estimated,
            max: max_bytes,
        });
    }

    let png = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| CaptureError::InvalidFigure {
            index,
            reason: e.to_string(),
        })?;

    if png.len() > max_bytes {
        return Err(CaptureError::FigureTooLarge {
            index,
            bytes: png.len(),
            max: max_bytes,
        });
    }
    if !png.starts_with(PNG_SIGNATURE) {
        return Err(CaptureError::InvalidFigure {
            index,
            reason: "missing PNG signature".to_string(),
        });
    }

    Ok(png)
}
