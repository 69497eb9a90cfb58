//! Safety verdicts and the violations they carry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 1-based position of a violation in the submitted source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl Location {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Location used for findings that concern the whole source.
    pub fn start() -> Self {
        Self::new(1, 1)
    }

    /// Convert a zero-based Tree-sitter point.
    pub fn from_point(point: tree_sitter::Point) -> Self {
        Self::new(point.row + 1, point.column + 1)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Which analyzer layer produced a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    /// Regex pre-filter over raw text
    Textual,
    /// Syntax-tree walk
    Structural,
}

/// A single denylist hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Stable identifier of the rule, e.g. `text:eval-call` or `ast:banned-builtin`
    pub pattern_id: String,
    pub location: Location,
    pub message: String,
    pub layer: Layer,
}

impl Violation {
    pub fn textual(pattern_id: impl Into<String>, location: Location, message: impl Into<String>) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            location,
            message: message.into(),
            layer: Layer::Textual,
        }
    }

    pub fn structural(
        pattern_id: impl Into<String>,
        location: Location,
        message: impl Into<String>,
    ) -> Self {
        Self {
            pattern_id: pattern_id.into(),
            location,
            message: message.into(),
            layer: Layer::Structural,
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.location, self.pattern_id, self.message)
    }
}

/// Outcome of analyzing one submission.
///
/// `allowed` is true exactly when `violations` is empty. Violations are
/// ordered by location, then by pattern id, with exact duplicates removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub allowed: bool,
    pub violations: Vec<Violation>,
    pub denylist_version: String,
}

impl SafetyVerdict {
    pub fn from_violations(mut violations: Vec<Violation>, denylist_version: &str) -> Self {
        violations.sort_by(|a, b| {
            a.location
                .cmp(&b.location)
                .then_with(|| a.pattern_id.cmp(&b.pattern_id))
        });
        violations.dedup_by(|a, b| a.pattern_id == b.pattern_id && a.location == b.location);

        Self {
            allowed: violations.is_empty(),
            violations,
            denylist_version: denylist_version.to_string(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Whether any violation carries exactly this pattern id.
    pub fn has_pattern(&self, pattern_id: &str) -> bool {
        self.violations.iter().any(|v| v.pattern_id == pattern_id)
    }

    /// One human-readable line per violation.
    pub fn summary(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}
