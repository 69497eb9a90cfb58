//! Static safety analysis for generated Python visualization code.
//!
//! Two layers run over every submission: a line-oriented regex pre-filter and
//! an authoritative walk over the Tree-sitter syntax tree. All findings of both
//! layers are collected into one [`SafetyVerdict`]. The analyzer never executes
//! the code it inspects.

use std::collections::BTreeSet;

use thiserror::Error;

pub mod denylist;
pub mod prefilter;
pub mod structural;
pub mod verdict;

pub use denylist::DENYLIST_VERSION;
pub use prefilter::TextualPrefilter;
pub use verdict::{Layer, Location, SafetyVerdict, Violation};

/// Pattern id reported when a submission exceeds the source length ceiling.
pub const SOURCE_LENGTH: &str = "limit:source-length";

/// Default ceiling on submission length, in characters.
pub const DEFAULT_MAX_SOURCE_LEN: usize = 5000;

/// Analyzer construction errors
#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("Invalid deny pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Python grammar could not be loaded: {0}")]
    Language(String),

    #[error("Parser gave up before producing a syntax tree")]
    ParseAborted,
}

/// What a submission is allowed to reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisPolicy {
    /// Top-level modules that may be imported; submodules follow their parent.
    pub allowed_modules: BTreeSet<String>,
    /// Longest accepted source, in characters.
    pub max_source_len: usize,
}

impl AnalysisPolicy {
    pub fn new<I, S>(allowed_modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed_modules: allowed_modules.into_iter().map(Into::into).collect(),
            max_source_len: DEFAULT_MAX_SOURCE_LEN,
        }
    }

    pub fn with_max_source_len(mut self, max_source_len: usize) -> Self {
        self.max_source_len = max_source_len;
        self
    }

    /// `matplotlib.pyplot` is allowed when `matplotlib` is.
    pub fn is_module_allowed(&self, module: &str) -> bool {
        self.allowed_modules.iter().any(|allowed| {
            module == allowed
                || (module.starts_with(allowed.as_str())
                    && module[allowed.len()..].starts_with('.'))
        })
    }
}

impl Default for AnalysisPolicy {
    fn default() -> Self {
        Self::new(std::iter::empty::<String>())
    }
}

/// Runs both analyzer layers against a submission.
#[derive(Debug, Clone, Default)]
pub struct SafetyAnalyzer {
    prefilter: TextualPrefilter,
}

impl SafetyAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyzer whose pre-filter also carries deployment deny patterns.
    pub fn with_custom_patterns(patterns: &[String]) -> Result<Self, AnalyzerError> {
        Ok(Self {
            prefilter: TextualPrefilter::with_custom_patterns(patterns)?,
        })
    }

    /// Analyze `source` under `policy`.
    ///
    /// Infallible from the caller's point of view: a source that cannot be
    /// parsed is reported as `ast:syntax-error`, never as an error value.
    pub fn analyze(&self, source: &str, policy: &AnalysisPolicy) -> SafetyVerdict {
        let mut violations = self.prefilter.scan(source);

        let length = source.chars().count();
        if length > policy.max_source_len {
            violations.push(Violation::textual(
                SOURCE_LENGTH,
                Location::start(),
                format!(
                    "Source is {} characters long; the limit is {}",
                    length, policy.max_source_len
                ),
            ));
        } else {
            match structural::check(source, policy) {
                Ok(found) => violations.extend(found),
                Err(e) => {
                    tracing::error!(error = %e, "Structural analysis failed");
                    violations.push(Violation::structural(
                        structural::SYNTAX_ERROR,
                        Location::start(),
                        "Source could not be parsed",
                    ));
                }
            }
        }

        let verdict = SafetyVerdict::from_violations(violations, DENYLIST_VERSION);
        tracing::debug!(
            allowed = verdict.allowed,
            violations = verdict.violations.len(),
            denylist_version = DENYLIST_VERSION,
            "Analyzed submission"
        );
        verdict
    }
}

/// Analyze with the built-in denylist only.
pub fn analyze(source: &str, policy: &AnalysisPolicy) -> SafetyVerdict {
    SafetyAnalyzer::new().analyze(source, policy)
}
