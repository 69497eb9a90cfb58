use regex::Regex;

use crate::denylist::TEXT_RULES;
use crate::verdict::{Location, Violation};
use crate::AnalyzerError;

/// A compiled pre-filter rule.
#[derive(Debug, Clone)]
struct CompiledRule {
    id: String,
    regex: Regex,
    message: String,
}

/// Line-oriented regex scan over the raw submission text.
///
/// This layer is cheap and deliberately noisy; the structural walk is the
/// authoritative check.
#[derive(Debug, Clone)]
pub struct TextualPrefilter {
    rules: Vec<CompiledRule>,
}

impl TextualPrefilter {
    /// Create a pre-filter with the built-in denylist rules.
    pub fn new() -> Self {
        let rules = TEXT_RULES
            .iter()
            .filter_map(|rule| match Regex::new(rule.pattern) {
                Ok(regex) => Some(CompiledRule {
                    id: rule.id.to_string(),
                    regex,
                    message: rule.message.to_string(),
                }),
                Err(e) => {
                    tracing::error!(rule = rule.id, error = %e, "Built-in pre-filter rule failed to compile");
                    None
                }
            })
            .collect();

        Self { rules }
    }

    /// Create a pre-filter with deployment patterns appended to the defaults.
    ///
    /// Custom rules are numbered in order of appearance, `text:custom:1`,
    /// `text:custom:2`, and so on. An invalid pattern is rejected rather than
    /// silently skipped.
    pub fn with_custom_patterns(patterns: &[String]) -> Result<Self, AnalyzerError> {
        let mut prefilter = Self::new();

        for (index, pattern) in patterns.iter().enumerate() {
            let regex = Regex::new(pattern).map_err(|source| AnalyzerError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })?;
            prefilter.rules.push(CompiledRule {
                id: format!("text:custom:{}", index + 1),
                regex,
                message: format!("Matched deployment deny pattern: {}", pattern),
            });
        }

        Ok(prefilter)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Scan the source line by line, reporting the first match of each rule
    /// on each line. Columns are 1-based byte offsets, as in the structural
    /// layer.
    pub fn scan(&self, source: &str) -> Vec<Violation> {
        let mut violations = Vec::new();

        for (line_index, line) in source.lines().enumerate() {
            for rule in &self.rules {
                if let Some(found) = rule.regex.find(line) {
                    violations.push(Violation::textual(
                        rule.id.clone(),
                        Location::new(line_index + 1, found.start() + 1),
                        rule.message.clone(),
                    ));
                }
            }
        }

        violations
    }
}

impl Default for TextualPrefilter {
    fn default() -> Self {
        Self::new()
    }
}
