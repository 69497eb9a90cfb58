//! Intake of model-generated responses
//!
//! A language model answers with a written report followed by fenced Python
//! blocks. The receiver pulls those blocks out, repairs the mistakes models
//! commonly make, and wraps each block as a [`CodeSubmission`]. Repairs run
//! before analysis, so repaired code is analyzed like any other submission.

use std::collections::{BTreeMap, BTreeSet};

use regex::{Captures, Regex};

use crate::dataset::{Dataset, DatasetHandle};
use crate::types::{Capability, CodeSubmission};

/// Section heading after which visualization code is expected.
pub const VISUALIZATIONS_MARKER: &str = "## SUGGESTED VISUALIZATIONS";

const CODE_BLOCK_PATTERN: &str = r"(?s)```python(.*?)```";
const COLUMN_REFERENCE_PATTERN: &str = r#"df\[['"](.*?)['"]\]"#;

/// Minimum similarity for a column name correction.
pub const COLUMN_MATCH_CUTOFF: f32 = 0.6;

/// Literal fixes for frequent generation mistakes, applied in order.
const REPLACEMENTS: &[(&str, &str)] = &[
    ("mplsoccer()", "Pitch()"),
    ("mplsoccer.Pitch()", "Pitch()"),
    ("from mplsoccer import *", "from mplsoccer import Pitch"),
    ("plt.show()()", "plt.show()"),
    ("plt.plt.", "plt."),
    ("plt..", "plt."),
];

/// Source after automatic repair, with a log of what changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedSource {
    pub source: String,
    pub corrections: Vec<String>,
}

/// Extract fenced Python blocks from a model response.
///
/// Only blocks after [`VISUALIZATIONS_MARKER`] are taken when the marker is
/// present; otherwise every block is. Blocks are trimmed and empty ones dropped.
pub fn extract_code_blocks(response: &str) -> Vec<String> {
    let Ok(pattern) = Regex::new(CODE_BLOCK_PATTERN) else {
        tracing::error!("Code block pattern failed to compile");
        return Vec::new();
    };

    let section = match response.find(VISUALIZATIONS_MARKER) {
        Some(start) => &response[start..],
        None => response,
    };

    pattern
        .captures_iter(section)
        .filter_map(|caps| caps.get(1))
        .map(|block| block.as_str().trim().to_string())
        .filter(|block| !block.is_empty())
        .collect()
}

/// Repair common mistakes and misspelled `df['column']` references.
pub fn auto_fix(source: &str, dataset: &Dataset) -> FixedSource {
    let mut corrections = Vec::new();
    let mut fixed = source.to_string();

    for (wrong, right) in REPLACEMENTS {
        if fixed.contains(wrong) {
            fixed = fixed.replace(wrong, right);
            corrections.push(format!("Code fix: '{}' -> '{}'", wrong, right));
        }
    }

    let Ok(reference) = Regex::new(COLUMN_REFERENCE_PATTERN) else {
        tracing::error!("Column reference pattern failed to compile");
        return FixedSource {
            source: fixed,
            corrections,
        };
    };

    let columns: Vec<&str> = dataset.columns().iter().map(String::as_str).collect();
    let mut resolved: BTreeMap<String, Option<String>> = BTreeMap::new();

    let fixed = reference
        .replace_all(&fixed, |caps: &Captures| {
            let name = &caps[1];
            if dataset.has_column(name) {
                return caps[0].to_string();
            }

            let replacement = resolved.entry(name.to_string()).or_insert_with(|| {
                let best = similar::get_close_matches(name, columns.as_slice(), 1, COLUMN_MATCH_CUTOFF)
                    .first()
                    .map(|c| c.to_string());
                match &best {
                    Some(column) => {
                        corrections.push(format!("Column fix: '{}' -> '{}'", name, column))
                    }
                    None => corrections.push(format!(
                        "Warning: Column '{}' not found and no close match available",
                        name
                    )),
                }
                best
            });

            match replacement {
                Some(column) => format!("df['{}']", column),
                None => caps[0].to_string(),
            }
        })
        .into_owned();

    for correction in &corrections {
        tracing::info!("{}", correction);
    }

    FixedSource {
        source: fixed,
        corrections,
    }
}

/// One code block from a response, ready to submit.
#[derive(Debug)]
pub struct ReceivedSubmission {
    /// Position of the block in the response
    pub block_index: usize,
    pub submission: CodeSubmission,
    pub corrections: Vec<String>,
}

/// Turns generated responses into submissions
#[derive(Debug, Clone)]
pub struct SubmissionReceiver {
    auto_fix: bool,
}

impl Default for SubmissionReceiver {
    fn default() -> Self {
        Self { auto_fix: true }
    }
}

impl SubmissionReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave extracted code exactly as generated.
    pub fn without_auto_fix() -> Self {
        Self { auto_fix: false }
    }

    pub fn receive_generated(
        &self,
        response: &str,
        dataset: &DatasetHandle,
        capabilities: &BTreeSet<Capability>,
    ) -> Vec<ReceivedSubmission> {
        let blocks = extract_code_blocks(response);
        tracing::debug!(blocks = blocks.len(), "Extracted code blocks from response");

        blocks
            .into_iter()
            .enumerate()
            .map(|(block_index, block)| {
                let FixedSource {
                    source,
                    corrections,
                } = if self.auto_fix {
                    auto_fix(&block, dataset.dataset())
                } else {
                    FixedSource {
                        source: block,
                        corrections: Vec::new(),
                    }
                };

                let submission = CodeSubmission::new(source, dataset.clone())
                    .with_capabilities(capabilities.iter().copied());

                ReceivedSubmission {
                    block_index,
                    submission,
                    corrections,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Cell;

    fn match_stats() -> Dataset {
        Dataset::new(
            vec!["player".into(), "shots_on_target".into(), "xG".into()],
            vec![vec![Cell::Text("Saka".into()), Cell::Int(3), Cell::Float(0.7)]],
        )
        .unwrap()
    }

    const RESPONSE: &str = "Arsenal controlled the game.\n\n\
```python\nprint('report block')\n```\n\n\
## SUGGESTED VISUALIZATIONS\n\n\
```python\nplt.bar(df['player'], df['xG'])\n```\n\n\
```python\n\n```\n\n\
```python\npitch = mplsoccer()\n```\n";

    #[test]
    fn test_blocks_after_marker_only() {
        let blocks = extract_code_blocks(RESPONSE);
        assert_eq!(
            blocks,
            vec![
                "plt.bar(df['player'], df['xG'])".to_string(),
                "pitch = mplsoccer()".to_string(),
            ]
        );
    }

    #[test]
    fn test_all_blocks_without_marker() {
        let response = "```python\nx = 1\n```\ntext\n```python\ny = 2\n```";
        assert_eq!(extract_code_blocks(response), vec!["x = 1", "y = 2"]);
        assert!(extract_code_blocks("no code here").is_empty());
    }

    #[test]
    fn test_literal_replacements() {
        let fixed = auto_fix("pitch = mplsoccer()\nplt.plt.show()", &match_stats());
        assert_eq!(fixed.source, "pitch = Pitch()\nplt.show()");
        assert_eq!(fixed.corrections.len(), 2);
    }

    #[test]
    fn test_column_names_are_corrected() {
        let source = "plt.bar(df['players'], df[\"shots_on_targt\"])\nprint(df['players'])";
        let fixed = auto_fix(source, &match_stats());

        assert_eq!(
            fixed.source,
            "plt.bar(df['player'], df['shots_on_target'])\nprint(df['player'])"
        );
        assert_eq!(
            fixed.corrections,
            vec![
                "Column fix: 'players' -> 'player'".to_string(),
                "Column fix: 'shots_on_targt' -> 'shots_on_target'".to_string(),
            ]
        );
    }

    #[test]
    fn test_unmatched_column_is_reported_not_changed() {
        let fixed = auto_fix("df['possession']", &match_stats());
        assert_eq!(fixed.source, "df['possession']");
        assert!(fixed.corrections[0].starts_with("Warning: Column 'possession'"));
    }

    #[test]
    fn test_receive_generated() {
        let dataset = DatasetHandle::new(match_stats());
        let caps: BTreeSet<_> = [Capability::Plotting, Capability::PitchDrawing].into();

        let received = SubmissionReceiver::new().receive_generated(RESPONSE, &dataset, &caps);
        assert_eq!(received.len(), 2);
        assert_eq!(received[1].block_index, 1);
        assert_eq!(received[1].submission.source_text, "pitch = Pitch()");
        assert_eq!(received[1].submission.requested_capabilities, caps);
        assert_eq!(
            received[0].submission.allowed_dataset_handle.fingerprint(),
            dataset.fingerprint()
        );

        let raw = SubmissionReceiver::without_auto_fix().receive_generated(RESPONSE, &dataset, &caps);
        assert_eq!(raw[1].submission.source_text, "pitch = mplsoccer()");
        assert!(raw[1].corrections.is_empty());
    }
}
