use std::path::Path;

use analyzer::SafetyAnalyzer;
use scoutbox_runtime::sandbox::SandboxScope;
use scoutbox_runtime::{Config, Dataset, DatasetHandle};

use super::{capabilities, print_verdict, read_source};
use crate::SubmissionArgs;

/// Analyze `file` with the policy a run would use. Exit code 1 when rejected.
pub fn run(config: &Config, file: &Path, args: &SubmissionArgs) -> anyhow::Result<i32> {
    let source = read_source(file)?;
    let analyzer = SafetyAnalyzer::with_custom_patterns(&config.analyzer.extra_deny_patterns)?;

    let scope = SandboxScope::build(
        &capabilities(args),
        &config.sandbox.sandbox_config(),
        DatasetHandle::new(Dataset::empty()),
    );
    let verdict = analyzer.analyze(&source, &scope.analysis_policy(config.analyzer.max_source_len));

    if args.json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        print_verdict(&verdict);
    }

    Ok(if verdict.allowed { 0 } else { 1 })
}
