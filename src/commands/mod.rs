pub mod check;
pub mod extract;
pub mod run;

use anyhow::Context;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use scoutbox_runtime::{
    Capability, Dataset, DatasetHandle, ExecutionResult, ExecutionStatus, SafetyVerdict,
};

use crate::SubmissionArgs;

/// Capabilities named on the command line, or all of them.
pub fn capabilities(args: &SubmissionArgs) -> BTreeSet<Capability> {
    if args.capabilities.is_empty() {
        Capability::all()
    } else {
        args.capabilities.iter().copied().collect()
    }
}

pub fn load_dataset(path: &Path) -> anyhow::Result<DatasetHandle> {
    let dataset = Dataset::from_json_file(path)
        .with_context(|| format!("failed to load dataset {}", path.display()))?;
    Ok(DatasetHandle::new(dataset))
}

pub fn read_source(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

pub fn print_verdict(verdict: &SafetyVerdict) {
    if verdict.allowed {
        println!("✓ Allowed (denylist {})", verdict.denylist_version);
        return;
    }

    println!(
        "✗ Rejected: {} violation(s) (denylist {})",
        verdict.violations.len(),
        verdict.denylist_version
    );
    for violation in &verdict.violations {
        println!("  • {}", violation);
    }
}

pub fn print_result(result: &ExecutionResult) {
    let marker = if result.is_success() { "✓" } else { "✗" };
    println!(
        "{} {} in {:?} ({} artifact(s))",
        marker,
        result.status,
        result.elapsed_time,
        result.artifacts.len()
    );
    for diagnostic in &result.diagnostics {
        println!("  {}", diagnostic);
    }
}

/// Write artifacts as `<submission>-<n>.<ext>` and return their paths.
pub fn write_artifacts(dir: &Path, result: &ExecutionResult) -> anyhow::Result<Vec<PathBuf>> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let mut written = Vec::with_capacity(result.artifacts.len());
    for (index, artifact) in result.artifacts.iter().enumerate() {
        let path = dir.join(format!(
            "{}-{}.{}",
            result.submission_id,
            index,
            artifact.extension()
        ));
        fs::write(&path, &artifact.payload)
            .with_context(|| format!("failed to write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}

/// Process exit code for a finished submission.
pub fn exit_code(status: ExecutionStatus) -> i32 {
    match status {
        ExecutionStatus::Success => 0,
        _ => 1,
    }
}
