use std::path::PathBuf;

use scoutbox_runtime::{CodeSandbox, Config, ExecutionStatus, SubmissionReceiver};

use super::{capabilities, load_dataset, print_result, read_source, write_artifacts};
use crate::SubmissionArgs;

pub struct ExtractOptions {
    pub response: PathBuf,
    pub dataset: PathBuf,
    pub run: bool,
    pub artifacts_dir: Option<PathBuf>,
    pub submission: SubmissionArgs,
}

/// Print the repaired blocks of a model response, optionally running each.
pub async fn run(config: Config, options: ExtractOptions) -> anyhow::Result<i32> {
    let response = read_source(&options.response)?;
    let dataset = load_dataset(&options.dataset)?;
    let received = SubmissionReceiver::new().receive_generated(
        &response,
        &dataset,
        &capabilities(&options.submission),
    );

    if received.is_empty() {
        println!("○ No Python code blocks found");
        return Ok(1);
    }

    let sandbox = if options.run {
        Some(CodeSandbox::new(config)?)
    } else {
        None
    };

    let mut all_succeeded = true;
    for block in received {
        println!("── Block {} ──", block.block_index + 1);
        for correction in &block.corrections {
            println!("  • {}", correction);
        }
        println!("{}", block.submission.source_text);

        let Some(sandbox) = &sandbox else { continue };
        let limits = sandbox.default_sandbox_config();
        let result = sandbox.submit(block.submission, &limits).await?;

        if options.submission.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            print_result(&result);
        }
        if let Some(dir) = &options.artifacts_dir {
            for path in write_artifacts(dir, &result)? {
                println!("  → {}", path.display());
            }
        }
        all_succeeded &= result.status == ExecutionStatus::Success;
    }

    Ok(if all_succeeded { 0 } else { 1 })
}
