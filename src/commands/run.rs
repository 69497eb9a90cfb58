use std::path::PathBuf;
use std::time::Duration;

use scoutbox_runtime::{CodeSandbox, CodeSubmission, Config, SandboxConfig};

use super::{capabilities, exit_code, load_dataset, print_result, read_source, write_artifacts};
use crate::SubmissionArgs;

pub struct RunOptions {
    pub file: PathBuf,
    pub dataset: PathBuf,
    pub timeout: Option<u64>,
    pub memory: Option<u64>,
    pub artifacts_dir: Option<PathBuf>,
    pub submission: SubmissionArgs,
}

pub async fn run(config: Config, options: RunOptions) -> anyhow::Result<i32> {
    let source = read_source(&options.file)?;
    let dataset = load_dataset(&options.dataset)?;

    let defaults = config.sandbox.sandbox_config();
    let limits = SandboxConfig::new(
        options
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout()),
        options.memory.unwrap_or(defaults.memory_limit_bytes()),
        defaults.allowed_bindings().iter().cloned(),
    );

    let sandbox = CodeSandbox::new(config)?;
    let submission =
        CodeSubmission::new(source, dataset).with_capabilities(capabilities(&options.submission));
    let id = submission.id;

    let interrupt = {
        let sandbox = sandbox.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted; cancelling submission");
                sandbox.cancel(&id);
            }
        })
    };

    let result = sandbox.submit(submission, &limits).await?;
    interrupt.abort();

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

    Ok(exit_code(result.status))
}
