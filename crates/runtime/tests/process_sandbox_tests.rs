//! End-to-end runs through the process runner.
//!
//! Each test skips itself when no `python3` is on `PATH`. Tests that draw
//! figures additionally need matplotlib.

use std::sync::Arc;
use std::time::{Duration, Instant};

use scoutbox_runtime::capture::PNG_SIGNATURE;
use scoutbox_runtime::{
    ArtifactKind, Capability, CodeSandbox, CodeSubmission, Config, Dataset, DatasetHandle,
    ExecutionStatus, SandboxConfig,
};

fn sandbox(configure: impl FnOnce(&mut Config)) -> Option<Arc<CodeSandbox>> {
    let mut config = Config::default();
    configure(&mut config);
    // Skip tests if python3 not available
    CodeSandbox::new(config).ok().map(Arc::new)
}

fn python_has(module: &str) -> bool {
    std::process::Command::new("python3")
        .args(["-c", &format!("import {}", module)])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn dataset() -> DatasetHandle {
    DatasetHandle::new(
        Dataset::from_json_str(
            r#"[{"player": "Saka", "goals": 1, "xG": 0.62}, {"player": "Odegaard", "goals": 0, "xG": 0.18}]"#,
        )
        .unwrap(),
    )
}

/// Text-only scope: no third-party modules are imported by the harness.
fn text_limits(timeout: Duration, memory: u64) -> SandboxConfig {
    SandboxConfig::new(timeout, memory, ["print"])
}

fn text_submission(source: &str) -> CodeSubmission {
    CodeSubmission::new(source, dataset()).with_capabilities([Capability::TextOutput])
}

#[tokio::test]
async fn test_print_one_plus_one() {
    let Some(sandbox) = sandbox(|_| {}) else { return };

    let result = sandbox
        .submit(
            text_submission("print(1+1)"),
            &text_limits(Duration::from_secs(10), 512 * 1024 * 1024),
        )
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.diagnostics);
    assert!(result.diagnostics.iter().any(|d| d == "2"));
    assert_eq!(result.text_output(), Some("2\n"));
}

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let Some(sandbox) = sandbox(|_| {}) else { return };

    let started = Instant::now();
    let result = sandbox
        .submit(
            text_submission("while True:\n    pass"),
            &text_limits(Duration::from_secs(2), 512 * 1024 * 1024),
        )
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert!(result.elapsed_time >= Duration::from_secs(2));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn test_memory_ceiling() {
    let Some(sandbox) = sandbox(|_| {}) else { return };

    let result = sandbox
        .submit(
            text_submission("blocks = [0] * 10**9\nprint(len(blocks))"),
            &text_limits(Duration::from_secs(10), 256 * 1024 * 1024),
        )
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::ResourceExceeded, "{:?}", result.diagnostics);
}

#[tokio::test]
async fn test_raised_error_is_runtime_error() {
    let Some(sandbox) = sandbox(|_| {}) else { return };

    let result = sandbox
        .submit(
            text_submission("print('before')\nprint(1/0)"),
            &text_limits(Duration::from_secs(10), 512 * 1024 * 1024),
        )
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::RuntimeError);
    assert_eq!(result.diagnostics[0], "ZeroDivisionError: division by zero (line 2)");
    assert!(result.diagnostics.iter().any(|d| d == "before"));
}

#[tokio::test]
async fn test_unbound_names_are_unavailable() {
    let Some(sandbox) = sandbox(|_| {}) else { return };

    // `df` exists in the catalog but was not granted to this run.
    let result = sandbox
        .submit(
            text_submission("print(len(df))"),
            &text_limits(Duration::from_secs(10), 512 * 1024 * 1024),
        )
        .await
        .unwrap();

    assert_eq!(result.status, ExecutionStatus::RuntimeError);
    assert!(result.diagnostics[0].starts_with("NameError"));
}

#[tokio::test]
async fn test_dataset_is_unchanged_by_mutation_attempts() {
    let Some(sandbox) = sandbox(|_| {}) else { return };
    let handle = dataset();
    let before = handle.fingerprint();
    let limits = SandboxConfig::new(Duration::from_secs(10), 512 * 1024 * 1024, ["df", "print"]);
    let caps = [Capability::Tabular, Capability::TextOutput];

    let direct = CodeSubmission::new("df['goals'] = (9, 9)", handle.clone()).with_capabilities(caps);
    let result = sandbox.submit(direct, &limits).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::RuntimeError);

    let copied = CodeSubmission::new(
        "goals = list(df['goals'])\ngoals.append(99)\nprint(len(df['goals']))",
        handle.clone(),
    )
    .with_capabilities(caps);
    let result = sandbox.submit(copied, &limits).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.diagnostics);
    assert_eq!(result.text_output(), Some("2\n"));

    assert_eq!(handle.fingerprint(), before);
}

#[tokio::test]
async fn test_dataframe_view_refuses_mutation() {
    if !python_has("pandas") {
        return;
    }
    let Some(sandbox) = sandbox(|_| {}) else { return };
    let handle = dataset();
    let before = handle.fingerprint();
    let limits = SandboxConfig::new(Duration::from_secs(30), 1024 * 1024 * 1024, ["df", "pd", "print"]);

    let source = r#"
def attempt(action):
    try:
        action()
    except (TypeError, ValueError):
        return 1
    return 0

def assign_column():
    df['goals'] = [9, 9]

def assign_cell():
    df.loc[0, 'goals'] = 9

def assign_position():
    df.iloc[0, 1] = 9

def drop_in_place():
    df.drop(columns=['goals'], inplace=True)

def rename_columns():
    df.columns = ['a', 'b', 'c']

blocked = sum(attempt(f) for f in [assign_column, assign_cell, assign_position, drop_in_place, rename_columns])
print('blocked', blocked)
copy = df.copy()
copy['goals'] = [5, 5]
print(df['goals'].tolist(), copy['goals'].tolist(), len(df.columns))
"#;
    let submission = CodeSubmission::new(source, handle.clone())
        .with_capabilities([Capability::Tabular, Capability::TextOutput]);

    let result = sandbox.submit(submission, &limits).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.diagnostics);
    assert_eq!(result.text_output(), Some("blocked 5\n[1, 0] [5, 5] 3\n"));
    assert_eq!(handle.fingerprint(), before);
}

#[tokio::test]
async fn test_repeated_runs_are_identical() {
    let Some(sandbox) = sandbox(|_| {}) else { return };
    let source = "print(hash('arsenal'))\nprint(sorted({'b', 'a', 'c'}))";
    let limits = text_limits(Duration::from_secs(10), 512 * 1024 * 1024);

    let first = sandbox.submit(text_submission(source), &limits).await.unwrap();
    let second = sandbox.submit(text_submission(source), &limits).await.unwrap();

    assert_eq!(first.status, ExecutionStatus::Success);
    assert_eq!(first.status, second.status);
    assert_eq!(first.artifacts, second.artifacts);
}

#[tokio::test]
async fn test_ten_concurrent_submissions() {
    let Some(sandbox) = sandbox(|config| config.concurrency.max_concurrent = 10) else {
        return;
    };

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let sandbox = sandbox.clone();
            tokio::spawn(async move {
                let result = sandbox
                    .submit(
                        text_submission(&format!("print({} * 11)", i)),
                        &text_limits(Duration::from_secs(20), 512 * 1024 * 1024),
                    )
                    .await
                    .unwrap();
                (i, result)
            })
        })
        .collect();

    for handle in handles {
        let (i, result) = handle.await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.diagnostics);
        assert_eq!(result.text_output(), Some(format!("{}\n", i * 11).as_str()));
    }
    assert_eq!(sandbox.in_flight(), 0);
}

#[tokio::test]
async fn test_cancel_running_process() {
    let Some(sandbox) = sandbox(|_| {}) else { return };
    let submission = text_submission("while True:\n    pass");
    let id = submission.id;

    let handle = {
        let sandbox = sandbox.clone();
        tokio::spawn(async move {
            sandbox
                .submit(submission, &text_limits(Duration::from_secs(30), 512 * 1024 * 1024))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(sandbox.cancel(&id));

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn test_figure_is_captured_as_png() {
    if !python_has("matplotlib") {
        return;
    }
    let Some(sandbox) = sandbox(|_| {}) else { return };

    let limits = SandboxConfig::new(Duration::from_secs(30), 1024 * 1024 * 1024, ["plt", "print"]);
    let submission = CodeSubmission::new(
        "fig, ax = plt.subplots()\nax.bar(['Saka', 'Odegaard'], [0.62, 0.18])\nax.set_title('xG')",
        dataset(),
    )
    .with_capabilities([Capability::Plotting, Capability::TextOutput]);

    let result = sandbox.submit(submission, &limits).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Success, "{:?}", result.diagnostics);

    let figures: Vec<_> = result.figures().collect();
    assert_eq!(figures.len(), 1);
    assert_eq!(figures[0].kind, ArtifactKind::Figure);
    assert!(figures[0].payload.starts_with(PNG_SIGNATURE));
}
