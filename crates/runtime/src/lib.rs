//! Scoutbox Sandbox Runtime
//!
//! Runs untrusted, model-generated Python plotting code against a read-only
//! dataset. Every submission passes the static safety analyzer first; only
//! allowed code reaches an isolated, resource-bounded run unit. Each admitted
//! submission ends in exactly one [`ExecutionResult`].
//!
//! ```no_run
//! use scoutbox_runtime::{CodeSandbox, CodeSubmission, Config, Dataset, DatasetHandle};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let sandbox = CodeSandbox::new(Config::default())?;
//! let dataset = DatasetHandle::new(Dataset::from_json_str(r#"{"columns": ["xG"], "rows": [[0.4]]}"#)?);
//! let result = sandbox
//!     .submit(CodeSubmission::new("print(1+1)", dataset), &sandbox.default_sandbox_config())
//!     .await?;
//! assert!(result.is_success());
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod capture;
pub mod config;
pub mod dataset;
pub mod executor;
pub mod logging;
pub mod receiver;
pub mod sandbox;
pub mod types;

pub use aggregate::VerdictAggregator;
pub use config::{Config, ConfigError, LogFormat, LoggingConfig, OverflowPolicy};
pub use dataset::{Cell, Dataset, DatasetHandle, DatasetSnapshot};
pub use executor::CodeSandbox;
pub use receiver::{auto_fix, extract_code_blocks, FixedSource, ReceivedSubmission, SubmissionReceiver};
pub use sandbox::{ProcessRunner, ProcessRunnerConfig, RunOutcome, RunReport, RunRequest, SandboxRunner};
pub use types::*;

pub use analyzer::{Location, SafetyVerdict, Violation, DENYLIST_VERSION};
