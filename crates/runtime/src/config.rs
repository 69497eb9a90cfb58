//! Configuration management for the sandbox runtime
//!
//! Values come from built-in defaults, an optional TOML file and `SCOUTBOX_*`
//! environment overrides, in that order. [`Config::validate`] must pass before
//! a [`CodeSandbox`](crate::CodeSandbox) is built from it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::sandbox::scope::catalog_binding_names;
use crate::types::{SandboxConfig, MAX_TIMEOUT};

const MAX_CPU_SLACK_SECONDS: u64 = 60;
const MAX_WATCHDOG_GRACE_SECONDS: u64 = 300;
const MAX_FIGURE_BYTES: usize = 64 * 1024 * 1024;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Environment variable error: {message}")]
    EnvError { message: String },

    #[error("IO error reading config file: {message}")]
    IoError { message: String },

    #[error("Configuration parsing error: {message}")]
    ParseError { message: String },
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Deployment policy for run units
    pub sandbox: SandboxPolicy,
    /// Run-unit concurrency
    pub concurrency: ConcurrencyConfig,
    /// Static analyzer settings
    pub analyzer: AnalyzerConfig,
    /// Figure and text capture
    pub capture: CaptureConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Deployment defaults for every run unit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    /// Wall-clock ceiling per run
    pub timeout_seconds: u64,
    /// Address-space ceiling per run (`RLIMIT_AS`)
    pub memory_limit_bytes: u64,
    /// Bindings a run may receive; defaults to the full catalog
    pub allowed_bindings: BTreeSet<String>,
    /// Extra CPU seconds on top of the timeout before `RLIMIT_CPU` fires
    pub cpu_slack_seconds: u64,
    /// How long the outer watchdog waits past the timeout
    pub watchdog_grace_seconds: u64,
    /// Byte ceiling on captured text and stderr
    pub max_output_bytes: usize,
    /// `RLIMIT_FSIZE` for the run unit
    pub max_file_size_bytes: u64,
    /// `RLIMIT_NOFILE` for the run unit
    pub max_open_files: u64,
    /// Python interpreter used for run units
    pub interpreter: String,
    /// Interpreters `interpreter` may name
    pub allowed_interpreters: Vec<String>,
    /// Parent directory for per-run working directories; system temp dir if unset
    pub working_root: Option<PathBuf>,
}

/// What happens to submissions beyond the concurrency limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for a free slot
    Queue,
    /// Fail immediately with a capacity error
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent: usize,
    pub overflow: OverflowPolicy,
    /// Upper bound on time spent queued; unbounded if unset
    pub queue_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Longest accepted submission, in characters
    pub max_source_len: usize,
    /// Extra regex patterns for the textual pre-filter
    pub extra_deny_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub figure_dpi: u32,
    pub max_figures: usize,
    pub max_figure_bytes: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            memory_limit_bytes: 1024 * 1024 * 1024,
            allowed_bindings: catalog_binding_names(),
            cpu_slack_seconds: 1,
            watchdog_grace_seconds: 2,
            max_output_bytes: 1024 * 1024,
            max_file_size_bytes: 16 * 1024 * 1024,
            max_open_files: 256,
            interpreter: "python3".to_string(),
            allowed_interpreters: vec!["python3".to_string(), "python".to_string()],
            working_root: None,
        }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            overflow: OverflowPolicy::Queue,
            queue_timeout_seconds: None,
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            max_source_len: analyzer::DEFAULT_MAX_SOURCE_LEN,
            extra_deny_patterns: Vec::new(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            figure_dpi: 150,
            max_figures: 8,
            max_figure_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl std::str::FromStr for OverflowPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(OverflowPolicy::Queue),
            "reject" => Ok(OverflowPolicy::Reject),
            other => Err(ConfigError::InvalidValue {
                key: "concurrency.overflow".to_string(),
                reason: format!("'{}' is not one of: queue, reject", other),
            }),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(ConfigError::InvalidValue {
                key: "logging.format".to_string(),
                reason: format!("'{}' is not one of: json, pretty, compact", other),
            }),
        }
    }
}

impl SandboxPolicy {
    /// The per-run limits handed to `submit` when the caller has no opinion.
    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig::new(
            Duration::from_secs(self.timeout_seconds),
            self.memory_limit_bytes,
            self.allowed_bindings.iter().cloned(),
        )
    }
}

impl ConcurrencyConfig {
    pub fn queue_timeout(&self) -> Option<Duration> {
        self.queue_timeout_seconds.map(Duration::from_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: format!("cannot parse '{}'", value),
            }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::EnvError {
            message: format!("{}: {}", key, e),
        }),
    }
}

impl Config {
    /// Load configuration from environment variables and defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        Ok(config)
    }

    /// File (if given), then environment, then validation.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SCOUTBOX_*` overrides on top of the current values
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(timeout) = parse_env("SCOUTBOX_TIMEOUT_SECONDS")? {
            self.sandbox.timeout_seconds = timeout;
        }

        if let Some(memory) = parse_env("SCOUTBOX_MEMORY_LIMIT_BYTES")? {
            self.sandbox.memory_limit_bytes = memory;
        }

        if let Some(max_concurrent) = parse_env("SCOUTBOX_MAX_CONCURRENT")? {
            self.concurrency.max_concurrent = max_concurrent;
        }

        if let Ok(overflow) = env::var("SCOUTBOX_OVERFLOW") {
            self.concurrency.overflow = overflow.parse()?;
        }

        if let Ok(python) = env::var("SCOUTBOX_PYTHON") {
            self.sandbox.interpreter = python;
        }

        if let Ok(log_level) = env::var("SCOUTBOX_LOG_LEVEL") {
            self.logging.level = log_level;
        }

        if let Ok(log_format) = env::var("SCOUTBOX_LOG_FORMAT") {
            self.logging.format = log_format.parse()?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, reason: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: reason.to_string(),
        };

        if self.sandbox.timeout_seconds == 0 {
            return Err(invalid("sandbox.timeout_seconds", "Timeout must be > 0"));
        }

        if self.sandbox.timeout_seconds > MAX_TIMEOUT.as_secs() {
            return Err(invalid(
                "sandbox.timeout_seconds",
                &format!("Timeout must be at most {} seconds", MAX_TIMEOUT.as_secs()),
            ));
        }

        if self.sandbox.cpu_slack_seconds > MAX_CPU_SLACK_SECONDS {
            return Err(invalid(
                "sandbox.cpu_slack_seconds",
                &format!("Must be at most {} seconds", MAX_CPU_SLACK_SECONDS),
            ));
        }

        if self.sandbox.watchdog_grace_seconds > MAX_WATCHDOG_GRACE_SECONDS {
            return Err(invalid(
                "sandbox.watchdog_grace_seconds",
                &format!("Must be at most {} seconds", MAX_WATCHDOG_GRACE_SECONDS),
            ));
        }

        if self.sandbox.memory_limit_bytes < 16 * 1024 * 1024 {
            return Err(invalid(
                "sandbox.memory_limit_bytes",
                "Memory limit must be at least 16 MiB for the interpreter to start",
            ));
        }

        if self.sandbox.max_output_bytes == 0 {
            return Err(invalid("sandbox.max_output_bytes", "Output ceiling must be > 0"));
        }

        if self.sandbox.max_open_files < 16 {
            return Err(invalid("sandbox.max_open_files", "Must allow at least 16 files"));
        }

        if self.sandbox.interpreter.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "sandbox.interpreter".to_string(),
            });
        }

        let interpreter_name = self
            .sandbox
            .interpreter
            .rsplit('/')
            .next()
            .unwrap_or(&self.sandbox.interpreter);
        if !self
            .sandbox
            .allowed_interpreters
            .iter()
            .any(|allowed| allowed == &self.sandbox.interpreter || allowed == interpreter_name)
        {
            return Err(ConfigError::InvalidValue {
                key: "sandbox.interpreter".to_string(),
                reason: format!(
                    "'{}' is not in allowed_interpreters: {:?}",
                    self.sandbox.interpreter, self.sandbox.allowed_interpreters
                ),
            });
        }

        if let Some(root) = &self.sandbox.working_root {
            if !root.is_absolute() {
                return Err(invalid(
                    "sandbox.working_root",
                    "Working root must be an absolute path",
                ));
            }
        }

        let catalog = catalog_binding_names();
        if let Some(unknown) = self
            .sandbox
            .allowed_bindings
            .iter()
            .find(|name| !catalog.contains(*name))
        {
            return Err(ConfigError::InvalidValue {
                key: "sandbox.allowed_bindings".to_string(),
                reason: format!(
                    "'{}' is not a known binding; known bindings: {}",
                    unknown,
                    catalog.iter().cloned().collect::<Vec<_>>().join(", ")
                ),
            });
        }

        if self.concurrency.max_concurrent == 0 {
            return Err(invalid(
                "concurrency.max_concurrent",
                "At least one run unit must be allowed",
            ));
        }

        if self.analyzer.max_source_len == 0 {
            return Err(invalid("analyzer.max_source_len", "Must be > 0"));
        }

        for pattern in &self.analyzer.extra_deny_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(ConfigError::InvalidValue {
                    key: "analyzer.extra_deny_patterns".to_string(),
                    reason: format!("'{}': {}", pattern, e),
                });
            }
        }

        if !(10..=600).contains(&self.capture.figure_dpi) {
            return Err(invalid("capture.figure_dpi", "DPI must be between 10 and 600"));
        }

        if self.capture.max_figure_bytes == 0 || self.capture.max_figure_bytes > MAX_FIGURE_BYTES {
            return Err(invalid(
                "capture.max_figure_bytes",
                &format!("Must be between 1 and {} bytes", MAX_FIGURE_BYTES),
            ));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "logging.level".to_string(),
                reason: format!("Must be one of: {}", valid_levels.join(", ")),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sandbox.timeout_seconds, 30);
        assert_eq!(config.sandbox.memory_limit_bytes, 1 << 30);
        assert_eq!(config.analyzer.max_source_len, 5000);
        assert_eq!(config.capture.figure_dpi, 150);
        assert_eq!(config.concurrency.overflow, OverflowPolicy::Queue);
        assert!(config.sandbox.allowed_bindings.contains("df"));
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        env::set_var("SCOUTBOX_TIMEOUT_SECONDS", "5");
        env::set_var("SCOUTBOX_MAX_CONCURRENT", "10");
        env::set_var("SCOUTBOX_OVERFLOW", "reject");
        env::set_var("SCOUTBOX_LOG_FORMAT", "json");

        let config = Config::from_env().unwrap();
        assert_eq!(config.sandbox.timeout_seconds, 5);
        assert_eq!(config.concurrency.max_concurrent, 10);
        assert_eq!(config.concurrency.overflow, OverflowPolicy::Reject);
        assert_eq!(config.logging.format, LogFormat::Json);

        // Cleanup
        env::remove_var("SCOUTBOX_TIMEOUT_SECONDS");
        env::remove_var("SCOUTBOX_MAX_CONCURRENT");
        env::remove_var("SCOUTBOX_OVERFLOW");
        env::remove_var("SCOUTBOX_LOG_FORMAT");
    }

    #[test]
    #[serial]
    fn test_config_from_env_invalid_number() {
        env::set_var("SCOUTBOX_MEMORY_LIMIT_BYTES", "lots");
        let result = Config::from_env();
        env::remove_var("SCOUTBOX_MEMORY_LIMIT_BYTES");

        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_from_file_with_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[sandbox]
timeout_seconds = 2
allowed_bindings = ["df", "plt", "print"]

[concurrency]
max_concurrent = 10
overflow = "reject"

[capture]
figure_dpi = 72
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.sandbox.timeout_seconds, 2);
        assert_eq!(config.sandbox.memory_limit_bytes, 1 << 30);
        assert_eq!(config.sandbox.allowed_bindings.len(), 3);
        assert_eq!(config.concurrency.overflow, OverflowPolicy::Reject);
        assert_eq!(config.capture.figure_dpi, 72);
        assert_eq!(config.capture.max_figures, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_binding_is_rejected() {
        let mut config = Config::default();
        config.sandbox.allowed_bindings.insert("os".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_interpreter_must_be_allowed() {
        let mut config = Config::default();
        config.sandbox.interpreter = "/usr/bin/python3".to_string();
        assert!(config.validate().is_ok());

        config.sandbox.interpreter = "bash".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_deny_pattern() {
        let mut config = Config::default();
        config.analyzer.extra_deny_patterns.push("(".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let mut config = Config::default();
        config.sandbox.timeout_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unbounded_limits_are_rejected() {
        let mut config = Config::default();
        config.sandbox.timeout_seconds = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sandbox.cpu_slack_seconds = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sandbox.watchdog_grace_seconds = u64::MAX;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.capture.max_figure_bytes = usize::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_builds_sandbox_config() {
        let policy = SandboxPolicy::default();
        let sandbox = policy.sandbox_config();
        assert_eq!(sandbox.timeout(), Duration::from_secs(30));
        assert_eq!(sandbox.allowed_bindings(), &policy.allowed_bindings);
    }
}
