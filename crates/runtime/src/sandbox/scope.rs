//! Execution scope construction
//!
//! The catalog below is the complete set of names a submission can ever see.
//! A scope is the catalog filtered by the submission's capabilities and by the
//! run's allowed bindings; the harness builds a fresh globals dict from it.

use std::collections::BTreeSet;

use analyzer::AnalysisPolicy;
use serde::Serialize;

use crate::config::CaptureConfig;
use crate::dataset::DatasetHandle;
use crate::types::{Capability, CodeSubmission, SandboxConfig, SandboxError};

/// Where the value of a binding comes from inside the run unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BindingSource {
    /// Read-only view over the dataset snapshot
    Dataset,
    /// An imported module
    Module { module: &'static str },
    /// A member of an imported module
    Member {
        module: &'static str,
        member: &'static str,
    },
    /// A Python builtin
    Builtin { builtin: &'static str },
}

impl BindingSource {
    /// Top-level module the binding pulls in, if any.
    pub fn root_module(&self) -> Option<&'static str> {
        match self {
            BindingSource::Module { module } | BindingSource::Member { module, .. } => {
                module.split('.').next()
            }
            BindingSource::Dataset | BindingSource::Builtin { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BindingSpec {
    pub name: &'static str,
    #[serde(skip)]
    pub capability: Capability,
    #[serde(flatten)]
    pub source: BindingSource,
}

/// Every binding a scope can contain.
pub const BINDING_CATALOG: &[BindingSpec] = &[
    BindingSpec {
        name: "df",
        capability: Capability::Tabular,
        source: BindingSource::Dataset,
    },
    BindingSpec {
        name: "pd",
        capability: Capability::Tabular,
        source: BindingSource::Module { module: "pandas" },
    },
    BindingSpec {
        name: "np",
        capability: Capability::Numeric,
        source: BindingSource::Module { module: "numpy" },
    },
    BindingSpec {
        name: "math",
        capability: Capability::Numeric,
        source: BindingSource::Module { module: "math" },
    },
    BindingSpec {
        name: "statistics",
        capability: Capability::Numeric,
        source: BindingSource::Module {
            module: "statistics",
        },
    },
    BindingSpec {
        name: "plt",
        capability: Capability::Plotting,
        source: BindingSource::Module {
            module: "matplotlib.pyplot",
        },
    },
    BindingSpec {
        name: "Pitch",
        capability: Capability::PitchDrawing,
        source: BindingSource::Member {
            module: "mplsoccer",
            member: "Pitch",
        },
    },
    BindingSpec {
        name: "VerticalPitch",
        capability: Capability::PitchDrawing,
        source: BindingSource::Member {
            module: "mplsoccer",
            member: "VerticalPitch",
        },
    },
    BindingSpec {
        name: "print",
        capability: Capability::TextOutput,
        source: BindingSource::Builtin { builtin: "print" },
    },
];

/// Names of every catalog binding.
pub fn catalog_binding_names() -> BTreeSet<String> {
    BINDING_CATALOG.iter().map(|b| b.name.to_string()).collect()
}

/// Limits the harness applies while capturing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CaptureSettings {
    pub dpi: u32,
    pub max_figures: usize,
    pub max_text_bytes: usize,
}

impl CaptureSettings {
    pub fn new(capture: &CaptureConfig, max_text_bytes: usize) -> Self {
        Self {
            dpi: capture.figure_dpi,
            max_figures: capture.max_figures,
            max_text_bytes,
        }
    }
}

/// The restricted scope of one submission.
#[derive(Debug, Clone)]
pub struct SandboxScope {
    bindings: Vec<&'static BindingSpec>,
    allowed_modules: BTreeSet<String>,
    dataset: DatasetHandle,
}

/// Serialized form written to the run unit's stdin.
#[derive(Debug, Serialize)]
struct RunPayload<'a> {
    source: &'a str,
    bindings: &'a [&'static BindingSpec],
    allowed_modules: &'a BTreeSet<String>,
    dataset: serde_json::Value,
    capture: CaptureSettings,
}

impl SandboxScope {
    /// Catalog entries granted by both the capabilities and the allowed bindings.
    pub fn build(
        capabilities: &BTreeSet<Capability>,
        config: &SandboxConfig,
        dataset: DatasetHandle,
    ) -> Self {
        let bindings: Vec<&'static BindingSpec> = BINDING_CATALOG
            .iter()
            .filter(|b| capabilities.contains(&b.capability))
            .filter(|b| config.allowed_bindings().contains(b.name))
            .collect();

        let allowed_modules = bindings
            .iter()
            .filter_map(|b| b.source.root_module())
            .map(str::to_string)
            .collect();

        Self {
            bindings,
            allowed_modules,
            dataset,
        }
    }

    pub fn for_submission(submission: &CodeSubmission, config: &SandboxConfig) -> Self {
        Self::build(
            &submission.requested_capabilities,
            config,
            submission.allowed_dataset_handle.clone(),
        )
    }

    pub fn binding_names(&self) -> Vec<&'static str> {
        self.bindings.iter().map(|b| b.name).collect()
    }

    pub fn has_binding(&self, name: &str) -> bool {
        self.bindings.iter().any(|b| b.name == name)
    }

    pub fn allowed_modules(&self) -> &BTreeSet<String> {
        &self.allowed_modules
    }

    /// Analyzer policy matching what the harness will admit.
    pub fn analysis_policy(&self, max_source_len: usize) -> AnalysisPolicy {
        AnalysisPolicy::new(self.allowed_modules.iter().cloned()).with_max_source_len(max_source_len)
    }

    /// Encode the run payload with a fresh dataset snapshot.
    pub fn payload(&self, source: &str, capture: CaptureSettings) -> Result<Vec<u8>, SandboxError> {
        let dataset = self
            .dataset
            .snapshot()
            .to_json_value()
            .map_err(|e| SandboxError::Payload(e.to_string()))?;
        let payload = RunPayload {
            source,
            bindings: &self.bindings,
            allowed_modules: &self.allowed_modules,
            dataset,
            capture,
        };
        serde_json::to_vec(&payload).map_err(|e| SandboxError::Payload(e.to_string()))
    }
}
