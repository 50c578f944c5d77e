//! Core types for sandbox execution

use crate::language::Language;
use crate::limits::LimitOverrides;
use serde::{Deserialize, Serialize};

/// Request to execute code. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// The code to execute
    pub code: String,

    /// Requested language, resolved during provisioning
    #[serde(default = "default_lang")]
    pub lang: String,

    /// Keep the prepared template (image or library environment) afterwards
    #[serde(default)]
    pub keep_template: bool,

    /// Packages installed before the code runs, in order
    #[serde(default)]
    pub libraries: Vec<String>,

    /// Caller overrides; may only tighten the configured limits
    #[serde(default)]
    pub limits: LimitOverrides,
}

fn default_lang() -> String {
    Language::Python.as_str().to_string()
}

impl ExecutionRequest {
    /// Create a python execution request
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            lang: default_lang(),
            keep_template: false,
            libraries: Vec::new(),
            limits: LimitOverrides::default(),
        }
    }

    /// Set the language
    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    /// Add a library to install before running
    pub fn with_library(mut self, library: impl Into<String>) -> Self {
        self.libraries.push(library.into());
        self
    }

    pub fn with_keep_template(mut self, keep: bool) -> Self {
        self.keep_template = keep;
        self
    }

    /// Set caller limit overrides
    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = limits;
        self
    }
}

/// Result of one execution. Produced once per session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,

    /// Exit code (0 = success); 128+N when killed by signal N
    pub exit_code: i32,

    /// Whether the wall-clock or CPU limit was hit
    pub timed_out: bool,

    /// Whether either stream was cut at the output limit
    pub truncated: bool,

    /// Execution duration in milliseconds
    pub duration_ms: i64,
}

impl ExecutionResult {
    /// Check if execution succeeded
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}
