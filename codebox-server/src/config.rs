//! Configuration file for the `codebox` binary

use anyhow::{Context, Result};
use codebox_sandbox::{
    BackendKind, DockerBackendConfig, LimitsConfig, PersistentConfig, ProcessBackendConfig,
    SandboxConfig, SessionOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub sandbox: SandboxSection,
    pub limits: LimitsConfig,
    pub process: ProcessBackendConfig,
    pub docker: DockerBackendConfig,
    pub sessions: PersistentConfig,
    pub logging: LoggingConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub backend: BackendKind,
    pub max_concurrent: usize,
    #[serde(with = "humantime_serde")]
    pub provision_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub teardown_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub cancel_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub drain_grace: Duration,
}

impl Default for SandboxSection {
    fn default() -> Self {
        let timeouts = SessionOptions::default();
        Self {
            backend: BackendKind::default(),
            max_concurrent: SandboxConfig::default().max_concurrent,
            provision_timeout: timeouts.provision_timeout,
            teardown_timeout: timeouts.teardown_timeout,
            cancel_grace: timeouts.cancel_grace,
            drain_grace: timeouts.drain_grace,
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Additional log file (stderr is always used)
    pub file: Option<PathBuf>,
    /// Level for codebox crates when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: None,
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`, or from the default location.
    /// A missing default file yields the defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (config_path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::config_path()?, false),
        };

        if !explicit && !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config {}", config_path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config {}", config_path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Cannot determine home directory")?;
        Ok(home.join(".config").join("codebox").join("config.toml"))
    }

    /// Engine configuration assembled from the file sections
    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            backend: self.sandbox.backend,
            max_concurrent: self.sandbox.max_concurrent,
            timeouts: SessionOptions {
                provision_timeout: self.sandbox.provision_timeout,
                teardown_timeout: self.sandbox.teardown_timeout,
                cancel_grace: self.sandbox.cancel_grace,
                drain_grace: self.sandbox.drain_grace,
            },
            limits: self.limits.clone(),
            process: self.process.clone(),
            docker: self.docker.clone(),
            sessions: self.sessions,
        }
    }
}
