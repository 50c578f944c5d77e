//! Engine configuration

use crate::backend::BackendKind;
#[cfg(feature = "docker")]
use crate::backend::DockerBackendConfig;
#[cfg(feature = "process")]
use crate::backend::ProcessBackendConfig;
use crate::error::ConfigError;
use crate::language::Language;
use crate::limits::{Limits, ResourceLimiter};
use crate::persistent::PersistentConfig;
use crate::session::SessionOptions;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Limit presets and per-language defaults
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Limits used when a request does not override them
    pub defaults: Limits,

    /// System-wide ceiling no request can exceed
    pub maximum: Limits,

    /// Defaults by language name (e.g. `[limits.languages.javascript]`)
    pub languages: HashMap<String, Limits>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            defaults: Limits::default(),
            maximum: Limits::permissive(),
            languages: HashMap::new(),
        }
    }
}

impl LimitsConfig {
    pub fn limiter(&self) -> Result<ResourceLimiter, ConfigError> {
        if self.maximum.has_zero() {
            return Err(ConfigError::Invalid(
                "limits.maximum: every limit must be positive".to_string(),
            ));
        }
        let mut limiter = ResourceLimiter::new(self.defaults, self.maximum);
        for (name, limits) in &self.languages {
            let language = name
                .parse::<Language>()
                .map_err(|e| ConfigError::Invalid(format!("limits.languages: {}", e)))?;
            limiter = limiter.with_language_defaults(language, *limits);
        }
        Ok(limiter)
    }
}

/// Everything needed to build a [`crate::SandboxService`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: BackendKind,

    /// Sessions allowed in Provisioning or Running at once
    pub max_concurrent: usize,

    pub timeouts: SessionOptions,
    pub limits: LimitsConfig,

    #[cfg(feature = "process")]
    pub process: ProcessBackendConfig,

    #[cfg(feature = "docker")]
    pub docker: DockerBackendConfig,

    pub sessions: PersistentConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            max_concurrent: 4,
            timeouts: SessionOptions::default(),
            limits: LimitsConfig::default(),
            #[cfg(feature = "process")]
            process: ProcessBackendConfig::default(),
            #[cfg(feature = "docker")]
            docker: DockerBackendConfig::default(),
            sessions: PersistentConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.sessions.max_sessions > self.max_concurrent {
            return Err(ConfigError::Invalid(format!(
                "sessions.max_sessions ({}) cannot exceed max_concurrent ({}); each session holds a slot",
                self.sessions.max_sessions, self.max_concurrent
            )));
        }
        if self.timeouts.provision_timeout.is_zero() || self.timeouts.teardown_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "provision and teardown timeouts must be positive".to_string(),
            ));
        }
        self.limits.limiter()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_are_valid() {
        assert_ok!(SandboxConfig::default().validate());
    }

    #[test]
    fn test_from_toml() {
        let config: SandboxConfig = toml::from_str(
            r#"
            backend = "docker"
            max_concurrent = 8

            [timeouts]
            provision_timeout = "30s"

            [limits.defaults]
            cpu_seconds = 5
            wall_clock = "10s"
            memory_bytes = 134217728
            max_output_bytes = 65536

            [limits.languages.javascript]
            cpu_seconds = 5
            wall_clock = "20s"
            memory_bytes = 268435456
            max_output_bytes = 65536
            "#,
        )
        .unwrap();

        assert_eq!(config.backend, BackendKind::Docker);
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.timeouts.provision_timeout, Duration::from_secs(30));
        assert_eq!(config.timeouts.cancel_grace, SessionOptions::default().cancel_grace);
        assert_eq!(config.limits.defaults.wall_clock, Duration::from_secs(10));

        let limiter = config.limits.limiter().unwrap();
        let js = limiter.limits_for(Language::JavaScript, &Default::default());
        assert_eq!(js.wall_clock, Duration::from_secs(20));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = SandboxConfig {
            max_concurrent: 0,
            ..Default::default()
        };
        assert_err!(config.validate());

        config.max_concurrent = 2;
        config.sessions.max_sessions = 3;
        assert_err!(config.validate());

        config.sessions.max_sessions = 1;
        config
            .limits
            .languages
            .insert("cobol".to_string(), Limits::default());
        assert_err!(config.validate());

        config.limits.languages.clear();
        config.limits.maximum.wall_clock = Duration::ZERO;
        assert_err!(config.validate());
    }
}
