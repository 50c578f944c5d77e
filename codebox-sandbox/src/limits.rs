//! Resource limits for sandboxed execution
//!
//! The limiter only decides values. Enforcement happens in the backend's
//! `run` (rlimits, container flags) and in the session's deadline.

use crate::language::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Resource limits applied to one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// CPU time in seconds
    pub cpu_seconds: u64,

    /// Wall-clock budget, also the maximum queue wait
    #[serde(with = "humantime_serde")]
    pub wall_clock: Duration,

    /// Memory ceiling in bytes
    pub memory_bytes: u64,

    /// Output ceiling per stream in bytes
    pub max_output_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            cpu_seconds: 10,
            wall_clock: Duration::from_secs(15),
            memory_bytes: 256 * 1024 * 1024, // 256 MB
            max_output_bytes: 1024 * 1024,   // 1 MB
        }
    }
}

impl Limits {
    /// Tight limits for anonymous traffic
    pub fn strict() -> Self {
        Self {
            cpu_seconds: 2,
            wall_clock: Duration::from_secs(5),
            memory_bytes: 64 * 1024 * 1024,
            max_output_bytes: 64 * 1024,
        }
    }

    /// Loose limits, used as the default system maxima
    pub fn permissive() -> Self {
        Self {
            cpu_seconds: 120,
            wall_clock: Duration::from_secs(300),
            memory_bytes: 2 * 1024 * 1024 * 1024,
            max_output_bytes: 16 * 1024 * 1024,
        }
    }

    /// Field-wise minimum
    pub fn min(self, other: Limits) -> Limits {
        Limits {
            cpu_seconds: self.cpu_seconds.min(other.cpu_seconds),
            wall_clock: self.wall_clock.min(other.wall_clock),
            memory_bytes: self.memory_bytes.min(other.memory_bytes),
            max_output_bytes: self.max_output_bytes.min(other.max_output_bytes),
        }
    }

    /// Tighten with caller overrides; an override never loosens a bound
    pub fn tighten(self, overrides: &LimitOverrides) -> Limits {
        Limits {
            cpu_seconds: overrides
                .cpu_seconds
                .map_or(self.cpu_seconds, |v| v.min(self.cpu_seconds)),
            wall_clock: overrides
                .wall_clock
                .map_or(self.wall_clock, |v| v.min(self.wall_clock)),
            memory_bytes: overrides
                .memory_bytes
                .map_or(self.memory_bytes, |v| v.min(self.memory_bytes)),
            max_output_bytes: overrides
                .max_output_bytes
                .map_or(self.max_output_bytes, |v| v.min(self.max_output_bytes)),
        }
    }

    /// Whether any bound is zero
    pub fn has_zero(&self) -> bool {
        self.cpu_seconds == 0
            || self.wall_clock.is_zero()
            || self.memory_bytes == 0
            || self.max_output_bytes == 0
    }

    // Zero would mean "kill immediately" for rlimits and "no output" for
    // capture; a request can never make a limit vanish. The floor is applied
    // before the ceiling, so a configured maximum always wins.
    fn floored(self) -> Limits {
        Limits {
            cpu_seconds: self.cpu_seconds.max(1),
            wall_clock: self.wall_clock.max(Duration::from_millis(100)),
            memory_bytes: self.memory_bytes.max(16 * 1024 * 1024),
            max_output_bytes: self.max_output_bytes.max(1),
        }
    }
}

/// Caller-supplied limits; every field is optional
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default)]
    pub cpu_seconds: Option<u64>,
    #[serde(default, with = "humantime_serde")]
    pub wall_clock: Option<Duration>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
    #[serde(default)]
    pub max_output_bytes: Option<usize>,
}

impl LimitOverrides {
    pub fn with_wall_clock(mut self, wall_clock: Duration) -> Self {
        self.wall_clock = Some(wall_clock);
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }
}

/// Computes effective limits from language defaults, caller overrides and
/// system-wide maxima
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    defaults: Limits,
    per_language: HashMap<Language, Limits>,
    maximum: Limits,
}

impl Default for ResourceLimiter {
    fn default() -> Self {
        Self::new(Limits::default(), Limits::permissive())
    }
}

impl ResourceLimiter {
    pub fn new(defaults: Limits, maximum: Limits) -> Self {
        Self {
            defaults,
            per_language: HashMap::new(),
            maximum,
        }
    }

    /// Use different defaults for one language
    pub fn with_language_defaults(mut self, language: Language, limits: Limits) -> Self {
        self.per_language.insert(language, limits);
        self
    }

    /// System-wide maxima
    pub fn maximum(&self) -> Limits {
        self.maximum
    }

    /// Effective limits when the language is not known (yet)
    pub fn base_limits(&self, overrides: &LimitOverrides) -> Limits {
        self.defaults.tighten(overrides).floored().min(self.maximum)
    }

    /// Effective limits for one execution
    pub fn limits_for(&self, language: Language, overrides: &LimitOverrides) -> Limits {
        let base = self
            .per_language
            .get(&language)
            .copied()
            .unwrap_or(self.defaults);
        base.tighten(overrides).floored().min(self.maximum)
    }
}
