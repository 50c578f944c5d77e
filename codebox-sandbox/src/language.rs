//! Supported languages and how each one is run inside a sandbox

use crate::error::ProvisionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Directory (relative to the sandbox workspace) that receives installed libraries
pub const LIBRARY_DIR: &str = ".libs";

/// Language of submitted code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Shell,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Python, Language::JavaScript, Language::Shell];

    /// Canonical lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Shell => "shell",
        }
    }

    /// File the submitted code is written to
    pub fn script_name(self) -> &'static str {
        match self {
            Language::Python => "main.py",
            Language::JavaScript => "main.js",
            Language::Shell => "main.sh",
        }
    }

    /// Interpreter argv, without the script path
    pub fn interpreter(self) -> &'static [&'static str] {
        match self {
            Language::Python => &["python3", "-u"],
            Language::JavaScript => &["node"],
            Language::Shell => &["sh"],
        }
    }

    /// Default container image for the docker backend
    pub fn default_image(self) -> &'static str {
        match self {
            Language::Python => "python:3.12-slim",
            Language::JavaScript => "node:20-slim",
            Language::Shell => "alpine:3.20",
        }
    }

    /// Whether `RLIMIT_AS` can bound this runtime. V8 reserves large virtual
    /// ranges up front, so node gets a heap flag instead.
    pub fn tolerates_address_space_limit(self) -> bool {
        !matches!(self, Language::JavaScript)
    }

    /// Extra interpreter flags bounding heap size, if the runtime has one
    pub fn memory_flags(self, memory_bytes: u64) -> Vec<String> {
        match self {
            Language::JavaScript => {
                let mb = (memory_bytes / (1024 * 1024)).max(16);
                vec![format!("--max-old-space-size={}", mb)]
            }
            _ => Vec::new(),
        }
    }

    /// Argv installing `libraries` into `workspace`
    pub fn install_command(
        self,
        workspace: &Path,
        libraries: &[String],
    ) -> Result<Vec<String>, ProvisionError> {
        let mut argv: Vec<String> = match self {
            Language::Python => vec![
                "python3".into(),
                "-m".into(),
                "pip".into(),
                "install".into(),
                "--quiet".into(),
                "--no-input".into(),
                "--disable-pip-version-check".into(),
                "--target".into(),
                workspace.join(LIBRARY_DIR).display().to_string(),
            ],
            Language::JavaScript => vec![
                "npm".into(),
                "install".into(),
                "--silent".into(),
                "--no-audit".into(),
                "--no-fund".into(),
                "--prefix".into(),
                workspace.display().to_string(),
            ],
            Language::Shell => {
                return Err(ProvisionError::LibrariesUnsupported(self.to_string()));
            }
        };
        argv.extend(libraries.iter().cloned());
        Ok(argv)
    }

    /// Environment making libraries installed under `roots` visible to the
    /// interpreter
    pub fn library_env<P: AsRef<Path>>(self, roots: &[P]) -> Vec<(String, String)> {
        let (var, subdir) = match self {
            Language::Python => ("PYTHONPATH", LIBRARY_DIR),
            Language::JavaScript => ("NODE_PATH", "node_modules"),
            Language::Shell => return Vec::new(),
        };
        if roots.is_empty() {
            return Vec::new();
        }
        let joined = roots
            .iter()
            .map(|root| root.as_ref().join(subdir).display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        vec![(var.to_string(), joined)]
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" | "nodejs" => Ok(Language::JavaScript),
            "shell" | "sh" | "bash" => Ok(Language::Shell),
            _ => Err(ProvisionError::UnsupportedLanguage(s.to_string())),
        }
    }
}

/// Reject library names that pip or npm would read as options or that
/// cannot be a single package spec.
pub fn validate_libraries(libraries: &[String]) -> Result<(), ProvisionError> {
    for name in libraries {
        let bad = name.is_empty()
            || name.starts_with('-')
            || name.chars().any(|c| c.is_whitespace() || c.is_control());
        if bad {
            return Err(ProvisionError::InvalidLibrary(name.clone()));
        }
    }
    Ok(())
}
