//! Declarative deployment model: nodes, credentials, and software entries.
//!
//! These types are produced once by configuration loading, validated, and
//! then shared immutably across the whole run. Validation collects
//! human-readable messages instead of failing on the first problem so the
//! operator sees every mistake in one pass.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A credential bundle for one SSH identity on a node.
///
/// At least one of `password` / `key_path` must be present; when a key is
/// used the file must exist and be readable only by its owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Login user name
    pub user: String,
    /// SSH password, if password authentication is used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Path to an SSH private key, if key authentication is used
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

impl Credentials {
    /// Returns true if either a password or a key is configured.
    pub fn has_auth(&self) -> bool {
        self.password.is_some() || self.key_path.is_some()
    }

    fn validate(&self, role: &str, node: &str, errors: &mut Vec<String>) {
        if self.user.is_empty() {
            errors.push(format!("node '{}': {} user is required", node, role));
        }
        if !self.has_auth() {
            errors.push(format!(
                "node '{}': either a password or a key must be provided for the {} user",
                node, role
            ));
        }
        if let Some(key) = &self.key_path {
            if !key.exists() {
                errors.push(format!(
                    "node '{}': {} SSH key not found: {}",
                    node,
                    role,
                    key.display()
                ));
            } else if !key_mode_is_private(key) {
                errors.push(format!(
                    "node '{}': SSH key {} has loose permissions, expected 0600",
                    node,
                    key.display()
                ));
            }
        }
    }
}

/// Checks that a private key file is readable by its owner only.
#[cfg(unix)]
fn key_mode_is_private(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.permissions().mode() & 0o077 == 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn key_mode_is_private(_path: &Path) -> bool {
    true
}

/// Where the installable artifact comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Install from the target's package manager repositories.
    #[default]
    Repository,
    /// Download an artifact from a URL onto the target.
    Url,
    /// Copy an artifact from a path that already exists on the target.
    Local,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Repository => write!(f, "repository"),
            Source::Url => write!(f, "url"),
            Source::Local => write!(f, "local"),
        }
    }
}

/// One software package to install on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftwareSpec {
    /// Software name; selects the installer (e.g. "java").
    pub name: String,
    /// Requested version string; the installer validates it.
    pub version: String,
    /// Absolute installation path on the target.
    pub install_path: PathBuf,
    /// Artifact source.
    #[serde(default)]
    pub source: Source,
    /// URL or on-target path; required when `source` is not `repository`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    /// Free-form installer-specific settings. Installers parse this into a
    /// typed settings struct and warn about unknown keys.
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl SoftwareSpec {
    /// Install timeout override in seconds, when configured.
    pub fn timeout_seconds(&self) -> Option<u64> {
        self.config.get("timeout_seconds").and_then(Value::as_u64)
    }

    /// Minimum free disk space required for this package, in MiB.
    pub fn min_disk_mb(&self) -> u64 {
        self.config
            .get("min_disk_mb")
            .and_then(Value::as_u64)
            .unwrap_or(1024)
    }

    /// Minimum available memory recommended for this package, in MiB.
    pub fn min_memory_mb(&self) -> u64 {
        self.config
            .get("min_memory_mb")
            .and_then(Value::as_u64)
            .unwrap_or(512)
    }

    pub(crate) fn validate(&self, node: &str, errors: &mut Vec<String>) {
        if self.name.is_empty() {
            errors.push(format!("node '{}': software name is required", node));
            return;
        }
        if self.version.is_empty() {
            errors.push(format!(
                "node '{}': version is required for {}",
                node, self.name
            ));
        }
        if !self.install_path.is_absolute() {
            errors.push(format!(
                "node '{}': install_path for {} must be absolute (got '{}')",
                node,
                self.name,
                self.install_path.display()
            ));
        }
        if self.source != Source::Repository && self.source_path.is_none() {
            errors.push(format!(
                "node '{}': source_path is required when source is '{}' for {}",
                node, self.source, self.name
            ));
        }
    }
}

/// One target host with its connection details and install list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique node name within the run.
    pub name: String,
    /// IP address or resolvable host name.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Ordinary-user credentials used for connection.
    pub owner: Credentials,
    /// Privilege-escalation credentials used for root-level actions.
    pub super_user: Credentials,
    /// Packages to install, in declaration order.
    pub install: Vec<SoftwareSpec>,
}

impl NodeSpec {
    /// Looks up a software entry by name.
    pub fn software(&self, name: &str) -> Option<&SoftwareSpec> {
        self.install.iter().find(|s| s.name == name)
    }

    pub(crate) fn validate(&self, errors: &mut Vec<String>) {
        if self.name.is_empty() {
            errors.push("node name is required".to_string());
            return;
        }
        if self.host.is_empty() {
            errors.push(format!("node '{}': host is required", self.name));
        }
        if self.port == 0 {
            errors.push(format!(
                "node '{}': port must be between 1 and 65535",
                self.name
            ));
        }
        self.owner.validate("owner", &self.name, errors);
        self.super_user.validate("super", &self.name, errors);
        if self.install.is_empty() {
            errors.push(format!(
                "node '{}': at least one software must be listed under install",
                self.name
            ));
        }
        for software in &self.install {
            software.validate(&self.name, errors);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            host: "10.0.0.5".to_string(),
            port: 22,
            owner: Credentials {
                user: "deploy".to_string(),
                password: Some("secret".to_string()),
                key_path: None,
            },
            super_user: Credentials {
                user: "root".to_string(),
                password: Some("rootpw".to_string()),
                key_path: None,
            },
            install: vec![SoftwareSpec {
                name: "java".to_string(),
                version: "11".to_string(),
                install_path: PathBuf::from("/opt/java"),
                source: Source::Repository,
                source_path: None,
                config: Map::new(),
            }],
        }
    }

    #[test]
    fn test_valid_node_has_no_errors() {
        let mut errors = Vec::new();
        node("n1").validate(&mut errors);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    }

    #[test]
    fn test_missing_auth_is_reported() {
        let mut n = node("n1");
        n.owner.password = None;
        let mut errors = Vec::new();
        n.validate(&mut errors);
        assert!(errors.iter().any(|e| e.contains("password or a key")));
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut n = node("n1");
        n.port = 0;
        let mut errors = Vec::new();
        n.validate(&mut errors);
        assert!(errors.iter().any(|e| e.contains("port")));
    }

    #[test]
    fn test_relative_install_path_rejected() {
        let mut n = node("n1");
        n.install[0].install_path = PathBuf::from("opt/java");
        let mut errors = Vec::new();
        n.validate(&mut errors);
        assert!(errors.iter().any(|e| e.contains("must be absolute")));
    }

    #[test]
    fn test_url_source_requires_source_path() {
        let mut n = node("n1");
        n.install[0].source = Source::Url;
        let mut errors = Vec::new();
        n.validate(&mut errors);
        assert!(errors.iter().any(|e| e.contains("source_path")));
    }

    #[test]
    fn test_empty_install_rejected() {
        let mut n = node("n1");
        n.install.clear();
        let mut errors = Vec::new();
        n.validate(&mut errors);
        assert!(errors.iter().any(|e| e.contains("at least one software")));
    }

    #[test]
    fn test_timeout_and_disk_defaults() {
        let s = node("n1").install[0].clone();
        assert_eq!(s.timeout_seconds(), None);
        assert_eq!(s.min_disk_mb(), 1024);
        assert_eq!(s.min_memory_mb(), 512);
    }
}
