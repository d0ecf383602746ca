//! Configuration loading and validation.
//!
//! The deployment is described by a single YAML document with three
//! sections: `general` (work directory, parallelism), `log` (level and
//! directory) and `nodes` (the host inventory with per-host install lists).
//! Loading produces an immutable [`DeployConfig`]; every validation problem
//! is collected into one `Configuration error` so the operator can fix the
//! file in a single pass. No remote I/O happens until the configuration is
//! fully valid.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::model::{Credentials, NodeSpec, SoftwareSpec, Source};

/// Hard cap on parallel node workers.
pub const MAX_CONCURRENT_NODES: usize = 10;

/// Log verbosity for the file sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Everything, including probe commands.
    Debug,
    /// Normal operational logging.
    #[default]
    Info,
    /// Warnings and errors only.
    Warn,
    /// Errors only.
    Error,
}

impl LogLevel {
    /// Parses a level name case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARN" | "WARNING" => Some(Self::Warn),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    /// Filter directive understood by `tracing_subscriber`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// The `general` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Root directory for run artifacts (inventories, event journals).
    pub data_dir: PathBuf,
    /// Number of node pipelines allowed to run in parallel (1..=10).
    pub max_concurrent_nodes: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./deploy_data"),
            max_concurrent_nodes: MAX_CONCURRENT_NODES,
        }
    }
}

/// The `log` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Minimum level written to the file sinks.
    pub level: LogLevel,
    /// Directory for `deploy.log` and the per-node logs.
    pub dir: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            dir: PathBuf::from("./deploy_data/log"),
        }
    }
}

/// The fully validated deployment configuration.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// General settings.
    pub general: GeneralConfig,
    /// Logging settings.
    pub log: LogConfig,
    /// Target nodes in declaration order.
    pub nodes: Vec<NodeSpec>,
}

impl DeployConfig {
    /// Loads and validates a configuration file.
    ///
    /// Returns a single [`Error::Config`] carrying every validation message
    /// when the document is invalid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read '{}': {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parses and validates a configuration document from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("invalid YAML: {}", e)))?;

        let mut errors = Vec::new();

        let general = GeneralConfig {
            data_dir: expand_dir(raw.general.data_dir.as_deref().unwrap_or("./deploy_data")),
            max_concurrent_nodes: raw
                .general
                .max_concurrent_nodes
                .unwrap_or(MAX_CONCURRENT_NODES),
        };
        if general.max_concurrent_nodes == 0 || general.max_concurrent_nodes > MAX_CONCURRENT_NODES
        {
            errors.push(format!(
                "general.max_concurrent_nodes must be between 1 and {}",
                MAX_CONCURRENT_NODES
            ));
        }

        let level = match raw.log.level.as_deref() {
            None => LogLevel::Info,
            Some(s) => LogLevel::parse(s).unwrap_or_else(|| {
                errors.push(format!("log.level '{}' is not one of DEBUG, INFO, WARN, ERROR", s));
                LogLevel::Info
            }),
        };
        let log = LogConfig {
            level,
            dir: expand_dir(
                raw.log
                    .dir
                    .as_deref()
                    .unwrap_or(&format!("{}/log", general.data_dir.display())),
            ),
        };

        if raw.nodes.is_empty() {
            errors.push("no nodes defined in configuration".to_string());
        }

        let mut nodes = Vec::new();
        for entry in raw.nodes {
            for (name, raw_node) in entry {
                nodes.push(raw_node.into_spec(name, &mut errors));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for node in &nodes {
            if !seen.insert(node.name.clone()) {
                errors.push(format!("duplicate node name '{}'", node.name));
            }
            node.validate(&mut errors);
        }

        if errors.is_empty() {
            Ok(Self { general, log, nodes })
        } else {
            Err(Error::config_errors(&errors))
        }
    }

    /// Creates the data and log directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.general.data_dir, &self.log.dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                Error::Config(format!("cannot create directory '{}': {}", dir.display(), e))
            })?;
        }
        Ok(())
    }

    /// Restricts the configuration to named nodes and/or named software.
    ///
    /// Empty filter slices mean "keep everything". Unknown names are a
    /// configuration error so typos do not silently deploy nothing.
    pub fn filtered(&self, node_names: &[String], software_names: &[String]) -> Result<Self> {
        let mut errors = Vec::new();
        for wanted in node_names {
            if !self.nodes.iter().any(|n| &n.name == wanted) {
                errors.push(format!("--node '{}' does not match any configured node", wanted));
            }
        }
        for wanted in software_names {
            if !self
                .nodes
                .iter()
                .any(|n| n.install.iter().any(|s| &s.name == wanted))
            {
                errors.push(format!(
                    "--software '{}' does not match any configured software",
                    wanted
                ));
            }
        }
        if !errors.is_empty() {
            return Err(Error::config_errors(&errors));
        }

        let mut out = self.clone();
        if !node_names.is_empty() {
            out.nodes.retain(|n| node_names.contains(&n.name));
        }
        if !software_names.is_empty() {
            for node in &mut out.nodes {
                node.install.retain(|s| software_names.contains(&s.name));
            }
            out.nodes.retain(|n| !n.install.is_empty());
        }
        Ok(out)
    }

    /// Returns the configuration file template printed by `generate-config`.
    pub fn template() -> &'static str {
        CONFIG_TEMPLATE
    }
}

/// Expands `~` and environment variables and normalizes to a `PathBuf`.
fn expand_dir(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| path.to_string());
    PathBuf::from(expanded)
}

fn expand_key(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

// ============================================================================
// Raw document shape
// ============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    general: RawGeneral,
    #[serde(default)]
    log: RawLog,
    #[serde(default)]
    nodes: Vec<IndexMap<String, RawNode>>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawGeneral {
    data_dir: Option<String>,
    max_concurrent_nodes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawLog {
    level: Option<String>,
    dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawNode {
    host: String,
    port: Option<u16>,
    owner_user: String,
    owner_pass: Option<String>,
    owner_key: Option<String>,
    super_user: Option<String>,
    super_pass: Option<String>,
    super_key: Option<String>,
    install: Vec<IndexMap<String, RawSoftware>>,
}

impl RawNode {
    fn into_spec(self, name: String, errors: &mut Vec<String>) -> NodeSpec {
        let mut install = Vec::new();
        for entry in self.install {
            for (software_name, raw) in entry {
                install.push(raw.into_spec(&name, software_name, errors));
            }
        }
        NodeSpec {
            host: self.host,
            port: self.port.unwrap_or(22),
            owner: Credentials {
                user: self.owner_user,
                password: self.owner_pass,
                key_path: self.owner_key.as_deref().map(expand_key),
            },
            super_user: Credentials {
                user: self.super_user.unwrap_or_else(|| "root".to_string()),
                password: self.super_pass,
                key_path: self.super_key.as_deref().map(expand_key),
            },
            install,
            name,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawSoftware {
    version: String,
    install_path: String,
    source: Option<String>,
    source_path: Option<String>,
    config: Map<String, Value>,
}

impl RawSoftware {
    fn into_spec(self, node: &str, name: String, errors: &mut Vec<String>) -> SoftwareSpec {
        let source = match self.source.as_deref() {
            None => Source::Repository,
            Some("repository") => Source::Repository,
            Some("url") => Source::Url,
            Some("local") => Source::Local,
            Some(other) => {
                errors.push(format!(
                    "node '{}': invalid source '{}' for {}, must be one of: repository, url, local",
                    node, other, name
                ));
                Source::Repository
            }
        };
        SoftwareSpec {
            version: self.version,
            install_path: PathBuf::from(self.install_path),
            source,
            source_path: self.source_path,
            config: self.config,
            name,
        }
    }
}

const CONFIG_TEMPLATE: &str = r#"# deployctl configuration
general:
  data_dir: ./deploy_data
  max_concurrent_nodes: 10

log:
  level: INFO
  dir: ./deploy_data/log

nodes:
  - node1:
      host: 192.168.1.10
      port: 22
      owner_user: deploy
      owner_pass: changeme          # or owner_key: ~/.ssh/id_rsa
      super_user: root
      super_pass: changeme          # or super_key: ~/.ssh/id_rsa
      install:
        - java:
            version: "11"
            install_path: /opt/java
            source: repository
            config:
              set_java_home: true
        - zookeeper:
            version: "3.8"
            install_path: /opt/zookeeper
            source: url
            source_path: https://downloads.apache.org/zookeeper/zookeeper-3.8.4/apache-zookeeper-3.8.4-bin.tar.gz
            config:
              data_dir: /var/lib/zookeeper
              client_port: 2181
"#;

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
nodes:
  - web1:
      host: 10.0.0.5
      owner_user: deploy
      owner_pass: s3cret
      super_pass: r00t
      install:
        - java:
            version: "11"
            install_path: /opt/java
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let cfg = DeployConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(cfg.general.max_concurrent_nodes, 10);
        assert_eq!(cfg.log.level, LogLevel::Info);
        assert_eq!(cfg.nodes.len(), 1);
        let node = &cfg.nodes[0];
        assert_eq!(node.name, "web1");
        assert_eq!(node.port, 22);
        assert_eq!(node.super_user.user, "root");
        assert_eq!(node.install[0].source, Source::Repository);
    }

    #[test]
    fn test_install_order_is_declaration_order() {
        let yaml = r#"
nodes:
  - h1:
      host: 10.0.0.1
      owner_user: u
      owner_pass: p
      super_pass: p
      install:
        - java: { version: "11", install_path: /opt/java }
        - python: { version: "3.9", install_path: /opt/python }
        - zookeeper: { version: "3.8", install_path: /opt/zk, source: url, source_path: "https://x/zk.tgz" }
"#;
        let cfg = DeployConfig::from_yaml(yaml).unwrap();
        let names: Vec<_> = cfg.nodes[0].install.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["java", "python", "zookeeper"]);
    }

    #[test]
    fn test_no_nodes_is_an_error() {
        let err = DeployConfig::from_yaml("general:\n  data_dir: /tmp/x\n").unwrap_err();
        assert!(err.to_string().contains("no nodes"));
    }

    #[test]
    fn test_invalid_level_and_cap_collected_together() {
        let yaml = r#"
general:
  max_concurrent_nodes: 50
log:
  level: CHATTY
nodes:
  - h1:
      host: 10.0.0.1
      owner_user: u
      owner_pass: p
      super_pass: p
      install:
        - java: { version: "11", install_path: /opt/java }
"#;
        let err = DeployConfig::from_yaml(yaml).unwrap_err().to_string();
        assert!(err.contains("max_concurrent_nodes"));
        assert!(err.contains("CHATTY"));
    }

    #[test]
    fn test_duplicate_node_names_rejected() {
        let yaml = r#"
nodes:
  - h1:
      host: 10.0.0.1
      owner_user: u
      owner_pass: p
      super_pass: p
      install:
        - java: { version: "11", install_path: /opt/java }
  - h1:
      host: 10.0.0.2
      owner_user: u
      owner_pass: p
      super_pass: p
      install:
        - java: { version: "11", install_path: /opt/java }
"#;
        let err = DeployConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate node name 'h1'"));
    }

    #[test]
    fn test_filter_by_node_and_software() {
        let yaml = r#"
nodes:
  - h1:
      host: 10.0.0.1
      owner_user: u
      owner_pass: p
      super_pass: p
      install:
        - java: { version: "11", install_path: /opt/java }
        - python: { version: "3.9", install_path: /opt/python }
  - h2:
      host: 10.0.0.2
      owner_user: u
      owner_pass: p
      super_pass: p
      install:
        - python: { version: "3.9", install_path: /opt/python }
"#;
        let cfg = DeployConfig::from_yaml(yaml).unwrap();

        let only_h1 = cfg.filtered(&["h1".to_string()], &[]).unwrap();
        assert_eq!(only_h1.nodes.len(), 1);

        let only_python = cfg.filtered(&[], &["python".to_string()]).unwrap();
        assert_eq!(only_python.nodes.len(), 2);
        assert!(only_python
            .nodes
            .iter()
            .all(|n| n.install.iter().all(|s| s.name == "python")));

        let unknown = cfg.filtered(&["nope".to_string()], &[]);
        assert!(unknown.is_err());
    }

    #[test]
    fn test_template_parses() {
        // The generate-config output must itself be loadable (keys only;
        // credential values are placeholders).
        let raw: RawConfig = serde_yaml::from_str(DeployConfig::template()).unwrap();
        assert_eq!(raw.nodes.len(), 1);
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("WARNING"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("chatty"), None);
    }
}
