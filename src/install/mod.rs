//! Installer abstraction and registry.
//!
//! An [`Installer`] drives one software package through its lifecycle:
//! `pre_check` (may decide the work is already done), `install` (runs the
//! package's playbook), `post_config` and `verify`. Installers talk to the
//! target exclusively through the [`HostExecutor`] handed to them in the
//! [`InstallContext`], and report progress and log lines through the
//! [`TaskReporter`], which fans out to the event bus.

mod java;
mod python;
mod zookeeper;

pub use java::JavaInstaller;
pub use python::PythonInstaller;
pub use zookeeper::ZookeeperInstaller;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::LogLevel;
use crate::error::{Error, Result};
use crate::event::{EventBus, EventKind};
use crate::model::{NodeSpec, SoftwareSpec};
use crate::runner::{
    CredentialScope, HostExecutor, PlaybookEvent, PlaybookEventSink, PlaybookRequest, RunStatus,
};

/// Config keys consumed by the engine and checkers rather than by a
/// specific installer; never reported as unknown.
const GENERIC_CONFIG_KEYS: &[&str] = &["timeout_seconds", "min_disk_mb", "min_memory_mb", "ports"];

/// Decision from an installer's package-specific pre-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreCheckVerdict {
    /// Go ahead with the installation.
    Proceed,
    /// The task can be skipped (e.g. already installed at this version).
    Skip(String),
}

/// Progress and log fan-out for one task.
#[derive(Clone)]
pub struct TaskReporter {
    bus: EventBus,
    host: String,
    task_id: String,
}

impl TaskReporter {
    /// Creates a reporter bound to one (host, task) pair.
    pub fn new(bus: EventBus, host: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            bus,
            host: host.into(),
            task_id: task_id.into(),
        }
    }

    /// Publishes a progress event (0..=100).
    pub fn progress(&self, percent: u8) {
        self.bus.publish(
            Some(&self.host),
            Some(&self.task_id),
            EventKind::TaskProgress {
                percent: percent.min(100),
            },
        );
    }

    /// Publishes a task-scoped log line.
    pub fn log(&self, level: LogLevel, line: impl Into<String>) {
        self.bus.publish(
            Some(&self.host),
            Some(&self.task_id),
            EventKind::TaskLog {
                level,
                line: line.into(),
            },
        );
    }

    /// Builds a sink forwarding runner events as task log lines.
    pub fn playbook_sink(&self) -> PlaybookEventSink {
        let reporter = self.clone();
        Arc::new(move |event: PlaybookEvent| {
            let (level, line) = match event {
                PlaybookEvent::TaskStart { name } => (LogLevel::Info, format!("task: {}", name)),
                PlaybookEvent::TaskOk { name } => (LogLevel::Debug, format!("ok: {}", name)),
                PlaybookEvent::TaskChanged { name } => {
                    (LogLevel::Info, format!("changed: {}", name))
                }
                PlaybookEvent::TaskFailed { name, message } => {
                    (LogLevel::Error, format!("failed: {}: {}", name, message))
                }
                PlaybookEvent::Unreachable { message } => {
                    (LogLevel::Error, format!("unreachable: {}", message))
                }
            };
            reporter.log(level, line);
        })
    }
}

/// Everything an installer needs for one task.
pub struct InstallContext<'a> {
    /// Target node.
    pub node: &'a NodeSpec,
    /// Package to install.
    pub software: &'a SoftwareSpec,
    /// Execution substrate.
    pub executor: &'a dyn HostExecutor,
    /// When set, playbooks run in check mode and no target state changes.
    pub dry_run: bool,
    /// Cooperative cancellation signal for the run.
    pub cancel: CancellationToken,
    /// Progress and log fan-out.
    pub reporter: TaskReporter,
}

impl InstallContext<'_> {
    /// Runs this package's playbook with the computed extra vars, mapping
    /// the outcome to a task-level result. Progress is reported at entry
    /// and on success.
    pub async fn run_playbook(
        &self,
        playbook: &str,
        extra_vars: serde_json::Map<String, Value>,
    ) -> Result<()> {
        self.reporter.progress(5);
        let timeout = self.software.timeout_seconds().map(Duration::from_secs);
        let outcome = self
            .executor
            .run_playbook(PlaybookRequest {
                node: self.node,
                playbook,
                extra_vars,
                scope: CredentialScope::Super,
                check_mode: self.dry_run,
                timeout,
                cancel: self.cancel.clone(),
                on_event: Some(self.reporter.playbook_sink()),
            })
            .await?;

        match outcome.status {
            RunStatus::Ok => {
                self.reporter.progress(95);
                Ok(())
            }
            RunStatus::Failed => Err(Error::install(
                &self.software.name,
                &self.node.name,
                outcome.stderr_tail,
            )),
            RunStatus::Unreachable => {
                Err(Error::unreachable(&self.node.name, outcome.stderr_tail))
            }
            RunStatus::Cancelled => Err(Error::Cancelled),
        }
    }

    /// Parses the package's free-form config into a typed settings struct,
    /// warning about keys neither the installer nor the engine understands.
    pub fn settings<T: DeserializeOwned + Default>(&self, known_keys: &[&str]) -> T {
        for key in self.software.config.keys() {
            if !known_keys.contains(&key.as_str()) && !GENERIC_CONFIG_KEYS.contains(&key.as_str())
            {
                self.reporter.log(
                    LogLevel::Warn,
                    format!("unknown config key '{}' for {}", key, self.software.name),
                );
            }
        }
        match serde_json::from_value(Value::Object(self.software.config.clone())) {
            Ok(settings) => settings,
            Err(err) => {
                self.reporter.log(
                    LogLevel::Warn,
                    format!(
                        "invalid config for {}: {}; using defaults",
                        self.software.name, err
                    ),
                );
                T::default()
            }
        }
    }
}

/// One software installer.
#[async_trait]
pub trait Installer: std::fmt::Debug + Send + Sync {
    /// Software name this installer handles.
    fn name(&self) -> &'static str;

    /// Returns true if the declared version is installable.
    fn supports_version(&self, version: &str) -> bool;

    /// Package-specific gating beyond the generic check framework.
    async fn pre_check(&self, ctx: &InstallContext<'_>) -> Result<PreCheckVerdict>;

    /// Runs the installation playbook. Must be cancellation-aware and
    /// report progress at least on entry and completion.
    async fn install(&self, ctx: &InstallContext<'_>) -> Result<()>;

    /// Optional post-install configuration.
    async fn post_config(&self, _ctx: &InstallContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Verifies the installed artifact reports the expected version.
    async fn verify(&self, _ctx: &InstallContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Maps software names to installers.
pub struct InstallerRegistry {
    installers: HashMap<String, Arc<dyn Installer>>,
}

impl InstallerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            installers: HashMap::new(),
        }
    }

    /// The built-in installer set: java, python, zookeeper.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JavaInstaller));
        registry.register(Arc::new(PythonInstaller));
        registry.register(Arc::new(ZookeeperInstaller));
        registry
    }

    /// Adds or replaces an installer.
    pub fn register(&mut self, installer: Arc<dyn Installer>) {
        self.installers
            .insert(installer.name().to_string(), installer);
    }

    /// Resolves an installer by software name (case-insensitive).
    ///
    /// An unknown name fails the task that asked for it, never the run.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Installer>> {
        self.installers
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::UnknownInstaller(name.to_string()))
    }

    /// Registered software names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.installers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for InstallerRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
