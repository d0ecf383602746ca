//! Host execution substrate.
//!
//! The engine never talks to a remote host directly; it goes through the
//! [`HostExecutor`] trait. The production implementation
//! ([`AnsibleExecutor`]) shells out to the `ansible` / `ansible-playbook`
//! CLIs with a per-invocation single-host inventory. Tests substitute a
//! scripted stub.
//!
//! Two operations cover everything the engine needs: `probe` for short
//! read-only ad-hoc commands (checks, verification) and `run_playbook` for
//! the actual install lifecycle.

pub mod ansible;

pub use ansible::AnsibleExecutor;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::NodeSpec;

/// Default timeout for a single probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Which credential bundle an invocation runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialScope {
    /// Connect and run as the ordinary owner user.
    Owner,
    /// Connect as the owner user, escalate to the super user.
    Super,
}

/// A single-shot remote command or module invocation.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    /// Automation module name (`ping`, `shell`, `setup`).
    pub module: String,
    /// Module arguments, e.g. the shell command line.
    pub args: Option<String>,
    /// Credential bundle to use.
    pub scope: CredentialScope,
    /// Per-probe timeout.
    pub timeout: Duration,
}

impl ProbeSpec {
    /// Connectivity probe: the `ping` module as the owner user.
    pub fn ping() -> Self {
        Self {
            module: "ping".to_string(),
            args: None,
            scope: CredentialScope::Owner,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Ad-hoc shell command as the owner user.
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            module: "shell".to_string(),
            args: Some(command.into()),
            scope: CredentialScope::Owner,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Fact gathering via the `setup` module.
    pub fn facts() -> Self {
        Self {
            module: "setup".to_string(),
            args: None,
            scope: CredentialScope::Owner,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Switches the probe to the super (privilege escalation) credentials.
    pub fn with_scope(mut self, scope: CredentialScope) -> Self {
        self.scope = scope;
        self
    }

    /// Overrides the probe timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Result of a probe invocation.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    /// Remote exit status.
    pub rc: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Parsed facts, when the module returned structured data.
    pub facts: Map<String, Value>,
}

impl ProbeResult {
    /// Returns true if the remote command exited 0.
    pub fn ok(&self) -> bool {
        self.rc == 0
    }

    /// Stdout with surrounding whitespace trimmed.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Terminal status of a playbook run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// All plays finished without failures.
    Ok,
    /// At least one task failed.
    Failed,
    /// The host could not be reached.
    Unreachable,
    /// The run was interrupted by cancellation.
    Cancelled,
}

/// Per-run counters from the play recap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayStats {
    /// Tasks that reported ok.
    pub ok: u32,
    /// Tasks that changed the target.
    pub changed: u32,
    /// Tasks that failed.
    pub failed: u32,
    /// Unreachable results.
    pub unreachable: u32,
    /// Skipped tasks.
    pub skipped: u32,
}

/// Outcome of a playbook run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Terminal status.
    pub status: RunStatus,
    /// Tail of the runner's stderr (or the last fatal message), for task
    /// failure reporting.
    pub stderr_tail: String,
    /// Recap counters.
    pub stats: PlayStats,
}

impl RunOutcome {
    /// Returns true when the playbook finished successfully.
    pub fn ok(&self) -> bool {
        self.status == RunStatus::Ok
    }
}

/// Streaming event from the underlying runner.
#[derive(Debug, Clone)]
pub enum PlaybookEvent {
    /// A playbook task started.
    TaskStart {
        /// Task name from the playbook.
        name: String,
    },
    /// A playbook task reported ok.
    TaskOk {
        /// Task name.
        name: String,
    },
    /// A playbook task changed the target.
    TaskChanged {
        /// Task name.
        name: String,
    },
    /// A playbook task failed.
    TaskFailed {
        /// Task name.
        name: String,
        /// Failure payload.
        message: String,
    },
    /// The host became unreachable mid-play.
    Unreachable {
        /// Error payload.
        message: String,
    },
}

/// Callback receiving streamed [`PlaybookEvent`]s.
pub type PlaybookEventSink = Arc<dyn Fn(PlaybookEvent) + Send + Sync>;

/// Everything needed for one playbook invocation.
pub struct PlaybookRequest<'a> {
    /// Target node.
    pub node: &'a NodeSpec,
    /// Playbook file name (resolved against the playbook directory).
    pub playbook: &'a str,
    /// Extra variables handed to the playbook.
    pub extra_vars: Map<String, Value>,
    /// Credential bundle.
    pub scope: CredentialScope,
    /// Run the playbook in check (no-op) mode.
    pub check_mode: bool,
    /// Overall timeout; `None` means uncapped.
    pub timeout: Option<Duration>,
    /// Cooperative cancellation signal.
    pub cancel: CancellationToken,
    /// Optional streaming event sink.
    pub on_event: Option<PlaybookEventSink>,
}

/// Adapter over the remote-automation engine.
///
/// Implementations must be stateless per call and tolerate concurrent
/// invocations from different node workers.
#[async_trait]
pub trait HostExecutor: Send + Sync {
    /// Runs a single-shot module invocation against one node.
    async fn probe(&self, node: &NodeSpec, probe: ProbeSpec) -> Result<ProbeResult>;

    /// Runs a named playbook against one node.
    async fn run_playbook(&self, request: PlaybookRequest<'_>) -> Result<RunOutcome>;

    /// Tests SSH connectivity with a ping probe.
    async fn test_connection(&self, node: &NodeSpec) -> Result<()> {
        let result = self.probe(node, ProbeSpec::ping()).await?;
        if result.ok() {
            Ok(())
        } else {
            Err(Error::unreachable(
                &node.name,
                if result.stderr.is_empty() {
                    result.stdout.clone()
                } else {
                    result.stderr.clone()
                },
            ))
        }
    }
}
