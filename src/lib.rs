//! # deployctl - multi-node software provisioning
//!
//! deployctl installs software (Java, Python, Zookeeper) onto a fleet of
//! hosts over SSH. A declarative YAML inventory describes the targets and
//! their install lists; the engine connects to every host concurrently,
//! runs a set of pre-install validations, then drives each package through
//! a pre-check / install / post-configure / verify lifecycle by invoking
//! Ansible playbooks.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        CLI (batch front-end)                 │
//! └──────────────────────────────────────────────────────────────┘
//!                                │
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Deployment Engine                       │
//! │        (bounded worker pool, one serial pipeline per node)   │
//! └──────────────────────────────────────────────────────────────┘
//!            │                   │                   │
//!            ▼                   ▼                   ▼
//! ┌────────────────┐  ┌──────────────────┐  ┌──────────────────┐
//! │ Check Framework│  │ Installer        │  │ Event Bus        │
//! │ (7 probes +    │  │ Registry         │  │ (file sinks, UI  │
//! │  gating)       │  │ (java/python/zk) │  │  subscribers)    │
//! └────────────────┘  └──────────────────┘  └──────────────────┘
//!            │                   │
//!            └─────────┬─────────┘
//!                      ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Host Executor                           │
//! │          (ansible / ansible-playbook CLI adapter)            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick example
//!
//! ```rust,ignore
//! use deployctl::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = DeployConfig::load("deploy.yml")?;
//!     let tasks = TaskSet::build(&config);
//!     let bus = EventBus::new(Redactor::from_config(&config));
//!
//!     let engine = DeploymentEngine::new(
//!         ctx,
//!         config.nodes.clone(),
//!         tasks,
//!         CheckerManager::standard(),
//!         InstallerRegistry::standard(),
//!         executor,
//!         bus,
//!     );
//!     engine.start();
//!     let report = engine.wait().await;
//!     std::process::exit(report.exit_code());
//! }
//! ```

#![warn(missing_docs)]

// ============================================================================
// Core Modules
// ============================================================================

pub mod config;
pub mod error;
pub mod model;
pub mod task;

// ============================================================================
// Infrastructure
// ============================================================================

pub mod event;
pub mod logging;
pub mod runner;

// ============================================================================
// Deployment Components
// ============================================================================

pub mod check;
pub mod install;

// ============================================================================
// Execution Engine
// ============================================================================

pub mod engine;

// ============================================================================
// CLI
// ============================================================================

pub mod cli;

/// Convenient re-exports of the commonly used types.
pub mod prelude {
    //! One-stop imports for embedding the engine.

    pub use crate::check::{CheckLevel, CheckResult, Checker, CheckerManager};
    pub use crate::config::{DeployConfig, LogLevel};
    pub use crate::engine::{DeploymentEngine, RunContext, RunControl, RunReport};
    pub use crate::error::{Error, Result};
    pub use crate::event::{Event, EventBus, EventKind, Redactor};
    pub use crate::install::{InstallContext, Installer, InstallerRegistry, PreCheckVerdict};
    pub use crate::model::{Credentials, NodeSpec, SoftwareSpec, Source};
    pub use crate::runner::{
        AnsibleExecutor, HostExecutor, PlaybookRequest, ProbeResult, ProbeSpec, RunOutcome,
        RunStatus,
    };
    pub use crate::task::{Task, TaskSet, TaskStats, TaskStatus};
}

/// Returns the current deployctl version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
