//! Pre-install check framework.
//!
//! A [`Checker`] runs one read-only probe against a (node, software) pair
//! and reports a [`CheckResult`] with a severity. The [`CheckerManager`]
//! runs a fixed ordered set of checkers sequentially for a node (probes are
//! cheap and a stable order aids debugging; parallelism lives at the node
//! level) and the engine gates installation on [`CheckerManager::has_errors`].
//!
//! A checker that cannot execute its probe does not gate the install by
//! itself: the failure is downgraded to a `Warning` result carrying the
//! error text, unless the host was unreachable.

mod connectivity;
mod disk_space;
mod memory;
mod package_manager;
mod port;
mod sudo;
mod system_info;

pub use connectivity::ConnectivityChecker;
pub use disk_space::DiskSpaceChecker;
pub use memory::MemoryChecker;
pub use package_manager::PackageManagerChecker;
pub use port::PortAvailabilityChecker;
pub use sudo::SudoPrivilegeChecker;
pub use system_info::SystemInfoChecker;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::model::{NodeSpec, SoftwareSpec};
use crate::runner::HostExecutor;

/// Severity of a check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckLevel {
    /// Informational; never gates.
    Info,
    /// Surfaced but does not gate installation.
    Warning,
    /// Gates installation when the check did not pass.
    Error,
}

/// Result of a single check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Stable checker name.
    pub check_name: String,
    /// Severity of the result.
    pub level: CheckLevel,
    /// Whether the checked condition holds.
    pub passed: bool,
    /// Human-readable outcome.
    pub message: String,
    /// Structured extras (facts, measured values).
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,
}

impl CheckResult {
    /// A passing result.
    pub fn passed(check: &str, message: impl Into<String>) -> Self {
        Self {
            check_name: check.to_string(),
            level: CheckLevel::Info,
            passed: true,
            message: message.into(),
            details: Map::new(),
        }
    }

    /// A failing result at the given severity.
    pub fn failed(check: &str, level: CheckLevel, message: impl Into<String>) -> Self {
        Self {
            check_name: check.to_string(),
            level,
            passed: false,
            message: message.into(),
            details: Map::new(),
        }
    }

    /// Attaches structured details.
    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.details = details;
        self
    }

    /// Returns true when this result gates installation.
    pub fn is_blocking(&self) -> bool {
        self.level == CheckLevel::Error && !self.passed
    }
}

/// Inputs shared by every checker.
pub struct CheckContext<'a> {
    /// Target node.
    pub node: &'a NodeSpec,
    /// Software about to be installed, when the check is package-scoped.
    pub software: Option<&'a SoftwareSpec>,
    /// Execution substrate.
    pub executor: &'a dyn HostExecutor,
}

/// One composable pre-install probe.
#[async_trait]
pub trait Checker: Send + Sync {
    /// Stable name used in events and reports.
    fn name(&self) -> &'static str;

    /// Runs the probe and classifies the outcome. Implementations catch
    /// their own probe errors; `check` itself never fails.
    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult;
}

/// Converts a probe execution error into a non-gating result, unless the
/// host was unreachable.
pub(crate) fn probe_error_result(check: &'static str, err: &Error) -> CheckResult {
    if err.is_unreachable() {
        CheckResult::failed(check, CheckLevel::Error, err.to_string())
    } else {
        CheckResult::failed(
            check,
            CheckLevel::Warning,
            format!("check could not execute: {}", err),
        )
    }
}

/// Fixed, ordered set of checkers applied to every (node, software) pair.
pub struct CheckerManager {
    checkers: Vec<Arc<dyn Checker>>,
}

impl CheckerManager {
    /// Creates a manager with an explicit checker list.
    pub fn new(checkers: Vec<Arc<dyn Checker>>) -> Self {
        Self { checkers }
    }

    /// The standard checker set, in gating-relevant order.
    pub fn standard() -> Self {
        Self::new(vec![
            Arc::new(ConnectivityChecker),
            Arc::new(DiskSpaceChecker),
            Arc::new(MemoryChecker),
            Arc::new(PortAvailabilityChecker),
            Arc::new(SystemInfoChecker),
            Arc::new(PackageManagerChecker),
            Arc::new(SudoPrivilegeChecker),
        ])
    }

    /// Runs every checker sequentially and returns all results.
    pub async fn run_all(&self, ctx: &CheckContext<'_>) -> Vec<CheckResult> {
        debug!(
            node = %ctx.node.name,
            checks = self.checkers.len(),
            "running pre-install checks"
        );
        let mut results = Vec::with_capacity(self.checkers.len());
        for checker in &self.checkers {
            let result = checker.check(ctx).await;
            match (result.passed, result.level) {
                (true, _) => info!(node = %ctx.node.name, "{}: {}", result.check_name, result.message),
                (false, CheckLevel::Error) => {
                    error!(node = %ctx.node.name, "{}: {}", result.check_name, result.message)
                }
                (false, _) => {
                    warn!(node = %ctx.node.name, "{}: {}", result.check_name, result.message)
                }
            }
            results.push(result);
        }
        let failed = results.iter().filter(|r| r.is_blocking()).count();
        let warned = results
            .iter()
            .filter(|r| !r.passed && r.level == CheckLevel::Warning)
            .count();
        info!(
            node = %ctx.node.name,
            passed = results.iter().filter(|r| r.passed).count(),
            warnings = warned,
            failed,
            "checks completed"
        );
        results
    }

    /// Returns true iff any result is a failed Error-level check.
    pub fn has_errors(results: &[CheckResult]) -> bool {
        results.iter().any(CheckResult::is_blocking)
    }

    /// Joins blocking failure messages for task failure reporting.
    pub fn error_summary(results: &[CheckResult]) -> String {
        results
            .iter()
            .filter(|r| r.is_blocking())
            .map(|r| format!("{}: {}", r.check_name, r.message))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_errors_only_on_failed_error_level() {
        let results = vec![
            CheckResult::passed("connectivity", "ok"),
            CheckResult::failed("memory", CheckLevel::Warning, "low memory"),
        ];
        assert!(!CheckerManager::has_errors(&results));

        let results = vec![
            CheckResult::passed("connectivity", "ok"),
            CheckResult::failed("disk_space", CheckLevel::Error, "only 100MB free"),
        ];
        assert!(CheckerManager::has_errors(&results));
    }

    #[test]
    fn test_error_summary_joins_blocking_only() {
        let results = vec![
            CheckResult::failed("disk_space", CheckLevel::Error, "full"),
            CheckResult::failed("memory", CheckLevel::Warning, "low"),
            CheckResult::failed("sudo", CheckLevel::Error, "denied"),
        ];
        let summary = CheckerManager::error_summary(&results);
        assert!(summary.contains("disk_space: full"));
        assert!(summary.contains("sudo: denied"));
        assert!(!summary.contains("memory"));
    }

    #[test]
    fn test_probe_error_downgrades_to_warning() {
        let err = Error::Runner("spawn failed".to_string());
        let result = probe_error_result("memory", &err);
        assert_eq!(result.level, CheckLevel::Warning);
        assert!(!result.passed);
        assert!(!result.is_blocking());
    }

    #[test]
    fn test_probe_error_unreachable_stays_blocking() {
        let err = Error::unreachable("h1", "no route");
        let result = probe_error_result("connectivity", &err);
        assert!(result.is_blocking());
    }
}
