//! System information gathering.

use async_trait::async_trait;
use serde_json::Map;

use super::{probe_error_result, CheckContext, CheckResult, Checker};
use crate::runner::ProbeSpec;

const KEPT_FACTS: &[&str] = &[
    "ansible_distribution",
    "ansible_distribution_version",
    "ansible_kernel",
    "ansible_processor_vcpus",
    "ansible_memtotal_mb",
    "ansible_architecture",
];

/// Gathers OS, kernel, CPU and memory facts. Always passes; the value is in
/// the attached details.
pub struct SystemInfoChecker;

#[async_trait]
impl Checker for SystemInfoChecker {
    fn name(&self) -> &'static str {
        "system_info"
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        match ctx.executor.probe(ctx.node, ProbeSpec::facts()).await {
            Ok(result) => {
                let mut details = Map::new();
                for key in KEPT_FACTS {
                    if let Some(value) = result.facts.get(*key) {
                        details.insert(key.to_string(), value.clone());
                    }
                }
                let distro = details
                    .get("ansible_distribution")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                let kernel = details
                    .get("ansible_kernel")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                CheckResult::passed(
                    self.name(),
                    format!("system: {}, kernel: {}", distro, kernel),
                )
                .with_details(details)
            }
            Err(err) => probe_error_result(self.name(), &err),
        }
    }
}
