//! Available memory check.

use async_trait::async_trait;
use serde_json::{json, Map};

use super::{probe_error_result, CheckContext, CheckLevel, CheckResult, Checker};
use crate::runner::ProbeSpec;

/// Checks available memory against the package's `min_memory_mb` setting
/// (default 512 MiB). Low memory warns but does not gate.
pub struct MemoryChecker;

#[async_trait]
impl Checker for MemoryChecker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let required = ctx.software.map(|s| s.min_memory_mb()).unwrap_or(512);
        let probe = ProbeSpec::shell("free -m | awk '/^Mem:/ {print $7}'");
        match ctx.executor.probe(ctx.node, probe).await {
            Ok(result) if result.ok() => match result.stdout_trimmed().parse::<u64>() {
                Ok(available) => {
                    let mut details = Map::new();
                    details.insert("available_mb".to_string(), json!(available));
                    details.insert("required_mb".to_string(), json!(required));
                    if available >= required {
                        CheckResult::passed(
                            self.name(),
                            format!("{}MB available (required: {}MB)", available, required),
                        )
                        .with_details(details)
                    } else {
                        CheckResult::failed(
                            self.name(),
                            CheckLevel::Warning,
                            format!(
                                "low memory: {}MB available (recommended: {}MB)",
                                available, required
                            ),
                        )
                        .with_details(details)
                    }
                }
                Err(_) => CheckResult::failed(
                    self.name(),
                    CheckLevel::Warning,
                    format!("could not parse free output: '{}'", result.stdout_trimmed()),
                ),
            },
            Ok(result) => CheckResult::failed(
                self.name(),
                CheckLevel::Warning,
                format!("free failed: {}", result.stderr.trim()),
            ),
            Err(err) => probe_error_result(self.name(), &err),
        }
    }
}
