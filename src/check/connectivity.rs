//! SSH connectivity check.

use async_trait::async_trait;
use serde_json::{json, Map};

use super::{CheckContext, CheckLevel, CheckResult, Checker};
use crate::runner::ProbeSpec;

/// Verifies that the node answers a ping module invocation as the owner
/// user. A failure here marks the task unreachable and gates everything
/// downstream.
pub struct ConnectivityChecker;

#[async_trait]
impl Checker for ConnectivityChecker {
    fn name(&self) -> &'static str {
        "connectivity"
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        match ctx.executor.probe(ctx.node, ProbeSpec::ping()).await {
            Ok(result) if result.ok() => {
                let mut details = Map::new();
                details.insert("host".to_string(), json!(ctx.node.host));
                details.insert("port".to_string(), json!(ctx.node.port));
                CheckResult::passed(
                    self.name(),
                    format!("connected to {}:{}", ctx.node.host, ctx.node.port),
                )
                .with_details(details)
            }
            Ok(result) => CheckResult::failed(
                self.name(),
                CheckLevel::Error,
                format!(
                    "unreachable: ping failed with rc={} {}",
                    result.rc,
                    result.stderr.trim()
                ),
            ),
            Err(err) => CheckResult::failed(
                self.name(),
                CheckLevel::Error,
                format!("unreachable: {}", err),
            ),
        }
    }
}
