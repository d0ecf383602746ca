//! Privilege escalation check.

use async_trait::async_trait;
use serde_json::{json, Map};

use super::{probe_error_result, CheckContext, CheckLevel, CheckResult, Checker};
use crate::runner::{CredentialScope, ProbeSpec};

/// Verifies that escalation to the super user works without a prompt.
pub struct SudoPrivilegeChecker;

#[async_trait]
impl Checker for SudoPrivilegeChecker {
    fn name(&self) -> &'static str {
        "sudo_privilege"
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let probe = ProbeSpec::shell("id -un").with_scope(CredentialScope::Super);
        match ctx.executor.probe(ctx.node, probe).await {
            Ok(result) if result.ok() => {
                let effective = result.stdout_trimmed().to_string();
                let mut details = Map::new();
                details.insert("effective_user".to_string(), json!(effective));
                if effective == ctx.node.super_user.user {
                    CheckResult::passed(
                        self.name(),
                        format!("escalation confirmed (running as {})", effective),
                    )
                    .with_details(details)
                } else {
                    CheckResult::failed(
                        self.name(),
                        CheckLevel::Warning,
                        format!(
                            "escalation works but runs as {} instead of {}",
                            effective, ctx.node.super_user.user
                        ),
                    )
                    .with_details(details)
                }
            }
            Ok(result) => CheckResult::failed(
                self.name(),
                CheckLevel::Error,
                format!(
                    "escalation to {} failed: {}",
                    ctx.node.super_user.user,
                    result.stderr.trim()
                ),
            ),
            Err(err) => probe_error_result(self.name(), &err),
        }
    }
}
