//! Package manager presence check.

use async_trait::async_trait;
use serde_json::{json, Map};

use super::{probe_error_result, CheckContext, CheckLevel, CheckResult, Checker};
use crate::model::Source;
use crate::runner::ProbeSpec;

/// Detects a supported package manager (apt-get, yum or dnf).
///
/// Absence is a warning, except when the scoped package installs from
/// `repository` source: then there is nothing to install with, and the
/// result escalates to a gating error.
pub struct PackageManagerChecker;

#[async_trait]
impl Checker for PackageManagerChecker {
    fn name(&self) -> &'static str {
        "package_manager"
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let probe =
            ProbeSpec::shell("command -v apt-get || command -v yum || command -v dnf || true");
        match ctx.executor.probe(ctx.node, probe).await {
            Ok(result) => {
                let found = result.stdout_trimmed();
                if result.ok() && !found.is_empty() {
                    let manager = found
                        .rsplit('/')
                        .next()
                        .unwrap_or(found)
                        .to_string();
                    let mut details = Map::new();
                    details.insert("manager".to_string(), json!(manager));
                    CheckResult::passed(self.name(), format!("{} is available", found))
                        .with_details(details)
                } else {
                    let level = match ctx.software.map(|s| s.source) {
                        Some(Source::Repository) => CheckLevel::Error,
                        _ => CheckLevel::Warning,
                    };
                    CheckResult::failed(
                        self.name(),
                        level,
                        "no supported package manager found (apt-get, yum, dnf)",
                    )
                }
            }
            Err(err) => probe_error_result(self.name(), &err),
        }
    }
}
