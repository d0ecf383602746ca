//! Free disk space check for the install location.

use async_trait::async_trait;
use serde_json::{json, Map};

use super::{probe_error_result, CheckContext, CheckLevel, CheckResult, Checker};
use crate::runner::ProbeSpec;

/// Checks that the filesystem holding the install path has enough free
/// space. The threshold comes from the package's `min_disk_mb` setting
/// (default 1 GiB).
pub struct DiskSpaceChecker;

#[async_trait]
impl Checker for DiskSpaceChecker {
    fn name(&self) -> &'static str {
        "disk_space"
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let Some(software) = ctx.software else {
            return CheckResult::passed(self.name(), "no package scoped, nothing to check");
        };
        let parent = software
            .install_path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "/".to_string());
        let required = software.min_disk_mb();

        let command = format!("df -Pm {} | tail -1 | awk '{{print $4}}'", parent);
        let probe = ProbeSpec::shell(command);
        match ctx.executor.probe(ctx.node, probe).await {
            Ok(result) if result.ok() => match parse_megabytes(result.stdout_trimmed()) {
                Some(available) => {
                    let mut details = Map::new();
                    details.insert("available_mb".to_string(), json!(available));
                    details.insert("required_mb".to_string(), json!(required));
                    if available >= required {
                        CheckResult::passed(
                            self.name(),
                            format!("{}MB available in {} (required: {}MB)", available, parent, required),
                        )
                        .with_details(details)
                    } else {
                        CheckResult::failed(
                            self.name(),
                            CheckLevel::Error,
                            format!(
                                "insufficient disk space: {}MB available in {} (required: {}MB)",
                                available, parent, required
                            ),
                        )
                        .with_details(details)
                    }
                }
                None => CheckResult::failed(
                    self.name(),
                    CheckLevel::Warning,
                    format!("could not parse df output: '{}'", result.stdout_trimmed()),
                ),
            },
            Ok(result) => CheckResult::failed(
                self.name(),
                CheckLevel::Error,
                format!("df failed: {}", result.stderr.trim()),
            ),
            Err(err) => probe_error_result(self.name(), &err),
        }
    }
}

/// Parses `df -Pm` style output ("2048" or "2048M") into MiB.
fn parse_megabytes(text: &str) -> Option<u64> {
    text.trim().trim_end_matches(['M', 'm']).parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_megabytes() {
        assert_eq!(parse_megabytes("2048"), Some(2048));
        assert_eq!(parse_megabytes("2048M"), Some(2048));
        assert_eq!(parse_megabytes(" 512 \n"), Some(512));
        assert_eq!(parse_megabytes("n/a"), None);
        assert_eq!(parse_megabytes(""), None);
    }
}
