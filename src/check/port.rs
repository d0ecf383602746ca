//! Listening-port availability check.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{probe_error_result, CheckContext, CheckLevel, CheckResult, Checker};
use crate::model::SoftwareSpec;
use crate::runner::ProbeSpec;

/// Checks that the ports a package wants to bind are not already taken.
///
/// Ports are declared in the package config either as a `ports` list or as
/// a single `client_port`. With no declared ports the check passes.
pub struct PortAvailabilityChecker;

/// Extracts the declared ports from a package config.
fn declared_ports(software: &SoftwareSpec) -> Vec<u16> {
    let mut ports = Vec::new();
    if let Some(Value::Array(list)) = software.config.get("ports") {
        for value in list {
            if let Some(port) = value.as_u64().filter(|p| *p > 0 && *p <= u16::MAX as u64) {
                ports.push(port as u16);
            }
        }
    }
    if let Some(port) = software
        .config
        .get("client_port")
        .and_then(Value::as_u64)
        .filter(|p| *p > 0 && *p <= u16::MAX as u64)
    {
        ports.push(port as u16);
    }
    ports.sort_unstable();
    ports.dedup();
    ports
}

#[async_trait]
impl Checker for PortAvailabilityChecker {
    fn name(&self) -> &'static str {
        "port_availability"
    }

    async fn check(&self, ctx: &CheckContext<'_>) -> CheckResult {
        let ports = ctx.software.map(declared_ports).unwrap_or_default();
        if ports.is_empty() {
            return CheckResult::passed(self.name(), "no ports declared");
        }

        let mut occupied = Vec::new();
        for port in &ports {
            let probe = ProbeSpec::shell(format!("ss -ltnH 'sport = :{}' | head -1", port))
                .with_scope(crate::runner::CredentialScope::Super);
            match ctx.executor.probe(ctx.node, probe).await {
                Ok(result) if result.ok() => {
                    if !result.stdout_trimmed().is_empty() {
                        occupied.push(*port);
                    }
                }
                Ok(result) => {
                    return CheckResult::failed(
                        self.name(),
                        CheckLevel::Warning,
                        format!("ss failed: {}", result.stderr.trim()),
                    )
                }
                Err(err) => return probe_error_result(self.name(), &err),
            }
        }

        let mut details = Map::new();
        details.insert("ports".to_string(), json!(ports));
        details.insert("occupied".to_string(), json!(occupied));

        if occupied.is_empty() {
            CheckResult::passed(self.name(), format!("ports available: {:?}", ports))
                .with_details(details)
        } else {
            CheckResult::failed(
                self.name(),
                CheckLevel::Error,
                format!("ports already bound: {:?}", occupied),
            )
            .with_details(details)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn software(config: Value) -> SoftwareSpec {
        SoftwareSpec {
            name: "zookeeper".to_string(),
            version: "3.8".to_string(),
            install_path: PathBuf::from("/opt/zk"),
            source: Default::default(),
            source_path: None,
            config: match config {
                Value::Object(map) => map,
                _ => Default::default(),
            },
        }
    }

    #[test]
    fn test_declared_ports_from_list_and_client_port() {
        let s = software(json!({"ports": [8080, 8081], "client_port": 2181}));
        assert_eq!(declared_ports(&s), vec![2181, 8080, 8081]);
    }

    #[test]
    fn test_declared_ports_dedup_and_bounds() {
        let s = software(json!({"ports": [2181, 2181, 0, 700000], "client_port": 2181}));
        assert_eq!(declared_ports(&s), vec![2181]);
    }

    #[test]
    fn test_no_ports_declared() {
        let s = software(json!({}));
        assert!(declared_ports(&s).is_empty());
    }
}
