//! Apache Zookeeper installer.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map};

use super::{InstallContext, Installer, PreCheckVerdict};
use crate::config::LogLevel;
use crate::error::{Error, Result};
use crate::model::Source;
use crate::runner::{CredentialScope, ProbeSpec};

const SUPPORTED_PREFIXES: &[&str] = &["3.6", "3.7", "3.8"];
const PLAYBOOK: &str = "install_zookeeper.yml";

/// Typed view of the zookeeper package config, mirroring zoo.cfg.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct ZookeeperSettings {
    data_dir: String,
    client_port: u16,
    tick_time: u32,
    init_limit: u32,
    sync_limit: u32,
    /// Ensemble members as `host:peer_port:leader_port`, in server-id
    /// order. Empty for standalone mode.
    servers: Vec<String>,
}

impl Default for ZookeeperSettings {
    fn default() -> Self {
        Self {
            data_dir: "/var/lib/zookeeper".to_string(),
            client_port: 2181,
            tick_time: 2000,
            init_limit: 10,
            sync_limit: 5,
            servers: Vec::new(),
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "data_dir",
    "client_port",
    "tick_time",
    "init_limit",
    "sync_limit",
    "servers",
];

/// Installs Apache Zookeeper from repositories or a release tarball and
/// renders its `zoo.cfg` from the package config.
#[derive(Debug)]
pub struct ZookeeperInstaller;

#[async_trait]
impl Installer for ZookeeperInstaller {
    fn name(&self) -> &'static str {
        "zookeeper"
    }

    fn supports_version(&self, version: &str) -> bool {
        SUPPORTED_PREFIXES
            .iter()
            .any(|p| version == *p || version.starts_with(&format!("{}.", p)))
    }

    async fn pre_check(&self, ctx: &InstallContext<'_>) -> Result<PreCheckVerdict> {
        if !self.supports_version(&ctx.software.version) {
            return Err(Error::install(
                self.name(),
                &ctx.node.name,
                format!(
                    "unsupported zookeeper version '{}', supported: {:?}",
                    ctx.software.version, SUPPORTED_PREFIXES
                ),
            ));
        }
        if ctx.software.source == Source::Local {
            return Err(Error::install(
                self.name(),
                &ctx.node.name,
                "source 'local' is not supported for zookeeper; use repository or url",
            ));
        }

        let marker = format!(
            "test -f {}/bin/zkServer.sh && echo present || true",
            ctx.software.install_path.display()
        );
        let result = ctx
            .executor
            .probe(ctx.node, ProbeSpec::shell(marker).with_scope(CredentialScope::Super))
            .await?;
        if result.stdout_trimmed().contains("present") {
            return Ok(PreCheckVerdict::Skip("zookeeper already installed".to_string()));
        }

        // Zookeeper needs a JRE; its absence is not fatal here because java
        // may be earlier in this node's install list.
        let java = ctx
            .executor
            .probe(ctx.node, ProbeSpec::shell("java -version 2>&1"))
            .await;
        if !matches!(java, Ok(ref r) if r.ok()) {
            ctx.reporter.log(
                LogLevel::Warn,
                "java not found on target; zookeeper requires a jre at runtime",
            );
        }
        Ok(PreCheckVerdict::Proceed)
    }

    async fn install(&self, ctx: &InstallContext<'_>) -> Result<()> {
        let settings: ZookeeperSettings = ctx.settings(KNOWN_KEYS);
        let mut vars = Map::new();
        vars.insert("install_path".to_string(), json!(ctx.software.install_path));
        vars.insert("version".to_string(), json!(ctx.software.version));
        vars.insert("source".to_string(), json!(ctx.software.source.to_string()));
        vars.insert(
            "source_path".to_string(),
            json!(ctx.software.source_path.clone().unwrap_or_default()),
        );
        vars.insert("data_dir".to_string(), json!(settings.data_dir));
        vars.insert("client_port".to_string(), json!(settings.client_port));
        vars.insert("tick_time".to_string(), json!(settings.tick_time));
        vars.insert("init_limit".to_string(), json!(settings.init_limit));
        vars.insert("sync_limit".to_string(), json!(settings.sync_limit));
        ctx.run_playbook(PLAYBOOK, vars).await
    }

    async fn post_config(&self, ctx: &InstallContext<'_>) -> Result<()> {
        let settings: ZookeeperSettings = ctx.settings(KNOWN_KEYS);
        let content = render_zoo_cfg(&settings);
        if ctx.dry_run {
            ctx.reporter
                .log(LogLevel::Info, "dry-run: would write zoo.cfg");
            return Ok(());
        }

        let conf_dir = format!("{}/conf", ctx.software.install_path.display());
        let command = format!(
            "mkdir -p {dir} && cat > {dir}/zoo.cfg << 'ZOOCFG'\n{content}ZOOCFG",
            dir = conf_dir,
            content = content
        );
        let result = ctx
            .executor
            .probe(ctx.node, ProbeSpec::shell(command).with_scope(CredentialScope::Super))
            .await?;
        if result.ok() {
            ctx.reporter
                .log(LogLevel::Info, format!("wrote {}/zoo.cfg", conf_dir));
            Ok(())
        } else {
            Err(Error::install(
                self.name(),
                &ctx.node.name,
                format!("failed to write zoo.cfg: {}", result.stderr.trim()),
            ))
        }
    }

    async fn verify(&self, ctx: &InstallContext<'_>) -> Result<()> {
        if ctx.dry_run {
            ctx.reporter
                .log(LogLevel::Info, "dry-run: skipping verification");
            return Ok(());
        }
        let command = format!(
            "{}/bin/zkServer.sh version 2>&1",
            ctx.software.install_path.display()
        );
        let result = ctx
            .executor
            .probe(ctx.node, ProbeSpec::shell(command).with_scope(CredentialScope::Super))
            .await?;
        if result.ok() && result.stdout.contains(&ctx.software.version) {
            Ok(())
        } else if result.ok() {
            Err(Error::install(
                self.name(),
                &ctx.node.name,
                format!(
                    "expected zookeeper {}, version output: {}",
                    ctx.software.version,
                    result.stdout.trim()
                ),
            ))
        } else {
            Err(Error::install(
                self.name(),
                &ctx.node.name,
                "zkServer.sh not runnable after installation",
            ))
        }
    }
}

/// Renders zoo.cfg from the typed settings.
fn render_zoo_cfg(settings: &ZookeeperSettings) -> String {
    let mut out = String::new();
    out.push_str(&format!("tickTime={}\n", settings.tick_time));
    out.push_str(&format!("initLimit={}\n", settings.init_limit));
    out.push_str(&format!("syncLimit={}\n", settings.sync_limit));
    out.push_str(&format!("dataDir={}\n", settings.data_dir));
    out.push_str(&format!("clientPort={}\n", settings.client_port));
    for (index, server) in settings.servers.iter().enumerate() {
        out.push_str(&format!("server.{}={}\n", index + 1, server));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_zoo_cfg_standalone() {
        let cfg = render_zoo_cfg(&ZookeeperSettings::default());
        assert!(cfg.contains("tickTime=2000"));
        assert!(cfg.contains("dataDir=/var/lib/zookeeper"));
        assert!(cfg.contains("clientPort=2181"));
        assert!(!cfg.contains("server."));
    }

    #[test]
    fn test_render_zoo_cfg_ensemble() {
        let settings = ZookeeperSettings {
            servers: vec![
                "zk1:2888:3888".to_string(),
                "zk2:2888:3888".to_string(),
                "zk3:2888:3888".to_string(),
            ],
            ..ZookeeperSettings::default()
        };
        let cfg = render_zoo_cfg(&settings);
        assert!(cfg.contains("server.1=zk1:2888:3888"));
        assert!(cfg.contains("server.3=zk3:2888:3888"));
    }

    #[test]
    fn test_supported_versions() {
        let installer = ZookeeperInstaller;
        assert!(installer.supports_version("3.6"));
        assert!(installer.supports_version("3.8.4"));
        assert!(!installer.supports_version("3.5"));
        assert!(!installer.supports_version("3.81"));
        assert!(!installer.supports_version("4.0"));
    }
}
