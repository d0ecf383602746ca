//! Java JDK installer.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map};

use super::{InstallContext, Installer, PreCheckVerdict};
use crate::config::LogLevel;
use crate::error::{Error, Result};
use crate::model::Source;
use crate::runner::{CredentialScope, ProbeSpec};

const SUPPORTED_MAJORS: &[u32] = &[8, 11, 17];
const PLAYBOOK: &str = "install_java.yml";

/// Typed view of the java package config.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct JavaSettings {
    /// Export JAVA_HOME in a profile script after installation.
    set_java_home: bool,
    /// Also prepend `<install_path>/bin` to PATH in the profile script.
    add_to_path: bool,
}

const KNOWN_KEYS: &[&str] = &["set_java_home", "add_to_path"];

/// Installs a Java JDK from repositories, a downloaded tarball, or an
/// archive already present on the target.
#[derive(Debug)]
pub struct JavaInstaller;

#[async_trait]
impl Installer for JavaInstaller {
    fn name(&self) -> &'static str {
        "java"
    }

    fn supports_version(&self, version: &str) -> bool {
        declared_major(version).is_some_and(|m| SUPPORTED_MAJORS.contains(&m))
    }

    async fn pre_check(&self, ctx: &InstallContext<'_>) -> Result<PreCheckVerdict> {
        let declared = declared_major(&ctx.software.version).ok_or_else(|| {
            Error::install(
                self.name(),
                &ctx.node.name,
                format!(
                    "unsupported java version '{}', supported majors: {:?}",
                    ctx.software.version, SUPPORTED_MAJORS
                ),
            )
        })?;

        let result = ctx
            .executor
            .probe(ctx.node, ProbeSpec::shell("java -version 2>&1"))
            .await?;
        if result.ok() {
            if let Some(installed) = major_from_version_output(&result.stdout) {
                if installed == declared {
                    return Ok(PreCheckVerdict::Skip(format!(
                        "java {} already installed",
                        installed
                    )));
                }
                ctx.reporter.log(
                    LogLevel::Info,
                    format!("java {} present, installing {} alongside", installed, declared),
                );
            }
        }
        Ok(PreCheckVerdict::Proceed)
    }

    async fn install(&self, ctx: &InstallContext<'_>) -> Result<()> {
        let settings: JavaSettings = ctx.settings(KNOWN_KEYS);
        let mut vars = Map::new();
        vars.insert("install_path".to_string(), json!(ctx.software.install_path));
        vars.insert("version".to_string(), json!(ctx.software.version));
        vars.insert("source".to_string(), json!(ctx.software.source.to_string()));
        vars.insert(
            "source_path".to_string(),
            json!(ctx.software.source_path.clone().unwrap_or_default()),
        );
        vars.insert("set_java_home".to_string(), json!(settings.set_java_home));
        vars.insert("add_to_path".to_string(), json!(settings.add_to_path));
        ctx.run_playbook(PLAYBOOK, vars).await
    }

    async fn post_config(&self, ctx: &InstallContext<'_>) -> Result<()> {
        let settings: JavaSettings = ctx.settings(KNOWN_KEYS);
        if !settings.set_java_home {
            return Ok(());
        }
        if ctx.dry_run {
            ctx.reporter
                .log(LogLevel::Info, "dry-run: would write JAVA_HOME profile script");
            return Ok(());
        }

        let home = ctx.software.install_path.display();
        let mut script = format!("export JAVA_HOME={}", home);
        if settings.add_to_path {
            script.push_str(&format!("\nexport PATH=$PATH:{}/bin", home));
        }
        let command = format!(
            "printf '%s\\n' '{}' > /etc/profile.d/java_home.sh",
            script.replace('\n', "' '")
        );
        let result = ctx
            .executor
            .probe(
                ctx.node,
                ProbeSpec::shell(command).with_scope(CredentialScope::Super),
            )
            .await?;
        if result.ok() {
            ctx.reporter
                .log(LogLevel::Info, "JAVA_HOME exported in /etc/profile.d/java_home.sh");
            Ok(())
        } else {
            Err(Error::install(
                self.name(),
                &ctx.node.name,
                format!("failed to write JAVA_HOME profile: {}", result.stderr.trim()),
            ))
        }
    }

    async fn verify(&self, ctx: &InstallContext<'_>) -> Result<()> {
        if ctx.dry_run {
            // The install ran in check mode, so there is no artifact to
            // probe.
            ctx.reporter
                .log(LogLevel::Info, "dry-run: skipping verification");
            return Ok(());
        }
        let declared = declared_major(&ctx.software.version).unwrap_or_default();
        // Prefer the freshly installed binary; fall back to PATH for
        // repository installs.
        let command = match ctx.software.source {
            Source::Repository => "java -version 2>&1".to_string(),
            _ => format!(
                "{}/bin/java -version 2>&1 || java -version 2>&1",
                ctx.software.install_path.display()
            ),
        };
        let result = ctx.executor.probe(ctx.node, ProbeSpec::shell(command)).await?;
        if !result.ok() {
            return Err(Error::install(
                self.name(),
                &ctx.node.name,
                "java not runnable after installation",
            ));
        }
        match major_from_version_output(&result.stdout) {
            Some(found) if found == declared => Ok(()),
            Some(found) => Err(Error::install(
                self.name(),
                &ctx.node.name,
                format!("expected java {}, found {}", declared, found),
            )),
            None => Err(Error::install(
                self.name(),
                &ctx.node.name,
                format!("could not parse java version output: {}", result.stdout.trim()),
            )),
        }
    }
}

/// Major version from a declared version string ("11", "1.8", "17.0.2").
fn declared_major(version: &str) -> Option<u32> {
    let version = version.trim();
    let rest = version.strip_prefix("1.").unwrap_or(version);
    rest.split('.').next()?.parse().ok()
}

/// Major version from `java -version` output.
///
/// Handles both the legacy `java version "1.8.0_392"` and the modern
/// `openjdk version "11.0.22"` formats.
fn major_from_version_output(output: &str) -> Option<u32> {
    let quoted = output.split('"').nth(1)?;
    declared_major(quoted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_major() {
        assert_eq!(declared_major("11"), Some(11));
        assert_eq!(declared_major("1.8"), Some(8));
        assert_eq!(declared_major("17.0.2"), Some(17));
        assert_eq!(declared_major("latest"), None);
    }

    #[test]
    fn test_major_from_version_output() {
        let legacy = "java version \"1.8.0_392\"\nJava(TM) SE Runtime Environment";
        assert_eq!(major_from_version_output(legacy), Some(8));

        let modern = "openjdk version \"11.0.22\" 2024-01-16\nOpenJDK Runtime Environment";
        assert_eq!(major_from_version_output(modern), Some(11));

        assert_eq!(major_from_version_output("command not found"), None);
    }

    #[test]
    fn test_supported_versions() {
        let installer = JavaInstaller;
        assert!(installer.supports_version("8"));
        assert!(installer.supports_version("1.8"));
        assert!(installer.supports_version("11"));
        assert!(installer.supports_version("17"));
        assert!(!installer.supports_version("9"));
        assert!(!installer.supports_version("21"));
        assert!(!installer.supports_version("banana"));
    }
}
