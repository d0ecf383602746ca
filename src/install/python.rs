//! Python installer.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map};

use super::{InstallContext, Installer, PreCheckVerdict};
use crate::config::LogLevel;
use crate::error::{Error, Result};
use crate::model::Source;
use crate::runner::ProbeSpec;

const PLAYBOOK: &str = "install_python.yml";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PythonSettings {
    install_pip: bool,
    install_venv: bool,
}

impl Default for PythonSettings {
    fn default() -> Self {
        Self {
            install_pip: true,
            install_venv: true,
        }
    }
}

const KNOWN_KEYS: &[&str] = &["install_pip", "install_venv"];

/// Installs Python from repositories or builds it from a source tarball
/// with the install path as prefix.
#[derive(Debug)]
pub struct PythonInstaller;

impl PythonInstaller {
    fn version_probe_command(&self, ctx: &InstallContext<'_>) -> String {
        match ctx.software.source {
            Source::Repository => format!("{} --version 2>&1", binary_name(&ctx.software.version)),
            _ => format!(
                "{}/bin/{} --version 2>&1",
                ctx.software.install_path.display(),
                binary_name(&ctx.software.version)
            ),
        }
    }
}

#[async_trait]
impl Installer for PythonInstaller {
    fn name(&self) -> &'static str {
        "python"
    }

    fn supports_version(&self, version: &str) -> bool {
        version == "2.7" || version.starts_with("2.7.") || version.starts_with('3')
    }

    async fn pre_check(&self, ctx: &InstallContext<'_>) -> Result<PreCheckVerdict> {
        if !self.supports_version(&ctx.software.version) {
            return Err(Error::install(
                self.name(),
                &ctx.node.name,
                format!(
                    "unsupported python version '{}', supported: 2.7 and 3.x",
                    ctx.software.version
                ),
            ));
        }
        if ctx.software.source == Source::Local {
            return Err(Error::install(
                self.name(),
                &ctx.node.name,
                "source 'local' is not supported for python; use repository or url",
            ));
        }

        let probe = ProbeSpec::shell(self.version_probe_command(ctx));
        let result = ctx.executor.probe(ctx.node, probe).await?;
        if result.ok() {
            if let Some(installed) = parse_python_version(&result.stdout) {
                if installed.starts_with(&ctx.software.version) {
                    return Ok(PreCheckVerdict::Skip(format!(
                        "python {} already installed",
                        installed
                    )));
                }
            }
        }
        Ok(PreCheckVerdict::Proceed)
    }

    async fn install(&self, ctx: &InstallContext<'_>) -> Result<()> {
        let settings: PythonSettings = ctx.settings(KNOWN_KEYS);
        let mut vars = Map::new();
        vars.insert("install_path".to_string(), json!(ctx.software.install_path));
        vars.insert("version".to_string(), json!(ctx.software.version));
        vars.insert("source".to_string(), json!(ctx.software.source.to_string()));
        vars.insert(
            "source_path".to_string(),
            json!(ctx.software.source_path.clone().unwrap_or_default()),
        );
        vars.insert("install_pip".to_string(), json!(settings.install_pip));
        vars.insert("install_venv".to_string(), json!(settings.install_venv));
        ctx.run_playbook(PLAYBOOK, vars).await
    }

    async fn verify(&self, ctx: &InstallContext<'_>) -> Result<()> {
        if ctx.dry_run {
            ctx.reporter
                .log(LogLevel::Info, "dry-run: skipping verification");
            return Ok(());
        }
        let probe = ProbeSpec::shell(self.version_probe_command(ctx));
        let result = ctx.executor.probe(ctx.node, probe).await?;
        if !result.ok() {
            return Err(Error::install(
                self.name(),
                &ctx.node.name,
                format!(
                    "{} not runnable after installation",
                    binary_name(&ctx.software.version)
                ),
            ));
        }
        match parse_python_version(&result.stdout) {
            Some(found) if found.starts_with(&ctx.software.version) => Ok(()),
            Some(found) => Err(Error::install(
                self.name(),
                &ctx.node.name,
                format!("expected python {}, found {}", ctx.software.version, found),
            )),
            None => Err(Error::install(
                self.name(),
                &ctx.node.name,
                format!("could not parse python version output: {}", result.stdout.trim()),
            )),
        }
    }
}

/// Interpreter binary name for a declared version: "3.9" -> "python3.9",
/// "3" -> "python3", "2.7" -> "python2.7".
fn binary_name(version: &str) -> String {
    let mut parts = version.split('.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) => format!("python{}.{}", major, minor),
        (Some(major), None) => format!("python{}", major),
        _ => "python3".to_string(),
    }
}

/// Extracts "3.9.18" from "Python 3.9.18".
fn parse_python_version(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .find(|word| word.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .map(String::from)
}
