//! Ansible CLI adapter.
//!
//! Each invocation gets its own work directory under the run directory,
//! containing a one-host inventory, the extra-vars file and the captured
//! runner output. Inventories are written with owner-only permissions and
//! deleted together with the run directory; passwords placed in them never
//! reach any log or event.
//!
//! The adapter drives the `ansible` binary for ad-hoc probes and
//! `ansible-playbook` for installs, parsing the line output into streaming
//! [`PlaybookEvent`]s and a final recap.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{
    CredentialScope, HostExecutor, PlayStats, PlaybookEvent, PlaybookRequest, ProbeResult,
    ProbeSpec, RunOutcome, RunStatus,
};
use crate::error::{Error, Result};
use crate::model::NodeSpec;

const STDERR_TAIL_CHARS: usize = 2000;

/// Production [`HostExecutor`] backed by the Ansible CLI.
pub struct AnsibleExecutor {
    playbook_dir: PathBuf,
    work_dir: PathBuf,
    dry_run: bool,
    seq: AtomicU64,
}

impl AnsibleExecutor {
    /// Creates an executor.
    ///
    /// `work_dir` is the per-run directory that receives one subdirectory
    /// per invocation; `dry_run` forces check mode onto every playbook.
    pub fn new(
        playbook_dir: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        dry_run: bool,
    ) -> Self {
        Self {
            playbook_dir: playbook_dir.into(),
            work_dir: work_dir.into(),
            dry_run,
            seq: AtomicU64::new(0),
        }
    }

    /// Creates the work directory for one invocation:
    /// `<run_dir>/<node>/<seq>/`.
    async fn invocation_dir(&self, node: &NodeSpec) -> Result<PathBuf> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let dir = self.work_dir.join(&node.name).join(format!("{:04}", seq));
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn write_inventory(
        &self,
        dir: &Path,
        node: &NodeSpec,
        scope: CredentialScope,
    ) -> Result<PathBuf> {
        let path = dir.join("inventory.yml");
        let content = render_inventory(node, scope)?;
        tokio::fs::write(&path, content).await?;
        restrict_permissions(&path).await?;
        Ok(path)
    }

    fn base_command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .env("ANSIBLE_RETRY_FILES_ENABLED", "False")
            .env("ANSIBLE_NOCOWS", "1")
            .kill_on_drop(true)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        cmd
    }
}

#[async_trait::async_trait]
impl HostExecutor for AnsibleExecutor {
    async fn probe(&self, node: &NodeSpec, probe: ProbeSpec) -> Result<ProbeResult> {
        let dir = self.invocation_dir(node).await?;
        let inventory = self.write_inventory(&dir, node, probe.scope).await?;

        let mut cmd = self.base_command("ansible");
        cmd.arg(&node.name)
            .arg("-i")
            .arg(&inventory)
            .arg("-m")
            .arg(&probe.module)
            .arg("-o");
        if let Some(args) = &probe.args {
            cmd.arg("-a").arg(args);
        }
        if probe.scope == CredentialScope::Super {
            cmd.arg("--become");
        }

        debug!(node = %node.name, module = %probe.module, "running probe");

        let child = cmd.spawn().map_err(|e| {
            Error::Runner(format!("failed to spawn ansible: {}", e))
        })?;
        let output = tokio::time::timeout(probe.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::timeout(format!("probe {}", probe.module), probe.timeout.as_secs()))?
            .map_err(Error::Io)?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if stdout.contains("UNREACHABLE") || stderr.contains("UNREACHABLE") {
            return Err(Error::unreachable(&node.name, tail(&stderr_or(&stdout, &stderr))));
        }

        Ok(parse_adhoc_output(
            &stdout,
            &stderr,
            output.status.code().unwrap_or(-1),
        ))
    }

    async fn run_playbook(&self, request: PlaybookRequest<'_>) -> Result<RunOutcome> {
        let playbook_path = self.playbook_dir.join(request.playbook);
        if !playbook_path.exists() {
            return Err(Error::Runner(format!(
                "playbook not found: {}",
                playbook_path.display()
            )));
        }

        let dir = self.invocation_dir(request.node).await?;
        let inventory = self.write_inventory(&dir, request.node, request.scope).await?;

        let vars_path = dir.join("extravars.json");
        tokio::fs::write(&vars_path, serde_json::to_vec_pretty(&request.extra_vars)?).await?;

        let mut cmd = self.base_command("ansible-playbook");
        cmd.arg("-i")
            .arg(&inventory)
            .arg(&playbook_path)
            .arg("-e")
            .arg(format!("@{}", vars_path.display()));
        if request.check_mode || self.dry_run {
            cmd.arg("--check");
        }

        debug!(node = %request.node.name, playbook = %request.playbook, "running playbook");

        let mut child = cmd.spawn().map_err(|e| {
            Error::Runner(format!("failed to spawn ansible-playbook: {}", e))
        })?;
        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        let mut log_file = tokio::fs::File::create(dir.join("stdout.log")).await?;
        let mut lines = BufReader::new(stdout).lines();
        let deadline = request.timeout.map(|d| tokio::time::Instant::now() + d);

        let mut stats = PlayStats::default();
        let mut saw_recap = false;
        let mut unreachable = false;
        let mut cancelled = false;
        let mut last_fatal = String::new();

        loop {
            tokio::select! {
                biased;
                _ = request.cancel.cancelled() => {
                    warn!(node = %request.node.name, "cancellation requested, stopping runner");
                    let _ = child.start_kill();
                    cancelled = true;
                    break;
                }
                _ = async {
                    match deadline {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(Error::timeout(
                        format!("playbook {}", request.playbook),
                        request.timeout.map(|d| d.as_secs()).unwrap_or(0),
                    ));
                }
                line = lines.next_line() => {
                    match line? {
                        Some(line) => {
                            let _ = log_file.write_all(line.as_bytes()).await;
                            let _ = log_file.write_all(b"\n").await;
                            match parse_play_line(&line) {
                                Some(ParsedLine::Event(event)) => {
                                    if matches!(event, PlaybookEvent::Unreachable { .. }) {
                                        unreachable = true;
                                    }
                                    if let PlaybookEvent::TaskFailed { message, .. } = &event {
                                        last_fatal = message.clone();
                                    }
                                    if let Some(sink) = &request.on_event {
                                        sink(event);
                                    }
                                }
                                Some(ParsedLine::Recap(recap)) => {
                                    stats = recap;
                                    saw_recap = true;
                                }
                                None => {}
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        let exit = child.wait().await?;
        let stderr_text = stderr_task.await.unwrap_or_default();
        let _ = log_file.flush().await;

        let status = if cancelled {
            RunStatus::Cancelled
        } else if unreachable || stats.unreachable > 0 {
            RunStatus::Unreachable
        } else if exit.success() && saw_recap && stats.failed == 0 {
            RunStatus::Ok
        } else {
            RunStatus::Failed
        };

        let stderr_tail = if stderr_text.trim().is_empty() {
            tail(&last_fatal)
        } else {
            tail(&stderr_text)
        };

        Ok(RunOutcome {
            status,
            stderr_tail,
            stats,
        })
    }
}

fn stderr_or(stdout: &str, stderr: &str) -> String {
    if stderr.trim().is_empty() {
        stdout.to_string()
    } else {
        stderr.to_string()
    }
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= STDERR_TAIL_CHARS {
        trimmed.to_string()
    } else {
        let skip = trimmed.chars().count() - STDERR_TAIL_CHARS;
        trimmed.chars().skip(skip).collect()
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, perms).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

// ============================================================================
// Inventory materialization
// ============================================================================

/// Renders a one-host YAML inventory carrying the selected credentials.
fn render_inventory(node: &NodeSpec, scope: CredentialScope) -> Result<String> {
    let mut host_vars = Map::new();
    host_vars.insert("ansible_host".to_string(), json!(node.host));
    host_vars.insert("ansible_port".to_string(), json!(node.port));
    host_vars.insert("ansible_user".to_string(), json!(node.owner.user));

    if let Some(key) = &node.owner.key_path {
        host_vars.insert(
            "ansible_ssh_private_key_file".to_string(),
            json!(key.display().to_string()),
        );
    } else if let Some(password) = &node.owner.password {
        host_vars.insert("ansible_password".to_string(), json!(password));
    }

    if scope == CredentialScope::Super {
        host_vars.insert("ansible_become".to_string(), json!(true));
        host_vars.insert("ansible_become_user".to_string(), json!(node.super_user.user));
        if let Some(password) = &node.super_user.password {
            host_vars.insert("ansible_become_password".to_string(), json!(password));
        }
    }

    let mut hosts = Map::new();
    hosts.insert(node.name.clone(), Value::Object(host_vars));
    let mut all = Map::new();
    all.insert("hosts".to_string(), Value::Object(hosts));
    let mut root = Map::new();
    root.insert("all".to_string(), Value::Object(all));
    Ok(serde_yaml::to_string(&Value::Object(root))?)
}

// ============================================================================
// Output parsing
// ============================================================================

static RC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"rc=(\d+)").unwrap());
static RECAP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"ok=(\d+)\s+changed=(\d+)\s+unreachable=(\d+)\s+failed=(\d+)\s+skipped=(\d+)")
        .unwrap()
});
static TASK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^TASK \[(.+?)\]").unwrap());

/// Parses `ansible -o` one-line output into a [`ProbeResult`].
fn parse_adhoc_output(stdout: &str, stderr: &str, exit_code: i32) -> ProbeResult {
    let mut result = ProbeResult {
        rc: if exit_code == 0 { 0 } else { exit_code },
        stdout: stdout.trim().to_string(),
        stderr: stderr.trim().to_string(),
        facts: Map::new(),
    };

    let line = stdout.lines().find(|l| l.contains(" | ")).unwrap_or("");

    if let Some(caps) = RC_RE.captures(line) {
        if let Ok(rc) = caps[1].parse() {
            result.rc = rc;
        }
    }

    // JSON payload form: `host | SUCCESS => {...}`
    if let Some(idx) = line.find("=> {") {
        if let Ok(Value::Object(payload)) = serde_json::from_str(&line[idx + 3..]) {
            if let Some(rc) = payload.get("rc").and_then(Value::as_i64) {
                result.rc = rc as i32;
            }
            if let Some(out) = payload.get("stdout").and_then(Value::as_str) {
                result.stdout = out.to_string();
            }
            if let Some(err) = payload.get("stderr").and_then(Value::as_str) {
                result.stderr = err.to_string();
            }
            if let Some(Value::Object(facts)) = payload.get("ansible_facts") {
                result.facts = facts.clone();
            } else {
                result.facts = payload;
            }
        }
    } else if let Some(idx) = line.find(">>") {
        // Shell one-line form: `host | CHANGED | rc=0 >> output`
        result.stdout = line[idx + 2..].trim().to_string();
    }

    if line.contains("| FAILED") && result.rc == 0 {
        result.rc = 1;
    }

    result
}

enum ParsedLine {
    Event(PlaybookEvent),
    Recap(PlayStats),
}

/// Classifies one `ansible-playbook` output line.
fn parse_play_line(line: &str) -> Option<ParsedLine> {
    let trimmed = line.trim();

    if let Some(caps) = TASK_RE.captures(trimmed) {
        return Some(ParsedLine::Event(PlaybookEvent::TaskStart {
            name: caps[1].to_string(),
        }));
    }
    if let Some(rest) = trimmed.strip_prefix("ok: [") {
        return Some(ParsedLine::Event(PlaybookEvent::TaskOk {
            name: rest.trim_end_matches(']').to_string(),
        }));
    }
    if let Some(rest) = trimmed.strip_prefix("changed: [") {
        return Some(ParsedLine::Event(PlaybookEvent::TaskChanged {
            name: rest.trim_end_matches(']').to_string(),
        }));
    }
    if trimmed.starts_with("fatal:") {
        let message = trimmed
            .split_once("=>")
            .map(|(_, m)| m.trim().to_string())
            .unwrap_or_else(|| trimmed.to_string());
        if trimmed.contains("UNREACHABLE") {
            return Some(ParsedLine::Event(PlaybookEvent::Unreachable { message }));
        }
        let name = trimmed
            .split_once('[')
            .and_then(|(_, rest)| rest.split_once(']'))
            .map(|(host, _)| host.to_string())
            .unwrap_or_default();
        return Some(ParsedLine::Event(PlaybookEvent::TaskFailed { name, message }));
    }
    if let Some(caps) = RECAP_RE.captures(trimmed) {
        return Some(ParsedLine::Recap(PlayStats {
            ok: caps[1].parse().unwrap_or(0),
            changed: caps[2].parse().unwrap_or(0),
            unreachable: caps[3].parse().unwrap_or(0),
            failed: caps[4].parse().unwrap_or(0),
            skipped: caps[5].parse().unwrap_or(0),
        }));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Credentials, NodeSpec};
    use std::path::PathBuf;

    fn node() -> NodeSpec {
        NodeSpec {
            name: "web1".to_string(),
            host: "10.0.0.5".to_string(),
            port: 2222,
            owner: Credentials {
                user: "deploy".to_string(),
                password: Some("hunter2".to_string()),
                key_path: None,
            },
            super_user: Credentials {
                user: "root".to_string(),
                password: Some("rootpw".to_string()),
                key_path: None,
            },
            install: vec![],
        }
    }

    #[test]
    fn test_inventory_owner_scope() {
        let yaml = render_inventory(&node(), CredentialScope::Owner).unwrap();
        assert!(yaml.contains("ansible_host: 10.0.0.5"));
        assert!(yaml.contains("ansible_port: 2222"));
        assert!(yaml.contains("ansible_user: deploy"));
        assert!(yaml.contains("ansible_password: hunter2"));
        assert!(!yaml.contains("ansible_become"));
    }

    #[test]
    fn test_inventory_super_scope_adds_become() {
        let yaml = render_inventory(&node(), CredentialScope::Super).unwrap();
        assert!(yaml.contains("ansible_become: true"));
        assert!(yaml.contains("ansible_become_user: root"));
        assert!(yaml.contains("ansible_become_password: rootpw"));
    }

    #[test]
    fn test_inventory_prefers_key_over_password() {
        let mut n = node();
        n.owner.key_path = Some(PathBuf::from("/home/deploy/.ssh/id_rsa"));
        let yaml = render_inventory(&n, CredentialScope::Owner).unwrap();
        assert!(yaml.contains("ansible_ssh_private_key_file"));
        assert!(!yaml.contains("ansible_password"));
    }

    #[test]
    fn test_parse_adhoc_json_payload() {
        let out = r#"web1 | SUCCESS => {"changed": false, "rc": 0, "stdout": "1024", "stderr": ""}"#;
        let result = parse_adhoc_output(out, "", 0);
        assert_eq!(result.rc, 0);
        assert_eq!(result.stdout, "1024");
    }

    #[test]
    fn test_parse_adhoc_shell_oneline() {
        let out = "web1 | CHANGED | rc=0 >> 4096";
        let result = parse_adhoc_output(out, "", 0);
        assert_eq!(result.rc, 0);
        assert_eq!(result.stdout, "4096");
    }

    #[test]
    fn test_parse_adhoc_failed_rc() {
        let out = "web1 | FAILED | rc=2 >> no such file";
        let result = parse_adhoc_output(out, "", 2);
        assert_eq!(result.rc, 2);
        assert!(!result.ok());
        assert_eq!(result.stdout, "no such file");
    }

    #[test]
    fn test_parse_adhoc_facts() {
        let out = r#"web1 | SUCCESS => {"ansible_facts": {"ansible_kernel": "6.8.0"}, "changed": false}"#;
        let result = parse_adhoc_output(out, "", 0);
        assert_eq!(
            result.facts.get("ansible_kernel").and_then(|v| v.as_str()),
            Some("6.8.0")
        );
    }

    #[test]
    fn test_parse_play_lines() {
        match parse_play_line("TASK [Install OpenJDK] *****").unwrap() {
            ParsedLine::Event(PlaybookEvent::TaskStart { name }) => {
                assert_eq!(name, "Install OpenJDK")
            }
            _ => panic!("expected task start"),
        }
        assert!(matches!(
            parse_play_line("changed: [web1]").unwrap(),
            ParsedLine::Event(PlaybookEvent::TaskChanged { .. })
        ));
        assert!(matches!(
            parse_play_line(r#"fatal: [web1]: FAILED! => {"msg": "boom"}"#).unwrap(),
            ParsedLine::Event(PlaybookEvent::TaskFailed { .. })
        ));
        assert!(matches!(
            parse_play_line(r#"fatal: [web1]: UNREACHABLE! => {"msg": "timeout"}"#).unwrap(),
            ParsedLine::Event(PlaybookEvent::Unreachable { .. })
        ));
        assert!(parse_play_line("PLAY [all] *****").is_none());
    }

    #[test]
    fn test_parse_recap() {
        let line = "web1  : ok=4    changed=2    unreachable=0    failed=0    skipped=1    rescued=0    ignored=0";
        match parse_play_line(line).unwrap() {
            ParsedLine::Recap(stats) => {
                assert_eq!(stats.ok, 4);
                assert_eq!(stats.changed, 2);
                assert_eq!(stats.failed, 0);
                assert_eq!(stats.skipped, 1);
            }
            _ => panic!("expected recap"),
        }
    }

    #[test]
    fn test_tail_truncates_long_text() {
        let long = "x".repeat(5000);
        assert_eq!(tail(&long).len(), STDERR_TAIL_CHARS);
        assert_eq!(tail("short"), "short");
    }
}
