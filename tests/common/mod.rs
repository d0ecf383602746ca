//! Shared test fixtures: a scriptable HostExecutor stub and an engine
//! harness.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use deployctl::check::CheckerManager;
use deployctl::config::DeployConfig;
use deployctl::engine::{DeploymentEngine, RunContext, RunControl};
use deployctl::error::{Error, Result};
use deployctl::event::{EventBus, Redactor};
use deployctl::install::InstallerRegistry;
use deployctl::model::NodeSpec;
use deployctl::runner::{
    HostExecutor, PlayStats, PlaybookEvent, PlaybookRequest, ProbeResult, ProbeSpec, RunOutcome,
    RunStatus,
};
use deployctl::task::TaskSet;

/// Per-node scripted behavior.
#[derive(Clone, Default)]
pub struct StubBehavior {
    /// Every probe and playbook reports the host unreachable.
    pub unreachable: bool,
    /// Software names whose install playbook fails.
    pub fail_software: Vec<String>,
    /// Artificial playbook duration; cancellable.
    pub install_delay: Option<Duration>,
    /// Free disk reported by df probes (default 204800).
    pub disk_mb: Option<u64>,
    /// Available memory reported by free probes (default 16000).
    pub memory_mb: Option<u64>,
    /// No package manager present on the target.
    pub no_package_manager: bool,
    /// Escalation probes fail.
    pub sudo_denied: bool,
    /// Ports reported as already bound.
    pub occupied_ports: Vec<u16>,
}

/// One recorded playbook invocation.
#[derive(Clone)]
pub struct RecordedPlaybook {
    pub node: String,
    pub playbook: String,
    pub vars: Map<String, Value>,
    pub check_mode: bool,
}

#[derive(Default)]
struct Inner {
    behaviors: HashMap<String, StubBehavior>,
    /// (node, software) -> version visible to version probes.
    installed: HashMap<(String, String), String>,
    probes: Vec<(String, String)>,
    playbooks: Vec<RecordedPlaybook>,
    cancelled_playbooks: usize,
}

/// Scriptable in-memory [`HostExecutor`].
#[derive(Default)]
pub struct StubExecutor {
    inner: Mutex<Inner>,
}

impl StubExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn behavior(&self, node: &str, behavior: StubBehavior) {
        self.inner.lock().behaviors.insert(node.to_string(), behavior);
    }

    pub fn set_unreachable(&self, node: &str) {
        self.inner
            .lock()
            .behaviors
            .entry(node.to_string())
            .or_default()
            .unreachable = true;
    }

    pub fn fail_install(&self, node: &str, software: &str) {
        self.inner
            .lock()
            .behaviors
            .entry(node.to_string())
            .or_default()
            .fail_software
            .push(software.to_string());
    }

    pub fn set_install_delay(&self, node: &str, delay: Duration) {
        self.inner
            .lock()
            .behaviors
            .entry(node.to_string())
            .or_default()
            .install_delay = Some(delay);
    }

    /// Makes version probes report the software as already present.
    pub fn mark_installed(&self, node: &str, software: &str, version: &str) {
        self.inner.lock().installed.insert(
            (node.to_string(), software.to_string()),
            version.to_string(),
        );
    }

    pub fn recorded_playbooks(&self) -> Vec<RecordedPlaybook> {
        self.inner.lock().playbooks.clone()
    }

    pub fn recorded_probes(&self) -> Vec<(String, String)> {
        self.inner.lock().probes.clone()
    }

    pub fn cancelled_playbooks(&self) -> usize {
        self.inner.lock().cancelled_playbooks
    }

    fn behavior_for(&self, node: &str) -> StubBehavior {
        self.inner
            .lock()
            .behaviors
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    fn installed_version(&self, node: &str, software: &str) -> Option<String> {
        self.inner
            .lock()
            .installed
            .get(&(node.to_string(), software.to_string()))
            .cloned()
    }
}

fn ok(stdout: impl Into<String>) -> ProbeResult {
    ProbeResult {
        rc: 0,
        stdout: stdout.into(),
        stderr: String::new(),
        facts: Map::new(),
    }
}

fn missing(what: &str) -> ProbeResult {
    ProbeResult {
        rc: 127,
        stdout: format!("{}: command not found", what),
        stderr: String::new(),
        facts: Map::new(),
    }
}

#[async_trait]
impl HostExecutor for StubExecutor {
    async fn probe(&self, node: &NodeSpec, probe: ProbeSpec) -> Result<ProbeResult> {
        let args = probe.args.clone().unwrap_or_default();
        self.inner
            .lock()
            .probes
            .push((node.name.clone(), format!("{} {}", probe.module, args)));

        let behavior = self.behavior_for(&node.name);
        if behavior.unreachable {
            return Err(Error::unreachable(&node.name, "connection refused"));
        }

        match probe.module.as_str() {
            "ping" => Ok(ok("pong")),
            "setup" => {
                let mut result = ok("");
                result.facts = match json!({
                    "ansible_distribution": "Ubuntu",
                    "ansible_distribution_version": "22.04",
                    "ansible_kernel": "6.8.0-39-generic",
                    "ansible_processor_vcpus": 8,
                    "ansible_memtotal_mb": 16000,
                    "ansible_architecture": "x86_64",
                }) {
                    Value::Object(map) => map,
                    _ => unreachable!(),
                };
                Ok(result)
            }
            "shell" => {
                if args.contains("df ") {
                    return Ok(ok(behavior.disk_mb.unwrap_or(204800).to_string()));
                }
                if args.contains("free -m") {
                    return Ok(ok(behavior.memory_mb.unwrap_or(16000).to_string()));
                }
                if args.contains("command -v") {
                    return Ok(ok(if behavior.no_package_manager {
                        ""
                    } else {
                        "/usr/bin/apt-get"
                    }));
                }
                if args.contains("id -un") {
                    if behavior.sudo_denied {
                        return Ok(ProbeResult {
                            rc: 1,
                            stdout: String::new(),
                            stderr: "sudo: a password is required".to_string(),
                            facts: Map::new(),
                        });
                    }
                    return Ok(ok(node.super_user.user.clone()));
                }
                if args.contains("ss -ltnH") {
                    let bound = behavior
                        .occupied_ports
                        .iter()
                        .find(|p| args.contains(&format!(":{}", p)));
                    return Ok(ok(match bound {
                        Some(p) => format!("LISTEN 0 4096 *:{}", p),
                        None => String::new(),
                    }));
                }
                if args.contains("zkServer.sh version") {
                    return Ok(match self.installed_version(&node.name, "zookeeper") {
                        Some(v) => ok(format!("Apache ZooKeeper, version {}.4", v)),
                        None => missing("zkServer.sh"),
                    });
                }
                if args.contains("test -f") && args.contains("zkServer.sh") {
                    let marker = match self.installed_version(&node.name, "zookeeper") {
                        Some(_) => "present",
                        None => "",
                    };
                    return Ok(ok(marker));
                }
                if args.contains("java -version") {
                    return Ok(match self.installed_version(&node.name, "java") {
                        Some(v) => ok(format!("openjdk version \"{}.0.1\" 2024-01-16", v)),
                        None => missing("java"),
                    });
                }
                if args.contains("python") && args.contains("--version") {
                    return Ok(match self.installed_version(&node.name, "python") {
                        Some(v) => ok(format!("Python {}", v)),
                        None => missing("python"),
                    });
                }
                // Writes (zoo.cfg, profile scripts) and anything else
                // succeed silently.
                Ok(ok(""))
            }
            other => Err(Error::Runner(format!("unexpected module '{}'", other))),
        }
    }

    async fn run_playbook(&self, request: PlaybookRequest<'_>) -> Result<RunOutcome> {
        let software = request
            .playbook
            .trim_start_matches("install_")
            .trim_end_matches(".yml")
            .to_string();
        let behavior = self.behavior_for(&request.node.name);

        self.inner.lock().playbooks.push(RecordedPlaybook {
            node: request.node.name.clone(),
            playbook: request.playbook.to_string(),
            vars: request.extra_vars.clone(),
            check_mode: request.check_mode,
        });

        if behavior.unreachable {
            return Ok(RunOutcome {
                status: RunStatus::Unreachable,
                stderr_tail: "connection refused".to_string(),
                stats: PlayStats::default(),
            });
        }

        if let Some(sink) = &request.on_event {
            sink(PlaybookEvent::TaskStart {
                name: format!("Install {}", software),
            });
        }

        if let Some(delay) = behavior.install_delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = request.cancel.cancelled() => {
                    self.inner.lock().cancelled_playbooks += 1;
                    return Ok(RunOutcome {
                        status: RunStatus::Cancelled,
                        stderr_tail: String::new(),
                        stats: PlayStats::default(),
                    });
                }
            }
        }

        if behavior.fail_software.contains(&software) {
            if let Some(sink) = &request.on_event {
                sink(PlaybookEvent::TaskFailed {
                    name: format!("Install {}", software),
                    message: "exit status 2".to_string(),
                });
            }
            return Ok(RunOutcome {
                status: RunStatus::Failed,
                stderr_tail: format!("{} install exploded", software),
                stats: PlayStats {
                    failed: 1,
                    ..PlayStats::default()
                },
            });
        }

        if let Some(sink) = &request.on_event {
            sink(PlaybookEvent::TaskChanged {
                name: format!("Install {}", software),
            });
        }

        // Check mode must not touch the target: version probes keep
        // reporting the software as absent.
        if !request.check_mode {
            let version = request
                .extra_vars
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or("0")
                .to_string();
            self.inner
                .lock()
                .installed
                .insert((request.node.name.clone(), software), version);
        }

        Ok(RunOutcome {
            status: RunStatus::Ok,
            stderr_tail: String::new(),
            stats: PlayStats {
                ok: 3,
                changed: 1,
                ..PlayStats::default()
            },
        })
    }
}

/// Builds an engine over the stub executor from a YAML config string.
pub fn build_engine(
    yaml: &str,
    stub: Arc<StubExecutor>,
    dry_run: bool,
) -> (DeploymentEngine, EventBus, RunControl) {
    let config = DeployConfig::from_yaml(yaml).expect("valid test config");
    build_engine_with_nodes(&config, config.nodes.clone(), stub, dry_run)
}

/// Same as [`build_engine`] but with an explicit node list, so tests can
/// add nodes that carry no tasks.
pub fn build_engine_with_nodes(
    config: &DeployConfig,
    nodes: Vec<NodeSpec>,
    stub: Arc<StubExecutor>,
    dry_run: bool,
) -> (DeploymentEngine, EventBus, RunControl) {
    let tasks = TaskSet::build(config);
    let bus = EventBus::new(Redactor::from_config(config));
    let control = RunControl::new();
    let tmp = std::env::temp_dir().join("deployctl-tests");
    let ctx = RunContext {
        data_dir: tmp.clone(),
        run_dir: tmp,
        max_concurrent_nodes: config.general.max_concurrent_nodes,
        dry_run,
        control: control.clone(),
    };
    let engine = DeploymentEngine::new(
        ctx,
        nodes,
        tasks,
        CheckerManager::standard(),
        InstallerRegistry::standard(),
        stub as Arc<dyn HostExecutor>,
        bus.clone(),
    );
    (engine, bus, control)
}
