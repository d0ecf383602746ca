//! Deployment engine: bounded-concurrency scheduler with per-node serial
//! pipelines.
//!
//! One worker runs per node, admitted through a semaphore of
//! `max_concurrent_nodes` permits. Within a worker, that node's tasks
//! execute strictly in declaration order and fail fast: the first failed
//! task skips everything behind it, because later installs may depend on
//! earlier ones. Node pipelines are fully isolated from each other; a
//! panic inside one worker is caught at the task boundary and cannot
//! affect scheduling on other nodes.
//!
//! Pause is honored only between tasks, never mid-task. Cancellation is
//! cooperative: it is observed at the pause gate, before each task,
//! between installer lifecycle phases, and inside the runner, which kills
//! the in-flight playbook process.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::check::{CheckContext, CheckerManager};
use crate::error::Error;
use crate::event::{EventBus, EventKind};
use crate::install::{InstallContext, InstallerRegistry, PreCheckVerdict, TaskReporter};
use crate::model::NodeSpec;
use crate::runner::HostExecutor;
use crate::task::{Task, TaskSet, TaskStats};

// ============================================================================
// Run control
// ============================================================================

/// Pause gate and cancellation signal shared by the whole run.
///
/// Cloning is cheap; all clones observe the same signals. `cancel` is
/// idempotent and safe to call from any thread.
#[derive(Clone)]
pub struct RunControl {
    cancel: CancellationToken,
    pause: Arc<watch::Sender<bool>>,
}

impl RunControl {
    /// Creates a control in the running (unpaused) state.
    pub fn new() -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            pause: Arc::new(pause),
        }
    }

    /// Requests a pause at the next task boundary.
    pub fn pause(&self) {
        self.pause.send_replace(true);
    }

    /// Releases a pause.
    pub fn resume(&self) {
        self.pause.send_replace(false);
    }

    /// Requests cooperative cancellation of the run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Returns true while the pause gate is closed.
    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// Token handed to the runner so in-flight playbooks can be stopped.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Blocks while paused. Returns immediately on cancellation.
    pub async fn wait_if_paused(&self) {
        let mut rx = self.pause.subscribe();
        loop {
            if self.cancel.is_cancelled() || !*rx.borrow_and_update() {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Global, immutable run parameters plus the control signals.
#[derive(Clone)]
pub struct RunContext {
    /// Work/log root from the configuration.
    pub data_dir: PathBuf,
    /// This run's timestamped directory under `data_dir/run/`.
    pub run_dir: PathBuf,
    /// Worker pool size.
    pub max_concurrent_nodes: usize,
    /// Check mode: probes run, playbooks run with no-op, nothing mutates.
    pub dry_run: bool,
    /// Pause/cancel signals.
    pub control: RunControl,
}

// ============================================================================
// Run report
// ============================================================================

/// Final per-node summary.
#[derive(Debug, Clone)]
pub struct HostSummary {
    /// Node name.
    pub host: String,
    /// Final task counts for this node.
    pub stats: TaskStats,
    /// True when the node's pipeline broke because the host was
    /// unreachable.
    pub unreachable: bool,
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Final task counts across all nodes.
    pub stats: TaskStats,
    /// Per-node summaries, in declaration order.
    pub hosts: Vec<HostSummary>,
    /// Final snapshot of every task, in declaration order.
    pub tasks: Vec<Task>,
    /// True when the run was cancelled.
    pub cancelled: bool,
}

impl RunReport {
    /// Maps the run outcome to the process exit code: 0 success, 2 every
    /// host unreachable, 3 task failures, 4 cancelled.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            4
        } else if self.stats.failed == 0 {
            0
        } else if !self.hosts.is_empty() && self.hosts.iter().all(|h| h.unreachable) {
            2
        } else {
            3
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

struct WorkerShared {
    ctx: RunContext,
    tasks: RwLock<TaskSet>,
    checkers: CheckerManager,
    installers: InstallerRegistry,
    executor: Arc<dyn HostExecutor>,
    bus: EventBus,
}

/// The deployment engine.
pub struct DeploymentEngine {
    shared: Arc<WorkerShared>,
    nodes: Vec<Arc<NodeSpec>>,
    semaphore: Arc<Semaphore>,
    workers: Mutex<Vec<(String, JoinHandle<bool>)>>,
    started: AtomicBool,
}

impl DeploymentEngine {
    /// Wires the engine together. Nothing runs until [`start`].
    ///
    /// [`start`]: DeploymentEngine::start
    pub fn new(
        ctx: RunContext,
        nodes: Vec<NodeSpec>,
        tasks: TaskSet,
        checkers: CheckerManager,
        installers: InstallerRegistry,
        executor: Arc<dyn HostExecutor>,
        bus: EventBus,
    ) -> Self {
        let permits = ctx.max_concurrent_nodes.max(1);
        Self {
            shared: Arc::new(WorkerShared {
                ctx,
                tasks: RwLock::new(tasks),
                checkers,
                installers,
                executor,
                bus,
            }),
            nodes: nodes.into_iter().map(Arc::new).collect(),
            semaphore: Arc::new(Semaphore::new(permits)),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Submits one worker per node and returns immediately.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let total_tasks = self.shared.tasks.read().all().len();
        self.shared
            .bus
            .publish(None, None, EventKind::RunStart { total_tasks });
        info!(nodes = self.nodes.len(), tasks = total_tasks, "deployment started");

        let mut workers = self.workers.lock();
        for node in &self.nodes {
            let shared = Arc::clone(&self.shared);
            let semaphore = Arc::clone(&self.semaphore);
            let node = Arc::clone(node);
            let name = node.name.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore open");
                run_node_pipeline(shared, node).await
            });
            workers.push((name, handle));
        }
    }

    /// Blocks until every worker finished, then publishes `run_complete`
    /// and returns the report.
    pub async fn wait(&self) -> RunReport {
        let workers = std::mem::take(&mut *self.workers.lock());
        let mut unreachable: HashMap<String, bool> = HashMap::new();

        for (host, handle) in workers {
            match handle.await {
                Ok(host_unreachable) => {
                    unreachable.insert(host, host_unreachable);
                }
                Err(join_err) => {
                    // The per-task panic guard makes this unlikely; settle
                    // any leftover tasks so the run still converges.
                    error!(host = %host, error = %join_err, "node worker aborted");
                    self.settle_aborted_host(&host, &join_err.to_string());
                    unreachable.insert(host, false);
                }
            }
        }

        let stats = self.shared.tasks.read().stats();
        self.shared
            .bus
            .publish(None, None, EventKind::RunComplete { stats });
        info!(
            completed = stats.completed,
            failed = stats.failed,
            skipped = stats.skipped,
            "deployment finished"
        );

        let hosts = self
            .nodes
            .iter()
            .map(|node| HostSummary {
                host: node.name.clone(),
                stats: self.shared.tasks.read().stats_for_node(&node.name),
                unreachable: unreachable.get(&node.name).copied().unwrap_or(false),
            })
            .collect();

        RunReport {
            stats,
            hosts,
            tasks: self.shared.tasks.read().all(),
            cancelled: self.shared.ctx.control.is_cancelled(),
        }
    }

    /// Requests a pause at the next task boundary on every node.
    pub fn pause(&self) {
        info!("pause requested");
        self.shared.ctx.control.pause();
    }

    /// Releases a pause.
    pub fn resume(&self) {
        info!("resume requested");
        self.shared.ctx.control.resume();
    }

    /// Requests cooperative cancellation. Idempotent.
    pub fn cancel(&self) {
        warn!("cancellation requested");
        self.shared.ctx.control.cancel();
    }

    /// Snapshot of the current task statistics.
    pub fn stats(&self) -> TaskStats {
        self.shared.tasks.read().stats()
    }

    fn settle_aborted_host(&self, host: &str, message: &str) {
        let ids = self.shared.tasks.read().ids_for_node(host);
        let mut first = true;
        for id in ids {
            let status = self.shared.tasks.read().get(&id).map(|t| t.status);
            if status.is_some_and(|s| !s.is_terminal()) {
                if first {
                    fail_task(&self.shared, host, &id, format!("internal error: {}", message));
                    first = false;
                } else {
                    skip_task(&self.shared, host, &id, "aborted after internal error");
                }
            }
        }
    }
}

// ============================================================================
// Node pipeline
// ============================================================================

enum TaskOutcome {
    Completed,
    Skipped,
    Cancelled,
    Failed { unreachable: bool },
}

/// Runs one node's tasks serially. Returns true if the node was
/// unreachable.
async fn run_node_pipeline(shared: Arc<WorkerShared>, node: Arc<NodeSpec>) -> bool {
    let ids = shared.tasks.read().ids_for_node(&node.name);
    shared
        .bus
        .publish(Some(&node.name), None, EventKind::HostStart);
    info!(host = %node.name, tasks = ids.len(), "node pipeline started");

    let mut unreachable = false;
    let mut abort_reason: Option<&'static str> = None;

    for id in &ids {
        if let Some(reason) = abort_reason {
            skip_task(&shared, &node.name, id, reason);
            continue;
        }

        shared.ctx.control.wait_if_paused().await;
        if shared.ctx.control.is_cancelled() {
            skip_task(&shared, &node.name, id, "cancelled");
            continue;
        }

        let outcome = AssertUnwindSafe(run_task(&shared, &node, id))
            .catch_unwind()
            .await;
        match outcome {
            Ok(TaskOutcome::Completed) | Ok(TaskOutcome::Skipped) => {}
            Ok(TaskOutcome::Cancelled) => {
                // Remaining tasks are skipped by the cancellation branch
                // on the next iteration.
            }
            Ok(TaskOutcome::Failed { unreachable: u }) => {
                unreachable |= u;
                abort_reason = Some("previous task failed");
            }
            Err(panic) => {
                let message = panic_message(&panic);
                error!(host = %node.name, task = %id, "worker panicked: {}", message);
                fail_task(&shared, &node.name, id, format!("internal error: {}", message));
                abort_reason = Some("aborted after internal error");
            }
        }
    }

    let stats = shared.tasks.read().stats_for_node(&node.name);
    shared
        .bus
        .publish(Some(&node.name), None, EventKind::HostComplete { stats });
    info!(host = %node.name, "node pipeline finished");
    unreachable
}

/// Drives one task through checks and the installer lifecycle.
async fn run_task(shared: &Arc<WorkerShared>, node: &NodeSpec, id: &str) -> TaskOutcome {
    let software_name = {
        let mut tasks = shared.tasks.write();
        let task = match tasks.get_mut(id) {
            Some(task) => task,
            None => return TaskOutcome::Skipped,
        };
        task.start();
        shared.bus.publish(
            Some(&node.name),
            Some(id),
            EventKind::TaskStart {
                software: task.software.clone(),
                version: task.version.clone(),
            },
        );
        task.software.clone()
    };

    let Some(software) = node.software(&software_name) else {
        fail_task(
            shared,
            &node.name,
            id,
            format!("internal error: no spec for software '{}'", software_name),
        );
        return TaskOutcome::Failed { unreachable: false };
    };

    // Generic pre-install checks gate everything downstream.
    let check_ctx = CheckContext {
        node,
        software: Some(software),
        executor: shared.executor.as_ref(),
    };
    let results = shared.checkers.run_all(&check_ctx).await;
    for result in &results {
        shared.bus.publish(
            Some(&node.name),
            Some(id),
            EventKind::CheckOutcome {
                result: result.clone(),
            },
        );
    }
    if CheckerManager::has_errors(&results) {
        let unreachable = results
            .iter()
            .any(|r| r.is_blocking() && r.check_name == "connectivity");
        let summary = CheckerManager::error_summary(&results);
        let reason = if unreachable {
            format!("unreachable: {}", summary)
        } else {
            format!("pre-install checks failed: {}", summary)
        };
        fail_task(shared, &node.name, id, reason);
        return TaskOutcome::Failed { unreachable };
    }

    if shared.ctx.control.is_cancelled() {
        skip_task(shared, &node.name, id, "cancelled");
        return TaskOutcome::Cancelled;
    }

    let installer = match shared.installers.resolve(&software.name) {
        Ok(installer) => installer,
        Err(err) => {
            fail_task(shared, &node.name, id, err.to_string());
            return TaskOutcome::Failed { unreachable: false };
        }
    };

    let reporter = TaskReporter::new(shared.bus.clone(), &node.name, id);
    let install_ctx = InstallContext {
        node,
        software,
        executor: shared.executor.as_ref(),
        dry_run: shared.ctx.dry_run,
        cancel: shared.ctx.control.cancel_token(),
        reporter,
    };

    match installer.pre_check(&install_ctx).await {
        Ok(PreCheckVerdict::Proceed) => {}
        Ok(PreCheckVerdict::Skip(reason)) => {
            skip_task(shared, &node.name, id, reason);
            return TaskOutcome::Skipped;
        }
        Err(err) => return fail_with(shared, &node.name, id, err),
    }

    if shared.ctx.control.is_cancelled() {
        skip_task(shared, &node.name, id, "cancelled");
        return TaskOutcome::Cancelled;
    }

    if let Err(err) = installer.install(&install_ctx).await {
        return fail_with(shared, &node.name, id, err);
    }
    if shared.ctx.control.is_cancelled() {
        // Past the install step; the task did real work that was not
        // verified, so it cannot be called skipped.
        fail_task(shared, &node.name, id, "cancelled");
        return TaskOutcome::Cancelled;
    }
    if let Err(err) = installer.post_config(&install_ctx).await {
        return fail_with(shared, &node.name, id, err);
    }
    if let Err(err) = installer.verify(&install_ctx).await {
        return fail_with(shared, &node.name, id, err);
    }

    {
        let mut tasks = shared.tasks.write();
        if let Some(task) = tasks.get_mut(id) {
            task.complete();
        }
    }
    shared
        .bus
        .publish(Some(&node.name), Some(id), EventKind::TaskComplete);
    TaskOutcome::Completed
}

fn fail_with(shared: &Arc<WorkerShared>, host: &str, id: &str, err: Error) -> TaskOutcome {
    match err {
        Error::Cancelled => {
            fail_task(shared, host, id, "cancelled");
            TaskOutcome::Cancelled
        }
        Error::Timeout { ref what, seconds } => {
            fail_task(shared, host, id, format!("timeout: {} after {}s", what, seconds));
            TaskOutcome::Failed { unreachable: false }
        }
        Error::Unreachable { .. } => {
            fail_task(shared, host, id, format!("unreachable: {}", err));
            TaskOutcome::Failed { unreachable: true }
        }
        other => {
            fail_task(shared, host, id, other.to_string());
            TaskOutcome::Failed { unreachable: false }
        }
    }
}

fn fail_task(shared: &Arc<WorkerShared>, host: &str, id: &str, reason: impl Into<String>) {
    let reason = reason.into();
    {
        let mut tasks = shared.tasks.write();
        if let Some(task) = tasks.get_mut(id) {
            task.fail(reason.clone());
        }
    }
    shared
        .bus
        .publish(Some(host), Some(id), EventKind::TaskFailed { error: reason });
}

fn skip_task(shared: &Arc<WorkerShared>, host: &str, id: &str, reason: impl Into<String>) {
    let reason = reason.into();
    {
        let mut tasks = shared.tasks.write();
        if let Some(task) = tasks.get_mut(id) {
            task.skip(reason.clone());
        }
    }
    shared
        .bus
        .publish(Some(host), Some(id), EventKind::TaskSkipped { reason });
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
