//! Deployment task catalog.
//!
//! One [`Task`] exists per (node, software) pair, created up front from the
//! configuration. A task's status moves monotonically from `Pending`
//! through `Running` to exactly one terminal state. Only the worker that
//! owns the task's node mutates it; everyone else observes task state
//! through published events.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::config::DeployConfig;

/// Execution status of a deployment task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, not yet picked up by its node worker.
    Pending,
    /// Currently being checked or installed.
    Running,
    /// Installed and verified.
    Completed,
    /// Check, install or verify failed.
    Failed,
    /// Not executed (pre-check skip, fail-fast, or cancellation).
    Skipped,
}

impl TaskStatus {
    /// Returns true for `Completed`, `Failed` and `Skipped`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// One unit of scheduling: install one software package on one node.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    /// `{node}_{software}_{version}`
    pub id: String,
    /// Owning node name.
    pub node: String,
    /// Software name.
    pub software: String,
    /// Requested version.
    pub version: String,
    /// Current status.
    pub status: TaskStatus,
    /// Progress percentage, 0..=100. Always 100 once completed.
    pub progress: u8,
    /// Set when the task enters `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the task reaches a terminal state.
    pub ended_at: Option<DateTime<Utc>>,
    /// Failure or skip reason.
    pub error: Option<String>,
}

impl Task {
    /// Creates a pending task for a (node, software, version) triple.
    pub fn new(node: &str, software: &str, version: &str) -> Self {
        Self {
            id: format!("{}_{}_{}", node, software, version),
            node: node.to_string(),
            software: software.to_string(),
            version: version.to_string(),
            status: TaskStatus::Pending,
            progress: 0,
            started_at: None,
            ended_at: None,
            error: None,
        }
    }

    /// Marks the task running. No-op if the task already left `Pending`.
    pub fn start(&mut self) {
        if self.status == TaskStatus::Pending {
            self.status = TaskStatus::Running;
            self.started_at = Some(Utc::now());
            self.progress = 0;
        }
    }

    /// Marks the task completed.
    pub fn complete(&mut self) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Completed;
            self.progress = 100;
            self.ended_at = Some(Utc::now());
        }
    }

    /// Marks the task failed with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Failed;
            self.ended_at = Some(Utc::now());
            self.error = Some(reason.into());
        }
    }

    /// Marks the task skipped with a reason.
    pub fn skip(&mut self, reason: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = TaskStatus::Skipped;
            self.ended_at = Some(Utc::now());
            self.error = Some(reason.into());
        }
    }

    /// Updates progress, clamped to 0..=100.
    pub fn set_progress(&mut self, percent: u8) {
        if self.status == TaskStatus::Running {
            self.progress = percent.min(100);
        }
    }

    /// Wall-clock duration, when the task has started.
    pub fn duration(&self) -> Option<chrono::Duration> {
        let start = self.started_at?;
        Some(self.ended_at.unwrap_or_else(Utc::now) - start)
    }
}

/// Aggregate task counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    /// Total number of tasks.
    pub total: usize,
    /// Tasks not yet started.
    pub pending: usize,
    /// Tasks currently running.
    pub running: usize,
    /// Tasks completed successfully.
    pub completed: usize,
    /// Tasks that failed.
    pub failed: usize,
    /// Tasks that were skipped.
    pub skipped: usize,
}

impl TaskStats {
    /// Returns true if every task completed successfully.
    pub fn all_completed(&self) -> bool {
        self.completed == self.total
    }
}

/// The catalog of all tasks for one run, in declaration order.
#[derive(Debug, Default)]
pub struct TaskSet {
    tasks: IndexMap<String, Task>,
    node_order: IndexMap<String, Vec<String>>,
}

impl TaskSet {
    /// Builds the catalog from a validated configuration: one task per
    /// (node, software) pair, ordered as declared.
    pub fn build(config: &DeployConfig) -> Self {
        let mut set = Self::default();
        for node in &config.nodes {
            let mut ids = Vec::new();
            for software in &node.install {
                let task = Task::new(&node.name, &software.name, &software.version);
                ids.push(task.id.clone());
                set.tasks.insert(task.id.clone(), task);
            }
            set.node_order.insert(node.name.clone(), ids);
        }
        set
    }

    /// Looks up a task by id.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Mutable lookup, used only by the node worker that owns the task.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Task ids for one node, in declaration order.
    pub fn ids_for_node(&self, node: &str) -> Vec<String> {
        self.node_order.get(node).cloned().unwrap_or_default()
    }

    /// Snapshot of one node's tasks, in declaration order.
    pub fn by_node(&self, node: &str) -> Vec<Task> {
        self.ids_for_node(node)
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect()
    }

    /// Snapshot of every task, in declaration order.
    pub fn all(&self) -> Vec<Task> {
        self.tasks.values().cloned().collect()
    }

    /// Node names, in declaration order.
    pub fn nodes(&self) -> Vec<String> {
        self.node_order.keys().cloned().collect()
    }

    /// Aggregate counts by status.
    pub fn stats(&self) -> TaskStats {
        let mut stats = TaskStats {
            total: self.tasks.len(),
            ..TaskStats::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Skipped => stats.skipped += 1,
            }
        }
        stats
    }

    /// Aggregate counts for a single node.
    pub fn stats_for_node(&self, node: &str) -> TaskStats {
        let mut stats = TaskStats::default();
        for task in self.by_node(node) {
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Skipped => stats.skipped += 1,
            }
        }
        stats
    }

    /// Mean progress across all tasks, 0..=100.
    pub fn overall_progress(&self) -> u8 {
        if self.tasks.is_empty() {
            return 0;
        }
        let sum: u32 = self.tasks.values().map(|t| t.progress as u32).sum();
        (sum / self.tasks.len() as u32) as u8
    }
}
