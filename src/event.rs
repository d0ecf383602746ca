//! Event bus: the fan-out channel between the engine and its observers.
//!
//! Every lifecycle transition and log line is published as a structured
//! [`Event`]. Subscribers (file sinks, the console reporter, a UI) each
//! read at their own pace from a bounded ring; a subscriber that falls more
//! than the ring capacity behind loses its oldest events and receives a
//! single `overflow` marker carrying the dropped count. Publishing never
//! blocks the engine.
//!
//! The main file sink is special: it must record every event of the run,
//! so it subscribes through [`EventBus::subscribe_lossless`], which feeds
//! it from a dedicated unbounded queue instead of the shared ring. All
//! other subscribers get the bounded behavior.
//!
//! All events pass through the [`Redactor`] before fan-out, so no
//! subscriber can ever observe a configured credential.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::check::CheckResult;
use crate::config::{DeployConfig, LogLevel};
use crate::task::TaskStats;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// A structured engine event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Node this event belongs to, when host-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Task this event belongs to, when task-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Event payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event payload variants.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// The run started.
    RunStart {
        /// Number of tasks in the catalog.
        total_tasks: usize,
    },
    /// A node pipeline started.
    HostStart,
    /// A task entered `Running`.
    TaskStart {
        /// Software name.
        software: String,
        /// Requested version.
        version: String,
    },
    /// A pre-install check finished.
    CheckOutcome {
        /// The check result.
        result: CheckResult,
    },
    /// Install progress changed.
    TaskProgress {
        /// Progress percentage, 0..=100.
        percent: u8,
    },
    /// A log line attributed to a task.
    TaskLog {
        /// Severity.
        level: LogLevel,
        /// The line.
        line: String,
    },
    /// A task completed successfully.
    TaskComplete,
    /// A task failed.
    TaskFailed {
        /// Failure reason.
        error: String,
    },
    /// A task was skipped.
    TaskSkipped {
        /// Skip reason.
        reason: String,
    },
    /// A node pipeline finished.
    HostComplete {
        /// Final counts for this node's tasks.
        stats: TaskStats,
    },
    /// The run finished.
    RunComplete {
        /// Final counts across all tasks.
        stats: TaskStats,
    },
    /// The subscriber fell behind and lost events.
    Overflow {
        /// Number of events dropped for this subscriber.
        dropped: u64,
    },
}

impl EventKind {
    /// Returns true for task terminal events.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::TaskComplete | EventKind::TaskFailed { .. } | EventKind::TaskSkipped { .. }
        )
    }
}

// ============================================================================
// Redaction
// ============================================================================

static SENSITIVE_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(pass|password|token|secret|key)").unwrap());

/// Masks configured credentials and sensitive keys in event payloads.
#[derive(Debug, Default, Clone)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    /// Creates a redactor masking the given secret strings.
    pub fn new(secrets: Vec<String>) -> Self {
        let mut secrets: Vec<String> = secrets.into_iter().filter(|s| !s.is_empty()).collect();
        // Longest first so overlapping secrets mask fully.
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        Self { secrets }
    }

    /// Collects every password in the configuration.
    pub fn from_config(config: &DeployConfig) -> Self {
        let mut secrets = Vec::new();
        for node in &config.nodes {
            if let Some(p) = &node.owner.password {
                secrets.push(p.clone());
            }
            if let Some(p) = &node.super_user.password {
                secrets.push(p.clone());
            }
        }
        Self::new(secrets)
    }

    /// Replaces every known secret substring with `***`.
    pub fn mask_text(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), "***");
            }
        }
        out
    }

    /// Redacts a free-form JSON value in place: values under keys matching
    /// the sensitive-key pattern become `***`, and all strings are scanned
    /// for known secrets.
    pub fn redact_value(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, v) in map.iter_mut() {
                    if SENSITIVE_KEY.is_match(key) {
                        *v = Value::String("***".to_string());
                    } else {
                        self.redact_value(v);
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.redact_value(item);
                }
            }
            Value::String(s) => {
                *s = self.mask_text(s);
            }
            _ => {}
        }
    }

    fn redact_event(&self, event: &mut Event) {
        match &mut event.kind {
            EventKind::TaskFailed { error } => *error = self.mask_text(error),
            EventKind::TaskSkipped { reason } => *reason = self.mask_text(reason),
            EventKind::TaskLog { line, .. } => *line = self.mask_text(line),
            EventKind::CheckOutcome { result } => {
                result.message = self.mask_text(&result.message);
                for (key, value) in result.details.iter_mut() {
                    if SENSITIVE_KEY.is_match(key) {
                        *value = Value::String("***".to_string());
                    } else {
                        self.redact_value(value);
                    }
                }
            }
            _ => {}
        }
    }
}

// ============================================================================
// Bus
// ============================================================================

/// Multi-consumer event fan-out with bounded per-subscriber lag, plus a
/// lossless side-channel for the main file sink.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    lossless: Arc<Mutex<Vec<mpsc::UnboundedSender<Event>>>>,
    redactor: Arc<Redactor>,
}

impl EventBus {
    /// Creates a bus with the default subscriber capacity.
    pub fn new(redactor: Redactor) -> Self {
        Self::with_capacity(redactor, DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates a bus with an explicit subscriber capacity.
    pub fn with_capacity(redactor: Redactor, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            lossless: Arc::new(Mutex::new(Vec::new())),
            redactor: Arc::new(redactor),
        }
    }

    /// Subscribes to all events.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            host_filter: None,
        }
    }

    /// Subscribes to events for a single node only.
    pub fn subscribe_host(&self, host: impl Into<String>) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            host_filter: Some(host.into()),
        }
    }

    /// Subscribes through an unbounded queue that never drops an event.
    ///
    /// Reserved for consumers that must record the complete run, i.e. the
    /// main file sink; everything else should use [`subscribe`] and accept
    /// the bounded-lag behavior.
    ///
    /// [`subscribe`]: EventBus::subscribe
    pub fn subscribe_lossless(&self) -> LosslessEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lossless.lock().push(tx);
        LosslessEventStream { rx }
    }

    /// Redacts and publishes an event. Never blocks; an event with no live
    /// subscriber is silently discarded.
    pub fn publish(&self, host: Option<&str>, task_id: Option<&str>, kind: EventKind) {
        let mut event = Event {
            timestamp: Utc::now(),
            host: host.map(String::from),
            task_id: task_id.map(String::from),
            kind,
        };
        self.redactor.redact_event(&mut event);
        {
            // Lossless consumers first; a closed receiver deregisters here.
            let mut lossless = self.lossless.lock();
            lossless.retain(|tx| tx.send(event.clone()).is_ok());
        }
        let _ = self.tx.send(event);
    }

    /// The redactor shared with components that log raw runner output.
    pub fn redactor(&self) -> Arc<Redactor> {
        Arc::clone(&self.redactor)
    }
}

/// A lossless subscriber handle backed by an unbounded queue.
///
/// Dropping the stream deregisters the subscriber on the next publish.
pub struct LosslessEventStream {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl LosslessEventStream {
    /// Receives the next event, or `None` once the bus is dropped and the
    /// queue is drained. Never skips an event.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

/// A subscriber handle.
///
/// Dropping the stream deregisters the subscriber.
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
    host_filter: Option<String>,
}

impl EventStream {
    /// Receives the next event, or `None` once the bus is closed and
    /// drained. A lagging subscriber receives an `Overflow` marker with the
    /// aggregated dropped count before resuming the live stream.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    return Some(Event {
                        timestamp: Utc::now(),
                        host: self.host_filter.clone(),
                        task_id: None,
                        kind: EventKind::Overflow { dropped },
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive, used by polling consumers.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(dropped)) => {
                    return Some(Event {
                        timestamp: Utc::now(),
                        host: self.host_filter.clone(),
                        task_id: None,
                        kind: EventKind::Overflow { dropped },
                    });
                }
                Err(_) => return None,
            }
        }
    }

    fn matches(&self, event: &Event) -> bool {
        match (&self.host_filter, &event.host) {
            (None, _) => true,
            (Some(filter), Some(host)) => filter == host,
            (Some(_), None) => false,
        }
    }
}
