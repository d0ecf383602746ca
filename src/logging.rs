//! Logging: tracing setup and the file sinks fed from the event bus.
//!
//! Two default subscribers are attached to every run: the main sink
//! (`<log.dir>/deploy.log`, all events) and one per-node sink
//! (`<log.dir>/<node>.log`, that node's events only, plus a structured
//! `events.jsonl` journal under the run directory). The main sink reads
//! from the bus's lossless channel, so it records every event of the run
//! even when it falls behind a burst; per-node sinks use the bounded
//! subscription. Text sinks rotate at 10 MiB keeping 5 backups; the
//! journal is per-run and never rotated.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tokio::task::JoinHandle;
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogConfig, LogLevel};
use crate::event::{Event, EventBus, EventKind};

/// Rotation threshold for text sinks.
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
/// Number of rotated backups kept per sink.
pub const LOG_BACKUPS: usize = 5;

/// Initializes the tracing subscriber for diagnostic output.
///
/// `RUST_LOG` overrides the configured level.
pub fn init_tracing(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();
}

// ============================================================================
// Size-rotated log file
// ============================================================================

/// A log file that rotates at a byte threshold, keeping numbered backups
/// (`deploy.log.1` is the most recent).
pub struct RollingWriter {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    writer: BufWriter<File>,
    written: u64,
}

impl RollingWriter {
    /// Opens (appending) or creates the log file.
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path,
            max_bytes,
            backups,
            writer: BufWriter::new(file),
            written,
        })
    }

    /// Appends one line, rotating first when the threshold would be
    /// crossed.
    pub fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        let len = line.len() as u64 + 1;
        if self.written + len > self.max_bytes {
            self.rotate()?;
        }
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.written += len;
        Ok(())
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.writer.flush()?;

        let base = self.path.display().to_string();
        let backup = move |n: usize| PathBuf::from(format!("{}.{}", base, n));
        let _ = std::fs::remove_file(backup(self.backups));
        for n in (1..self.backups).rev() {
            let from = backup(n);
            if from.exists() {
                let _ = std::fs::rename(&from, backup(n + 1));
            }
        }
        let _ = std::fs::rename(&self.path, backup(1));

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.written = 0;
        Ok(())
    }
}

// ============================================================================
// Event formatting
// ============================================================================

/// Severity assigned to an event for level filtering.
pub fn event_level(event: &Event) -> LogLevel {
    match &event.kind {
        EventKind::TaskProgress { .. } => LogLevel::Debug,
        EventKind::TaskLog { level, .. } => *level,
        EventKind::TaskFailed { .. } => LogLevel::Error,
        EventKind::CheckOutcome { result } if !result.passed => match result.level {
            crate::check::CheckLevel::Error => LogLevel::Error,
            _ => LogLevel::Warn,
        },
        EventKind::Overflow { .. } => LogLevel::Warn,
        _ => LogLevel::Info,
    }
}

/// One-line human rendering of an event.
pub fn describe_event(event: &Event) -> String {
    match &event.kind {
        EventKind::RunStart { total_tasks } => {
            format!("run started: {} task(s)", total_tasks)
        }
        EventKind::HostStart => "node pipeline started".to_string(),
        EventKind::TaskStart { software, version } => {
            format!("task started: {} {}", software, version)
        }
        EventKind::CheckOutcome { result } => format!(
            "check {}: {} ({})",
            result.check_name,
            result.message,
            if result.passed { "passed" } else { "failed" }
        ),
        EventKind::TaskProgress { percent } => format!("progress: {}%", percent),
        EventKind::TaskLog { line, .. } => line.clone(),
        EventKind::TaskComplete => "task completed".to_string(),
        EventKind::TaskFailed { error } => format!("task failed: {}", error),
        EventKind::TaskSkipped { reason } => format!("task skipped: {}", reason),
        EventKind::HostComplete { stats } => format!(
            "node pipeline finished: {} completed, {} failed, {} skipped",
            stats.completed, stats.failed, stats.skipped
        ),
        EventKind::RunComplete { stats } => format!(
            "run finished: {} completed, {} failed, {} skipped of {}",
            stats.completed, stats.failed, stats.skipped, stats.total
        ),
        EventKind::Overflow { dropped } => {
            format!("subscriber lagged, {} event(s) dropped", dropped)
        }
    }
}

fn format_line(event: &Event) -> String {
    let scope = event.host.as_deref().unwrap_or("run");
    format!(
        "{} [{}] [{}] {}",
        event.timestamp.format("%Y-%m-%d %H:%M:%S"),
        event_level(event),
        scope,
        describe_event(event)
    )
}

// ============================================================================
// File sinks
// ============================================================================

/// Attaches the default file sinks for a run and returns their join
/// handles. The main sink drains until `run_complete`; each node sink
/// drains until its `host_complete`.
///
/// The main sink takes the lossless subscription: the complete event
/// record of the run lands in `deploy.log` no matter how far the writer
/// falls behind.
pub fn spawn_file_sinks(
    bus: &EventBus,
    config: &LogConfig,
    hosts: &[String],
    run_dir: &Path,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let mut main_stream = bus.subscribe_lossless();
    let main_path = config.dir.join("deploy.log");
    let min_level = config.level;
    handles.push(tokio::spawn(async move {
        let mut writer = match RollingWriter::open(&main_path, MAX_LOG_BYTES, LOG_BACKUPS) {
            Ok(writer) => writer,
            Err(err) => {
                warn!("cannot open {}: {}", main_path.display(), err);
                return;
            }
        };
        while let Some(event) = main_stream.recv().await {
            if event_level(&event) >= min_level {
                if let Err(err) = writer.write_line(&format_line(&event)) {
                    warn!("main log sink write failed: {}", err);
                }
            }
            if matches!(event.kind, EventKind::RunComplete { .. }) {
                break;
            }
        }
    }));

    for host in hosts {
        let mut stream = bus.subscribe_host(host);
        let text_path = config.dir.join(format!("{}.log", host));
        let journal_path = run_dir.join(host).join("events.jsonl");
        let min_level = config.level;
        let host = host.clone();
        handles.push(tokio::spawn(async move {
            let mut writer = match RollingWriter::open(&text_path, MAX_LOG_BYTES, LOG_BACKUPS) {
                Ok(writer) => writer,
                Err(err) => {
                    warn!(host = %host, "cannot open {}: {}", text_path.display(), err);
                    return;
                }
            };
            if let Some(parent) = journal_path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let mut journal = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&journal_path)
                .ok();

            while let Some(event) = stream.recv().await {
                if event_level(&event) >= min_level {
                    if let Err(err) = writer.write_line(&format_line(&event)) {
                        warn!(host = %host, "log sink write failed: {}", err);
                    }
                }
                if let (Some(file), Ok(json)) = (journal.as_mut(), serde_json::to_string(&event))
                {
                    let _ = writeln!(file, "{}", json);
                }
                if matches!(event.kind, EventKind::HostComplete { .. }) {
                    break;
                }
            }
        }));
    }

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_rolling_writer_rotates_and_keeps_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deploy.log");
        let mut writer = RollingWriter::open(&path, 64, 2).unwrap();
        for i in 0..20 {
            writer
                .write_line(&format!("line number {} padding padding", i))
                .unwrap();
        }
        assert!(path.exists());
        assert!(dir.path().join("deploy.log.1").exists());
        assert!(dir.path().join("deploy.log.2").exists());
        assert!(!dir.path().join("deploy.log.3").exists());
    }

    #[test]
    fn test_event_level_mapping() {
        let event = Event {
            timestamp: Utc::now(),
            host: Some("h1".to_string()),
            task_id: None,
            kind: EventKind::TaskFailed {
                error: "boom".to_string(),
            },
        };
        assert_eq!(event_level(&event), LogLevel::Error);

        let event = Event {
            timestamp: Utc::now(),
            host: None,
            task_id: None,
            kind: EventKind::TaskProgress { percent: 10 },
        };
        assert_eq!(event_level(&event), LogLevel::Debug);
    }

    #[test]
    fn test_format_line_contains_scope_and_message() {
        let event = Event {
            timestamp: Utc::now(),
            host: Some("db1".to_string()),
            task_id: Some("db1_java_11".to_string()),
            kind: EventKind::TaskStart {
                software: "java".to_string(),
                version: "11".to_string(),
            },
        };
        let line = format_line(&event);
        assert!(line.contains("[db1]"));
        assert!(line.contains("task started: java 11"));
    }
}
