//! Channel-based activity logger writing append-only JSONL.
//!
//! Architecture: a dedicated logger thread owns the file writer. All other
//! threads send entries through a bounded crossbeam channel with `try_send`,
//! so snapshot and upgrade work is never blocked by logging back-pressure; a
//! full channel drops the entry and bumps a counter. Degradation chain:
//! primary file, then stderr, then silent discard.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use chrono::{SecondsFormat, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};

const CHANNEL_CAPACITY: usize = 256;

/// Severity level for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Log event types matching the snapshot/upgrade activity model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SnapshotCreated,
    SnapshotDeleted,
    SessionLogDeleted,
    UpgradeStarted,
    StageFailed,
    UpgradeFinished,
    SystemUpToDate,
    ConsolidationChecked,
    ConsolidationResolved,
    UpdateCheck,
    FstabPatched,
    Error,
}

/// A single JSONL entry, one self-contained object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// ISO 8601 UTC timestamp.
    pub ts: String,
    pub event: EventKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    /// New entry stamped with the current UTC time.
    #[must_use]
    pub fn new(event: EventKind, severity: Severity) -> Self {
        Self {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            event,
            severity,
            path: None,
            error_code: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

enum LoggerMessage {
    Entry(LogEntry),
    Shutdown,
}

/// Thread-safe, cheaply-cloneable handle for sending log entries.
///
/// A disabled handle (no logger thread) swallows every entry, which keeps
/// tests and library consumers free of logging setup.
#[derive(Clone)]
pub struct ActivityHandle {
    tx: Option<Sender<LoggerMessage>>,
    dropped: Arc<AtomicU64>,
}

impl ActivityHandle {
    /// Handle that discards everything.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Send an entry. Non-blocking; a full channel drops it.
    pub fn record(&self, entry: LogEntry) {
        if let Some(tx) = &self.tx
            && let Err(TrySendError::Full(_)) = tx.try_send(LoggerMessage::Entry(entry))
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn info(&self, event: EventKind, details: impl Into<String>) {
        self.record(LogEntry::new(event, Severity::Info).with_details(details));
    }

    pub fn warn(&self, event: EventKind, details: impl Into<String>) {
        self.record(LogEntry::new(event, Severity::Warning).with_details(details));
    }

    /// Error entry carrying a stable `[BUH-NNNN]` code.
    pub fn error(&self, code: &str, details: impl Into<String>) {
        let mut entry = LogEntry::new(EventKind::Error, Severity::Error).with_details(details);
        entry.error_code = Some(code.to_string());
        self.record(entry);
    }

    /// Entries dropped because the channel was full.
    #[must_use]
    pub fn dropped_entries(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit.
    pub fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(LoggerMessage::Shutdown);
        }
    }
}

/// Configuration for the activity log writer.
#[derive(Debug, Clone)]
pub struct ActivityLogConfig {
    pub path: PathBuf,
    /// Maximum file size before rotation (bytes).
    pub max_size_bytes: u64,
    /// Number of rotated files to keep.
    pub max_rotated_files: u32,
}

impl ActivityLogConfig {
    #[must_use]
    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            max_size_bytes: 10 * 1024 * 1024,
            max_rotated_files: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Normal,
    Stderr,
    Discard,
}

struct JsonlWriter {
    config: ActivityLogConfig,
    writer: Option<BufWriter<File>>,
    state: WriterState,
    bytes_written: u64,
}

impl JsonlWriter {
    fn open(config: ActivityLogConfig) -> Self {
        let mut writer = Self {
            config,
            writer: None,
            state: WriterState::Discard,
            bytes_written: 0,
        };
        writer.try_open_primary();
        writer
    }

    fn try_open_primary(&mut self) {
        if let Some(parent) = self.config.path.parent()
            && fs::create_dir_all(parent).is_err()
        {
            self.state = WriterState::Stderr;
            return;
        }
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.path)
        {
            Ok(file) => {
                self.bytes_written = file.metadata().map_or(0, |meta| meta.len());
                self.writer = Some(BufWriter::new(file));
                self.state = WriterState::Normal;
            }
            Err(_) => self.state = WriterState::Stderr,
        }
    }

    fn write_entry(&mut self, entry: &LogEntry) {
        let Ok(mut line) = serde_json::to_string(entry) else {
            return;
        };
        line.push('\n');

        if self.state == WriterState::Normal && self.bytes_written >= self.config.max_size_bytes {
            self.rotate();
        }

        match self.state {
            WriterState::Normal => {
                if let Some(writer) = &mut self.writer
                    && writer.write_all(line.as_bytes()).is_ok()
                    && writer.flush().is_ok()
                {
                    self.bytes_written += line.len() as u64;
                } else {
                    self.writer = None;
                    self.state = WriterState::Stderr;
                    eprintln!("[BUH-LOG] {}", line.trim_end());
                }
            }
            WriterState::Stderr => eprintln!("[BUH-LOG] {}", line.trim_end()),
            WriterState::Discard => {}
        }
    }

    fn rotate(&mut self) {
        self.writer = None;
        for index in (1..self.config.max_rotated_files).rev() {
            let from = self.config.path.with_extension(format!("jsonl.{index}"));
            let to = self.config.path.with_extension(format!("jsonl.{}", index + 1));
            let _ = fs::rename(from, to);
        }
        let _ = fs::rename(
            &self.config.path,
            self.config.path.with_extension("jsonl.1"),
        );
        self.try_open_primary();
    }
}

/// Spawn the logger thread; returns the sending handle and the join handle.
pub fn spawn_logger(
    config: ActivityLogConfig,
) -> crate::core::errors::Result<(ActivityHandle, thread::JoinHandle<()>)> {
    let (tx, rx): (Sender<LoggerMessage>, Receiver<LoggerMessage>) = bounded(CHANNEL_CAPACITY);
    let join = thread::Builder::new()
        .name("buh-activity-log".to_string())
        .spawn(move || {
            let mut writer = JsonlWriter::open(config);
            while let Ok(message) = rx.recv() {
                match message {
                    LoggerMessage::Entry(entry) => writer.write_entry(&entry),
                    LoggerMessage::Shutdown => break,
                }
            }
        })
        .map_err(|source| crate::core::errors::BuhError::Io {
            path: PathBuf::from("buh-activity-log"),
            source,
        })?;
    Ok((
        ActivityHandle {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
        },
        join,
    ))
}

#[cfg(test)]
mod tests {
    use super::{ActivityHandle, ActivityLogConfig, EventKind, LogEntry, Severity, spawn_logger};
    use std::fs;

    #[test]
    fn entries_are_written_as_one_json_object_per_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("activity.jsonl");
        let (handle, join) =
            spawn_logger(ActivityLogConfig::at(path.clone())).expect("spawn logger");

        handle.info(EventKind::SnapshotCreated, "root-20260807-0");
        handle.error("BUH-2102", "no fstab entry matched");
        handle.shutdown();
        join.join().expect("logger thread joins");

        let raw = fs::read_to_string(&path).expect("log file exists");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: LogEntry = serde_json::from_str(lines[0]).expect("valid JSON");
        assert_eq!(first.event, EventKind::SnapshotCreated);
        assert_eq!(first.severity, Severity::Info);

        let second: LogEntry = serde_json::from_str(lines[1]).expect("valid JSON");
        assert_eq!(second.error_code.as_deref(), Some("BUH-2102"));
        assert_eq!(handle.dropped_entries(), 0);
    }

    #[test]
    fn rotation_keeps_the_primary_file_small() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("activity.jsonl");
        let config = ActivityLogConfig {
            path: path.clone(),
            max_size_bytes: 200,
            max_rotated_files: 2,
        };
        let (handle, join) = spawn_logger(config).expect("spawn logger");
        for index in 0..20 {
            handle.info(EventKind::UpdateCheck, format!("attempt {index}"));
        }
        handle.shutdown();
        join.join().expect("logger thread joins");

        assert!(path.exists());
        assert!(
            path.with_extension("jsonl.1").exists(),
            "rotation should have produced a .1 file"
        );
        let primary_len = fs::metadata(&path).expect("metadata").len();
        assert!(primary_len < 400, "primary stayed small, got {primary_len}");
    }

    #[test]
    fn disabled_handle_swallows_entries() {
        let handle = ActivityHandle::disabled();
        handle.info(EventKind::UpgradeStarted, "noop");
        handle.shutdown();
        assert_eq!(handle.dropped_entries(), 0);
    }
}
