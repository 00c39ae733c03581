//! Per-upgrade session logs.
//!
//! One text file per saved upgrade session, named `{date}-{ordinal}.txt` after
//! the trailing suffix of the snapshots taken in that session, and deleted in
//! lockstep with them.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use parking_lot::Mutex;

use crate::core::errors::{BuhError, Result};

/// Session-log file name for a snapshot: its trailing `{date}-{ordinal}`
/// segments plus `.txt`. `None` when the name carries no such suffix.
#[must_use]
pub fn log_name_for_snapshot(snapshot_file_name: &str) -> Option<String> {
    let mut segments = snapshot_file_name.rsplit('-');
    let ordinal = segments.next()?;
    let date = segments.next()?;
    if ordinal.is_empty() || date.is_empty() {
        return None;
    }
    Some(format!("{date}-{ordinal}.txt"))
}

/// Delete the session log paired with a deleted snapshot.
///
/// Returns whether a log existed. A missing log is expected (the user may not
/// save logs) and is not an error.
pub fn delete_log_for_snapshot(logs_dir: &Path, snapshot_file_name: &str) -> Result<bool> {
    let Some(name) = log_name_for_snapshot(snapshot_file_name) else {
        return Ok(false);
    };
    let path = logs_dir.join(name);
    match fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
        Err(error) => Err(BuhError::io(path, error)),
    }
}

/// Appendable console log for one upgrade session.
#[derive(Debug)]
pub struct SessionLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl SessionLog {
    /// Create today's session log, picking the next free ordinal.
    pub fn create_for_today(logs_dir: &Path) -> Result<Self> {
        let stamp = Local::now().format("%Y%m%d").to_string();
        Self::create_with_stamp(logs_dir, &stamp)
    }

    /// Create `{stamp}-{ordinal}.txt`, where the ordinal is the count of
    /// existing same-stamp logs, the same numbering snapshots use.
    pub fn create_with_stamp(logs_dir: &Path, stamp: &str) -> Result<Self> {
        fs::create_dir_all(logs_dir).map_err(|source| BuhError::io(logs_dir, source))?;
        let ordinal = fs::read_dir(logs_dir)
            .map_err(|source| BuhError::io(logs_dir, source))?
            .filter_map(std::result::Result::ok)
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(&format!("{stamp}-"))
            })
            .count();
        let path = logs_dir.join(format!("{stamp}-{ordinal}.txt"));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|source| BuhError::io(&path, source))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one console line. Best-effort: a failing log write must never
    /// interrupt the upgrade it documents.
    pub fn append_line(&self, line: &str) {
        let mut file = self.file.lock();
        let _ = writeln!(file, "{line}");
    }
}
