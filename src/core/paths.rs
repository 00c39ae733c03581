//! Application directory resolution: config, data, session logs, diff reports.

use std::env;
use std::path::PathBuf;

/// Directories used by the helper for config and generated files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    /// Settings file (`config.toml`).
    pub config_file: PathBuf,
    /// Per-upgrade-session console logs.
    pub logs_dir: PathBuf,
    /// Snapshot difference reports.
    pub diffs_dir: PathBuf,
    /// Append-only activity log.
    pub activity_log: PathBuf,
}

impl Default for AppPaths {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!("[BUH-PATHS] WARNING: HOME not set, falling back to /tmp for data paths");
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("buh").join("config.toml");
        let data = home_dir.join(".local").join("share").join("buh");
        Self {
            config_file: cfg,
            logs_dir: data.join("logs"),
            diffs_dir: data.join("diffs"),
            activity_log: data.join("activity.jsonl"),
        }
    }
}

impl AppPaths {
    /// Paths rooted at an explicit data directory (tests, portable installs).
    #[must_use]
    pub fn rooted_at(data_dir: PathBuf) -> Self {
        Self {
            config_file: data_dir.join("config.toml"),
            logs_dir: data_dir.join("logs"),
            diffs_dir: data_dir.join("diffs"),
            activity_log: data_dir.join("activity.jsonl"),
        }
    }
}
