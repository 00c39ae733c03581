//! Managed subvolume: snapshot creation, retention pruning, and deletion.
//!
//! Snapshots are discovered, never indexed: every enumeration is a directory
//! listing of the destination, sorted by modification time and filtered by
//! the configured name prefix.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Local;

use crate::core::errors::{BuhError, Result};
use crate::core::settings::SubvolumeSpec;
use crate::logger::activity::{EventKind, LogEntry, Severity};
use crate::logger::session;
use crate::platform::runner::{CommandRunner, OutputSink};
use crate::services::Services;
use crate::snapshot::fstab;
use crate::snapshot::regenerate_grub_entries;
use crate::snapshot::retention::{KEEP_FOREVER, snapshots_to_delete};

const BTRFS_SNAPSHOT_RO: &[&str] = &["btrfs", "subvolume", "snapshot", "-r"];
pub(crate) const BTRFS_SNAPSHOT_RW: &[&str] = &["btrfs", "subvolume", "snapshot"];
pub(crate) const BTRFS_DELETE: &[&str] = &["btrfs", "subvolume", "delete"];
const BTRFS_SHOW: &[&str] = &["btrfs", "subvolume", "show"];

/// Marker `btrfs subvolume delete` prints for a subvolume with children.
const NOT_EMPTY_MARKER: &str = "Directory not empty";

fn ensure_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Real (non-symlinked) subvolume path backing `target`, taken from the
/// first line of `btrfs subvolume show`.
pub(crate) fn real_subvolume_path(runner: &dyn CommandRunner, target: &str) -> Result<String> {
    let argv: Vec<&str> = BTRFS_SHOW.iter().copied().chain([target]).collect();
    let outcome = runner.run(&argv, true, None)?;
    if !outcome.success() {
        return Err(BuhError::Runtime {
            details: format!(
                "btrfs subvolume show {target} exited with status {:?}",
                outcome.status
            ),
        });
    }
    let first = outcome
        .text()
        .lines()
        .next()
        .map(str::trim)
        .unwrap_or_default();
    if first.is_empty() {
        return Err(BuhError::Runtime {
            details: format!("btrfs subvolume show {target} produced no output"),
        });
    }
    Ok(first.to_string())
}

/// One BTRFS subvolume managed for periodic snapshotting.
#[derive(Clone)]
pub struct Subvolume {
    origin: String,
    destination: String,
    prefix: String,
    snapshots_to_keep: i64,
    date_override: Option<String>,
    services: Services,
}

impl Subvolume {
    /// Build from a decoded settings spec. Paths are normalized to end with
    /// `/` so snapshot names can be appended directly.
    #[must_use]
    pub fn new(spec: &SubvolumeSpec, services: Services) -> Self {
        Self {
            origin: ensure_trailing_slash(&spec.origin),
            destination: ensure_trailing_slash(&spec.destination),
            prefix: spec.prefix.clone(),
            snapshots_to_keep: spec.snapshots_to_keep,
            date_override: None,
            services,
        }
    }

    /// All subvolumes configured in the settings store.
    pub fn from_settings(services: &Services) -> Result<Vec<Self>> {
        let specs = services.settings.read().values().subvolume_specs()?;
        Ok(specs
            .iter()
            .map(|spec| Self::new(spec, services.clone()))
            .collect())
    }

    /// Pin the date stamp instead of using today's (simulated-date tests).
    #[must_use]
    pub fn with_date_stamp(mut self, stamp: &str) -> Self {
        self.date_override = Some(stamp.to_string());
        self
    }

    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub const fn snapshots_to_keep(&self) -> i64 {
        self.snapshots_to_keep
    }

    fn date_stamp(&self) -> String {
        self.date_override
            .clone()
            .unwrap_or_else(|| Local::now().format("%Y%m%d").to_string())
    }

    /// Create a snapshot named `{prefix}-{YYYYMMDD}-{ordinal}`.
    ///
    /// With grub-btrfs integration enabled and an `etc/fstab` present under
    /// the origin, the snapshot is created read-write and its fstab is
    /// rewired so the snapshot stays bootable; otherwise it is read-only.
    pub fn create_snapshot(&self, sink: Option<&dyn OutputSink>) -> Result<PathBuf> {
        let stamp = format!("{}-{}", self.prefix, self.date_stamp());
        let ordinal = self.count_entries_containing(&stamp)?;
        let snapshot_path = format!("{}{stamp}-{ordinal}", self.destination);

        let grub_enabled = self.services.settings.read().values().grub_btrfs_enabled();
        let fstab_file = Path::new(&self.origin).join("etc/fstab");
        if grub_enabled && fstab_file.is_file() {
            self.create_bootable_snapshot(&snapshot_path, sink)?;
        } else {
            let argv: Vec<&str> = BTRFS_SNAPSHOT_RO
                .iter()
                .copied()
                .chain([self.origin.as_str(), snapshot_path.as_str()])
                .collect();
            let outcome = self.services.runner.run(&argv, true, sink)?;
            if !outcome.success() {
                return Err(BuhError::Runtime {
                    details: format!(
                        "snapshot of {} exited with status {:?}",
                        self.origin, outcome.status
                    ),
                });
            }
        }

        self.services.log.record(
            LogEntry::new(EventKind::SnapshotCreated, Severity::Info).with_path(snapshot_path.as_str()),
        );
        Ok(PathBuf::from(snapshot_path))
    }

    /// Read-write snapshot whose fstab is patched to mount itself.
    ///
    /// Resolution or patch failures leave the read-write snapshot in place
    /// without rolling it back; the partial state is logged for the user.
    fn create_bootable_snapshot(
        &self,
        snapshot_path: &str,
        sink: Option<&dyn OutputSink>,
    ) -> Result<()> {
        let original_real = match real_subvolume_path(self.services.runner.as_ref(), "/") {
            Ok(path) => Some(path),
            Err(error) => {
                self.services.log.error(
                    error.code(),
                    format!("cannot resolve the subvolume mounted as /: {error}"),
                );
                None
            }
        };

        let argv: Vec<&str> = BTRFS_SNAPSHOT_RW
            .iter()
            .copied()
            .chain([self.origin.as_str(), snapshot_path])
            .collect();
        let outcome = self.services.runner.run(&argv, true, sink)?;
        if !outcome.success() {
            return Err(BuhError::Runtime {
                details: format!(
                    "snapshot of {} exited with status {:?}",
                    self.origin, outcome.status
                ),
            });
        }

        let Some(original_real) = original_real else {
            return Ok(());
        };
        let snapshot_real = match real_subvolume_path(self.services.runner.as_ref(), snapshot_path)
        {
            Ok(path) => path,
            Err(error) => {
                self.services.log.error(
                    error.code(),
                    format!("cannot resolve the snapshot just created: {error}"),
                );
                return Ok(());
            }
        };

        match fstab::patch_snapshot_fstab(
            self.services.runner.as_ref(),
            Path::new(snapshot_path),
            &original_real,
            &snapshot_real,
            sink,
        ) {
            Ok(()) => {
                self.services.log.info(
                    EventKind::FstabPatched,
                    format!("{snapshot_path} now mounts {snapshot_real}"),
                );
                if let Err(error) = self
                    .services
                    .settings
                    .write()
                    .set_path_to_consolidate(&original_real)
                {
                    self.services.log.error(
                        error.code(),
                        format!("could not record the consolidation path: {error}"),
                    );
                }
                if let Err(error) = regenerate_grub_entries(self.services.runner.as_ref(), sink) {
                    self.services
                        .log
                        .error(error.code(), format!("GRUB regeneration failed: {error}"));
                }
            }
            Err(error) => {
                self.services.log.error(error.code(), error.to_string());
            }
        }
        Ok(())
    }

    /// Delete aged-out snapshots down to the retention count, removing each
    /// one's session log in lockstep. Returns the deleted paths.
    pub fn delete_snapshots(&self, sink: Option<&dyn OutputSink>) -> Result<Vec<PathBuf>> {
        if self.snapshots_to_keep == KEEP_FOREVER {
            return Ok(Vec::new());
        }

        let snapshots = self.list_snapshots()?;
        let surplus = snapshots_to_delete(snapshots.len(), self.snapshots_to_keep);
        let mut deleted = Vec::with_capacity(surplus);

        for snapshot in &snapshots[..surplus] {
            let path_str = snapshot.to_string_lossy().into_owned();
            let argv: Vec<&str> = BTRFS_DELETE
                .iter()
                .copied()
                .chain([path_str.as_str()])
                .collect();
            let outcome = self.services.runner.run(&argv, true, sink)?;
            if !outcome.success() {
                self.services.log.error(
                    "BUH-3900",
                    format!("deleting {path_str} exited with status {:?}", outcome.status),
                );
                continue;
            }
            self.services.log.record(
                LogEntry::new(EventKind::SnapshotDeleted, Severity::Info).with_path(path_str.as_str()),
            );

            if let Some(name) = snapshot.file_name() {
                let name = name.to_string_lossy();
                match session::delete_log_for_snapshot(&self.services.paths.logs_dir, &name) {
                    Ok(true) => self
                        .services
                        .log
                        .info(EventKind::SessionLogDeleted, name.into_owned()),
                    Ok(false) => self.services.log.info(
                        EventKind::SessionLogDeleted,
                        format!("no session log for {name}, skipping"),
                    ),
                    Err(error) => self.services.log.error(error.code(), error.to_string()),
                }
            }
            deleted.push(snapshot.clone());
        }

        if self.services.settings.read().values().grub_btrfs_enabled()
            && let Err(error) = regenerate_grub_entries(self.services.runner.as_ref(), sink)
        {
            self.services
                .log
                .error(error.code(), format!("GRUB regeneration failed: {error}"));
        }
        Ok(deleted)
    }

    /// Delete the origin subvolume itself.
    ///
    /// BTRFS refuses when nested subvolumes are present; that condition is
    /// surfaced as [`BuhError::SnapshotNotEmpty`] and must reach the caller.
    pub fn delete_origin(&self) -> Result<()> {
        let argv: Vec<&str> = BTRFS_DELETE
            .iter()
            .copied()
            .chain([self.origin.as_str()])
            .collect();
        let outcome = self.services.runner.run(&argv, true, None)?;
        if outcome
            .text()
            .lines()
            .any(|line| line.contains(NOT_EMPTY_MARKER))
        {
            return Err(BuhError::SnapshotNotEmpty {
                path: PathBuf::from(&self.origin),
            });
        }
        Ok(())
    }

    /// Snapshots owned by this subvolume: destination entries whose name
    /// contains the prefix, oldest first by modification time.
    pub fn list_snapshots(&self) -> Result<Vec<PathBuf>> {
        let mut entries: Vec<(PathBuf, SystemTime)> = Vec::new();
        let read_dir = fs::read_dir(&self.destination)
            .map_err(|source| BuhError::io(&self.destination, source))?;
        for entry in read_dir {
            let entry = entry.map_err(|source| BuhError::io(&self.destination, source))?;
            if !entry.file_name().to_string_lossy().contains(&self.prefix) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .map_err(|source| BuhError::io(entry.path(), source))?;
            entries.push((entry.path(), modified));
        }
        entries.sort_by_key(|(_, modified)| *modified);
        Ok(entries.into_iter().map(|(path, _)| path).collect())
    }

    fn count_entries_containing(&self, needle: &str) -> Result<usize> {
        let read_dir = fs::read_dir(&self.destination)
            .map_err(|source| BuhError::io(&self.destination, source))?;
        Ok(read_dir
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(needle))
            .count())
    }
}

/// Delete one specific snapshot plus its session log, regenerating GRUB
/// entries when the integration is enabled.
pub fn delete_specific_snapshot(
    services: &Services,
    snapshot_path: &Path,
    sink: Option<&dyn OutputSink>,
) -> Result<()> {
    let path_str = snapshot_path.to_string_lossy().into_owned();
    let argv: Vec<&str> = BTRFS_DELETE
        .iter()
        .copied()
        .chain([path_str.as_str()])
        .collect();
    let outcome = services.runner.run(&argv, true, sink)?;
    if !outcome.success() {
        return Err(BuhError::Runtime {
            details: format!("deleting {path_str} exited with status {:?}", outcome.status),
        });
    }
    services
        .log
        .record(LogEntry::new(EventKind::SnapshotDeleted, Severity::Info).with_path(path_str.as_str()));

    if services.settings.read().values().grub_btrfs_enabled()
        && let Err(error) = regenerate_grub_entries(services.runner.as_ref(), sink)
    {
        services
            .log
            .error(error.code(), format!("GRUB regeneration failed: {error}"));
    }

    if let Some(name) = snapshot_path.file_name() {
        let name = name.to_string_lossy();
        match session::delete_log_for_snapshot(&services.paths.logs_dir, &name) {
            Ok(true) => services
                .log
                .info(EventKind::SessionLogDeleted, name.into_owned()),
            Ok(false) => services.log.info(
                EventKind::SessionLogDeleted,
                format!("no session log for {name}, skipping"),
            ),
            Err(error) => services.log.error(error.code(), error.to_string()),
        }
    }
    Ok(())
}
