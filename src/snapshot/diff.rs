//! Snapshot difference reports.
//!
//! Two modes, both writing into `diffs/{snapshot_name}/`:
//! - **full**: `diff -qr` between the subvolume and the snapshot, classified
//!   into files only in the origin, only in the snapshot, and modified in
//!   both (three report files);
//! - **partial**: `btrfs subvolume find-new` against the snapshot's last
//!   transid, listing files modified since the snapshot was taken.

#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::errors::{BuhError, Result};
use crate::services::Services;
use crate::snapshot::subvolume::Subvolume;

const DIFF_QR: &[&str] = &["diff", "-qr"];
const BTRFS_FIND_NEW: &[&str] = &["btrfs", "subvolume", "find-new"];

/// Transid high enough that `find-new` only prints the current marker.
const TRANSID_SEED: &str = "9999999";

/// Report file listing files modified in both trees.
pub const MODIFIED_FILE: &str = "modified.txt";

/// Classified `diff -qr` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullDiffReport {
    pub only_in_origin: Vec<String>,
    pub only_in_snapshot: Vec<String>,
    pub modified: Vec<String>,
}

fn rooted(rest: &str) -> String {
    format!("/{}", rest.trim_start_matches('/'))
}

fn rooted_join(dir: &str, name: &str) -> String {
    let base = rooted(dir);
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Classify `diff -qr {origin} {snapshot}` lines.
///
/// Paths are reported relative to their tree, `/`-prefixed on both sides.
#[must_use]
pub fn classify_full_diff(output: &str, origin: &str, snapshot: &str) -> FullDiffReport {
    let origin = origin.trim_end_matches('/');
    let snapshot = snapshot.trim_end_matches('/');
    let mut report = FullDiffReport::default();

    for line in output.lines() {
        if line.starts_with("Files ") && line.ends_with(" differ") {
            // "Files {origin}/x and {snapshot}/x differ"
            let body = &line["Files ".len()..line.len() - " differ".len()];
            if let Some((left, _)) = body.split_once(" and ")
                && let Some(rest) = left.strip_prefix(origin)
            {
                report.modified.push(rooted(rest));
            }
        } else if let Some(rest) = line.strip_prefix("Only in ") {
            // "Only in {tree}{subdir}: name"
            if let Some((dir, name)) = rest.split_once(": ") {
                if let Some(sub) = dir.strip_prefix(origin) {
                    report.only_in_origin.push(rooted_join(sub, name));
                } else if let Some(sub) = dir.strip_prefix(snapshot) {
                    report.only_in_snapshot.push(rooted_join(sub, name));
                }
            }
        }
    }
    report
}

/// Current transid marker from `find-new` output (its final line).
#[must_use]
pub fn last_transid(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .last()?
        .split_whitespace()
        .last()
        .map(ToString::to_string)
}

/// Modified paths from `find-new` output, de-duplicated and sorted.
#[must_use]
pub fn modified_paths(output: &str) -> Vec<String> {
    let unique: BTreeSet<String> = output
        .lines()
        .filter(|line| line.starts_with("inode "))
        .filter_map(|line| line.split_whitespace().last())
        .map(|path| format!("/{}", path.trim_start_matches('/')))
        .collect();
    unique.into_iter().collect()
}

fn subvolume_display_name(origin: &str) -> String {
    origin
        .split('/')
        .filter(|segment| !segment.is_empty())
        .next_back()
        .unwrap_or("subvolume")
        .to_string()
}

/// Computes and writes snapshot difference reports.
pub struct SnapshotDiff {
    services: Services,
}

impl SnapshotDiff {
    #[must_use]
    pub const fn new(services: Services) -> Self {
        Self { services }
    }

    fn report_dir(&self, snapshot_path: &Path) -> Result<PathBuf> {
        let snapshot_name = snapshot_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| BuhError::Runtime {
                details: format!("snapshot path {} has no name", snapshot_path.display()),
            })?;
        let dir = self.services.paths.diffs_dir.join(snapshot_name);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|source| BuhError::io(&dir, source))?;
        }
        fs::create_dir_all(&dir).map_err(|source| BuhError::io(&dir, source))?;
        Ok(dir)
    }

    /// Full comparison via `diff -qr`; returns the report directory.
    pub fn full_report(&self, subvolume: &Subvolume, snapshot_path: &Path) -> Result<PathBuf> {
        let snapshot_str = snapshot_path.to_string_lossy().into_owned();
        let argv: Vec<&str> = DIFF_QR
            .iter()
            .copied()
            .chain([subvolume.origin(), snapshot_str.as_str()])
            .collect();
        // diff exits 1 whenever trees differ; only the output matters here.
        let outcome = self.services.runner.run(&argv, true, None)?;
        let report = classify_full_diff(outcome.text(), subvolume.origin(), &snapshot_str);

        let dir = self.report_dir(snapshot_path)?;
        let origin_name = subvolume_display_name(subvolume.origin());
        let snapshot_name = snapshot_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        write_report(
            &dir.join(format!("{origin_name}.txt")),
            &format!("Files only in {}", subvolume.origin()),
            &report.only_in_origin,
        )?;
        write_report(
            &dir.join(format!("{snapshot_name}.txt")),
            &format!("Files only in {}", snapshot_path.display()),
            &report.only_in_snapshot,
        )?;
        write_report(
            &dir.join(MODIFIED_FILE),
            "Files in both snapshots that have been modified",
            &report.modified,
        )?;
        Ok(dir)
    }

    /// Transid-based comparison via `find-new`; returns the report directory.
    pub fn partial_report(&self, subvolume: &Subvolume, snapshot_path: &Path) -> Result<PathBuf> {
        let snapshot_str = snapshot_path.to_string_lossy().into_owned();

        let argv: Vec<&str> = BTRFS_FIND_NEW
            .iter()
            .copied()
            .chain([snapshot_str.as_str(), TRANSID_SEED])
            .collect();
        let outcome = self.services.runner.run(&argv, true, None)?;
        let transid = last_transid(outcome.text()).ok_or_else(|| BuhError::Runtime {
            details: format!("no transid marker in find-new output for {snapshot_str}"),
        })?;

        let argv: Vec<&str> = BTRFS_FIND_NEW
            .iter()
            .copied()
            .chain([subvolume.origin(), transid.as_str()])
            .collect();
        let outcome = self.services.runner.run(&argv, true, None)?;
        let modified = modified_paths(outcome.text());

        let dir = self.report_dir(snapshot_path)?;
        write_report(
            &dir.join(MODIFIED_FILE),
            "Files in both snapshots that have been modified",
            &modified,
        )?;
        Ok(dir)
    }
}

fn write_report(path: &Path, header: &str, entries: &[String]) -> Result<()> {
    let mut content = format!("{header}\n\n");
    for entry in entries {
        content.push_str(entry);
        content.push('\n');
    }
    fs::write(path, content).map_err(|source| BuhError::io(path, source))
}

#[cfg(test)]
mod tests {
    use super::{SnapshotDiff, classify_full_diff, last_transid, modified_paths};
    use crate::core::paths::AppPaths;
    use crate::core::settings::{Settings, SettingsStore, SubvolumeSpec, shared};
    use crate::logger::activity::ActivityHandle;
    use crate::platform::runner::MockCommandRunner;
    use crate::services::Services;
    use crate::snapshot::subvolume::Subvolume;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    const DIFF_OUTPUT: &str = "\
Files /mnt/rootvol/etc/passwd and /mnt/snapshots/root-20260807-0/etc/passwd differ
Only in /mnt/rootvol/var/cache: new-download.bin
Only in /mnt/snapshots/root-20260807-0/etc: removed.conf
Files /mnt/rootvol/etc/hosts and /mnt/snapshots/root-20260807-0/etc/hosts differ
";

    #[test]
    fn full_diff_lines_are_classified_by_tree() {
        let report = classify_full_diff(
            DIFF_OUTPUT,
            "/mnt/rootvol/",
            "/mnt/snapshots/root-20260807-0",
        );
        assert_eq!(report.modified, ["/etc/passwd", "/etc/hosts"]);
        assert_eq!(report.only_in_origin, ["/var/cache/new-download.bin"]);
        assert_eq!(report.only_in_snapshot, ["/etc/removed.conf"]);
    }

    #[test]
    fn transid_marker_is_the_last_token_of_the_last_line() {
        let output = "inode 257 file offset 0 len 4096 disk start 0 gen 36 flags INLINE etc/hostname\n\
                      transid marker was 463579\n";
        assert_eq!(last_transid(output).as_deref(), Some("463579"));
        assert_eq!(last_transid(""), None);
    }

    #[test]
    fn modified_paths_are_unique_and_sorted() {
        let output = "\
inode 4069 file offset 0 len 16384 disk start 0 offset 0 gen 36 flags INLINE var/log/pacman.log
inode 4070 file offset 0 len 200 disk start 0 offset 0 gen 36 flags INLINE etc/hostname
inode 4069 file offset 16384 len 800 disk start 0 offset 0 gen 37 flags NONE var/log/pacman.log
transid marker was 463580
";
        assert_eq!(
            modified_paths(output),
            ["/etc/hostname", "/var/log/pacman.log"]
        );
    }

    fn services_with(runner: Arc<MockCommandRunner>, data_dir: &Path) -> Services {
        let store = SettingsStore::with_values(data_dir.join("config.toml"), Settings::default());
        Services::new(
            runner,
            shared(store),
            AppPaths::rooted_at(data_dir.to_path_buf()),
            ActivityHandle::disabled(),
        )
    }

    fn rootvol(services: &Services) -> Subvolume {
        Subvolume::new(
            &SubvolumeSpec {
                origin: "/mnt/rootvol/".to_string(),
                destination: "/mnt/snapshots/".to_string(),
                prefix: "root".to_string(),
                snapshots_to_keep: 2,
            },
            services.clone(),
        )
    }

    #[test]
    fn full_report_writes_three_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(MockCommandRunner::new());
        runner.respond_with_status(&["diff", "-qr"], DIFF_OUTPUT, 1);
        let services = services_with(runner, dir.path());
        let subvolume = rootvol(&services);

        let report_dir = SnapshotDiff::new(services)
            .full_report(&subvolume, Path::new("/mnt/snapshots/root-20260807-0"))
            .expect("report succeeds");

        let modified = fs::read_to_string(report_dir.join("modified.txt")).expect("modified");
        assert!(modified.contains("/etc/passwd"));
        assert!(modified.contains("/etc/hosts"));
        let only_origin = fs::read_to_string(report_dir.join("rootvol.txt")).expect("origin file");
        assert!(only_origin.contains("/var/cache/new-download.bin"));
        let only_snapshot =
            fs::read_to_string(report_dir.join("root-20260807-0.txt")).expect("snapshot file");
        assert!(only_snapshot.contains("/etc/removed.conf"));
    }

    #[test]
    fn partial_report_queries_the_transid_then_the_origin() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(MockCommandRunner::new());
        runner.respond_to(
            &[
                "btrfs",
                "subvolume",
                "find-new",
                "/mnt/snapshots/root-20260807-0",
            ],
            "transid marker was 463579\n",
        );
        runner.respond_to(
            &["btrfs", "subvolume", "find-new", "/mnt/rootvol/"],
            "inode 4070 file offset 0 len 200 disk start 0 offset 0 gen 36 flags INLINE etc/hostname\n\
             transid marker was 463580\n",
        );
        let services = services_with(runner.clone(), dir.path());
        let subvolume = rootvol(&services);

        let report_dir = SnapshotDiff::new(services)
            .partial_report(&subvolume, Path::new("/mnt/snapshots/root-20260807-0"))
            .expect("report succeeds");

        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].argv[4], "9999999");
        assert_eq!(invocations[1].argv[4], "463579");

        let modified = fs::read_to_string(report_dir.join("modified.txt")).expect("modified");
        assert!(modified.contains("/etc/hostname"));
    }
}
