//! Integration tests: CLI smoke tests plus full library scenarios driven
//! through the mock command runner.

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use btrfs_upgrade_helper::core::paths::AppPaths;
use btrfs_upgrade_helper::core::settings::{Settings, SettingsStore, SubvolumeSpec, shared};
use btrfs_upgrade_helper::logger::activity::ActivityHandle;
use btrfs_upgrade_helper::platform::distro::Distro;
use btrfs_upgrade_helper::platform::runner::MockCommandRunner;
use btrfs_upgrade_helper::services::Services;
use btrfs_upgrade_helper::snapshot::consolidate::{
    ConsolidationOutcome, RootCheck, RootConsolidator,
};
use btrfs_upgrade_helper::snapshot::retention::KEEP_FOREVER;
use btrfs_upgrade_helper::snapshot::subvolume::Subvolume;
use btrfs_upgrade_helper::upgrade::orchestrator::{
    ProgressEvent, UpgradeOrchestrator, UpgradeRunConfig,
};
use crossbeam_channel::unbounded;
use filetime::FileTime;

// ──────────────────── CLI smoke tests ────────────────────

#[test]
fn help_command_prints_usage() {
    let result = common::run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: buh [OPTIONS] <COMMAND>"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
}

#[test]
fn version_command_prints_version() {
    let result = common::run_cli_case("version_command_prints_version", &["--version"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("buh") || result.stdout.contains("btrfs_upgrade_helper"),
        "missing version output; log: {}",
        result.log_path.display()
    );
}

#[test]
fn subcommand_help_flags_work() {
    let subcommands = [
        "snapshot",
        "prune",
        "delete",
        "upgrade",
        "check",
        "consolidate",
        "diff",
        "status",
        "subvolumes",
        "config",
        "completions",
    ];
    for subcommand in subcommands {
        let case = format!("help_{subcommand}");
        let result = common::run_cli_case(&case, &[subcommand, "--help"]);
        assert!(
            result.status.success(),
            "{subcommand} --help failed; log: {}",
            result.log_path.display()
        );
    }
}

#[test]
fn completions_are_generated_for_bash() {
    let result = common::run_cli_case("completions_bash", &["completions", "bash"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("_buh"),
        "missing completion function; log: {}",
        result.log_path.display()
    );
}

#[test]
fn conflicting_aur_flags_are_rejected() {
    let result = common::run_cli_case(
        "conflicting_aur_flags",
        &["upgrade", "--aur", "--no-aur"],
    );
    assert!(
        !result.status.success(),
        "conflicting flags must fail; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stderr.contains("--aur") || result.stderr.contains("cannot be used"),
        "missing conflict diagnostics; log: {}",
        result.log_path.display()
    );
}

// ──────────────────── library scenarios ────────────────────

fn services_with(runner: Arc<MockCommandRunner>, data_dir: &Path, settings: Settings) -> Services {
    let store = SettingsStore::with_values(data_dir.join("config.toml"), settings);
    Services::new(
        runner,
        shared(store),
        AppPaths::rooted_at(data_dir.to_path_buf()),
        ActivityHandle::disabled(),
    )
}

/// Two subvolumes: `/` keeps 2 snapshots, `/home` keeps forever. Three root
/// snapshots on three simulated dates plus two home snapshots; pruning must
/// delete exactly the oldest root snapshot and never touch home.
#[test]
fn retention_scenario_with_mixed_keep_counts() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root_dest = dir.path().join("snapshots/root");
    let home_dest = dir.path().join("snapshots/home");
    fs::create_dir_all(&root_dest).expect("root dest");
    fs::create_dir_all(&home_dest).expect("home dest");

    let runner = Arc::new(MockCommandRunner::new().with_snapshot_simulation());
    let services = services_with(runner.clone(), dir.path(), Settings::default());

    let root = Subvolume::new(
        &SubvolumeSpec {
            origin: "/".to_string(),
            destination: root_dest.to_string_lossy().into_owned(),
            prefix: "root".to_string(),
            snapshots_to_keep: 2,
        },
        services.clone(),
    );
    let home = Subvolume::new(
        &SubvolumeSpec {
            origin: "/home/".to_string(),
            destination: home_dest.to_string_lossy().into_owned(),
            prefix: "home".to_string(),
            snapshots_to_keep: KEEP_FOREVER,
        },
        services.clone(),
    );

    for (index, date) in ["20260805", "20260806", "20260807"].iter().enumerate() {
        let created = root
            .clone()
            .with_date_stamp(date)
            .create_snapshot(None)
            .expect("root snapshot");
        filetime::set_file_mtime(&created, FileTime::from_unix_time(1_000 + index as i64, 0))
            .expect("set mtime");
    }
    for (index, date) in ["20260806", "20260807"].iter().enumerate() {
        let created = home
            .clone()
            .with_date_stamp(date)
            .create_snapshot(None)
            .expect("home snapshot");
        filetime::set_file_mtime(&created, FileTime::from_unix_time(2_000 + index as i64, 0))
            .expect("set mtime");
    }

    let root_deleted = root.delete_snapshots(None).expect("root prune");
    let home_deleted = home.delete_snapshots(None).expect("home prune");

    assert_eq!(root_deleted.len(), 1, "exactly the surplus is deleted");
    assert!(root_deleted[0].ends_with("root-20260805-0"));
    assert!(home_deleted.is_empty(), "keep-forever is never pruned");
    assert_eq!(root.list_snapshots().expect("list").len(), 2);
    assert_eq!(home.list_snapshots().expect("list").len(), 2);
    assert_eq!(
        runner.invocation_count(&["btrfs", "subvolume", "delete"]),
        1
    );
}

/// Pre-check finding no updates must skip every stage while still emitting
/// the disable/enable bracket exactly once each, through the background
/// thread, as the CLI drives it.
#[test]
fn spawned_pipeline_short_circuits_on_no_updates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runner = Arc::new(MockCommandRunner::new());
    runner.respond_to(&["pacman", "-Qu"], "");
    let settings = Settings {
        save_log: 0,
        subvolumes_orig: "/".to_string(),
        subvolumes_dest: "/snapshots".to_string(),
        subvolumes_prefix: "root".to_string(),
        subvolumes_snapshots_to_keep: "2".to_string(),
        ..Settings::default()
    };
    let services = services_with(runner.clone(), dir.path(), settings);

    let run_config = UpgradeRunConfig {
        take_snapshots: true,
        remove_old_snapshots: true,
        include_aur: true,
        include_snap: true,
    };
    let (tx, rx) = unbounded();
    let join = UpgradeOrchestrator::new(services, Distro::Arch, run_config, tx)
        .spawn()
        .expect("spawn pipeline");

    let events: Vec<ProgressEvent> = rx.iter().collect();
    join.join().expect("pipeline thread joins");

    let disabled = events
        .iter()
        .filter(|e| **e == ProgressEvent::ControlsDisabled)
        .count();
    let enabled = events
        .iter()
        .filter(|e| **e == ProgressEvent::ControlsEnabled)
        .count();
    assert_eq!(disabled, 1);
    assert_eq!(enabled, 1);
    assert!(events.contains(&ProgressEvent::UpToDate));
    assert_eq!(
        runner.invocation_count(&["btrfs", "subvolume", "snapshot"]),
        0
    );
    assert_eq!(runner.invocation_count(&["pacman", "-Syu"]), 0);
}

/// End to end: an alternate-snapshot boot is detected from mount output and
/// consolidated onto the root origin, with the fstab patched and the new
/// real path recorded.
#[test]
fn consolidation_detects_and_repairs_an_alternate_boot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let origin = dir.path().join("rootvol");
    // Destination mirrors the subvolume layout so the mounted identifier
    // (`_snapshots/...`) is a substring of the snapshot path.
    let dest = dir.path().join("_snapshots");
    let snapshot = dest.join("root-20260806-0");
    fs::create_dir_all(origin.join("etc")).expect("origin etc");
    fs::create_dir_all(&snapshot).expect("snapshot dir");
    fs::write(
        origin.join("etc/fstab"),
        "UUID=abcd / btrfs rw,subvol=/_snapshots/root-20260806-0 0 0\n",
    )
    .expect("fstab");

    let runner = Arc::new(MockCommandRunner::new());
    runner.respond_to(
        &["mount"],
        "/dev/sda2 on / type btrfs (rw,relatime,subvolid=300,subvol=/_snapshots/root-20260806-0)\n",
    );
    runner.respond_to(&["btrfs", "subvolume", "delete"], "");
    runner.respond_to(&["btrfs", "subvolume", "snapshot"], "");
    let snapshot_str = snapshot.to_string_lossy().into_owned();
    let origin_str = origin.to_string_lossy().into_owned();
    runner.respond_to(
        &["btrfs", "subvolume", "show", snapshot_str.as_str()],
        "_snapshots/root-20260806-0\n",
    );
    runner.respond_to(
        &["btrfs", "subvolume", "show", origin_str.as_str()],
        "_active/rootvol\n",
    );

    let settings = Settings {
        path_to_consolidate_root_snapshot: "_active/rootvol".to_string(),
        ..Settings::default()
    };
    let services = services_with(runner.clone(), dir.path(), settings);
    let root = Subvolume::new(
        &SubvolumeSpec {
            origin: origin_str,
            destination: dest.to_string_lossy().into_owned(),
            prefix: "root".to_string(),
            snapshots_to_keep: 2,
        },
        services.clone(),
    );

    let consolidator = RootConsolidator::new(services.clone());
    let check = consolidator
        .check_root_snapshot(std::slice::from_ref(&root))
        .expect("check succeeds");
    let RootCheck::NeedsConsolidation(candidate) = check else {
        panic!("expected NeedsConsolidation");
    };

    let outcome = consolidator
        .resolve(&candidate, true, None)
        .expect("resolve succeeds");
    assert_eq!(outcome, ConsolidationOutcome::Success);
    assert_eq!(runner.invocation_count(&["sed", "-i"]), 1);
    assert_eq!(
        services.settings.read().values().path_to_consolidate(),
        Some("_active/rootvol")
    );
}

/// Settings survive a full load → mutate → reload cycle with the legacy
/// `|`-delimited encodings intact.
#[test]
fn settings_file_round_trip_preserves_legacy_encodings() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    fs::write(
        &path,
        "aur_repository = 1\n\
         check_at_startup = 1\n\
         grub_btrfs = 0\n\
         path_to_consolidate_root_snapshot = \"0\"\n\
         subvolumes_orig = \"/|/home\"\n\
         subvolumes_dest = \"/snapshots|/snapshots\"\n\
         subvolumes_prefix = \"root|home\"\n\
         subvolumes_snapshots_to_keep = \"3|-1\"\n",
    )
    .expect("seed config");

    let mut store = SettingsStore::load(Some(&path)).expect("load succeeds");
    assert!(store.values().aur_enabled());
    assert!(store.values().path_to_consolidate().is_none());

    let mut specs = store.values().subvolume_specs().expect("specs decode");
    assert_eq!(specs.len(), 2);
    assert_eq!(specs[1].snapshots_to_keep, KEEP_FOREVER);

    specs[0].snapshots_to_keep = 5;
    store.set_subvolumes(&specs).expect("mutation persists");

    let reloaded = SettingsStore::load(Some(&path)).expect("reload succeeds");
    let reloaded_specs = reloaded
        .values()
        .subvolume_specs()
        .expect("specs decode after reload");
    assert_eq!(reloaded_specs[0].snapshots_to_keep, 5);
    assert_eq!(reloaded_specs[1].snapshots_to_keep, KEEP_FOREVER);
    let raw = fs::read_to_string(&path).expect("raw config");
    assert!(raw.contains("\"5|-1\""), "pipe encoding kept: {raw}");
}
