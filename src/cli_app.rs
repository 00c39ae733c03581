//! Top-level CLI definition and dispatch.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::Colorize;
use crossbeam_channel::unbounded;

use btrfs_upgrade_helper::core::errors::{BuhError, Result};
use btrfs_upgrade_helper::core::paths::AppPaths;
use btrfs_upgrade_helper::core::settings::{
    SettingsStore, SubvolumeSpec, overlapping_prefixes, shared,
};
use btrfs_upgrade_helper::filesystem::usage::probe_filesystems;
use btrfs_upgrade_helper::logger::activity::{ActivityLogConfig, EventKind, spawn_logger};
use btrfs_upgrade_helper::platform::distro::Distro;
use btrfs_upgrade_helper::platform::runner::{CommandRunner, OutputSink, SystemCommandRunner};
use btrfs_upgrade_helper::services::Services;
use btrfs_upgrade_helper::snapshot::consolidate::{
    ConsolidationOutcome, RootCheck, RootConsolidator,
};
use btrfs_upgrade_helper::snapshot::diff::SnapshotDiff;
use btrfs_upgrade_helper::snapshot::subvolume::{Subvolume, delete_specific_snapshot};
use btrfs_upgrade_helper::upgrade::checker::UpdateChecker;
use btrfs_upgrade_helper::upgrade::orchestrator::{
    ProgressEvent, UpgradeOrchestrator, UpgradeRunConfig,
};

/// Core tools the helper cannot run without.
const CORE_TOOLS: &[&str] = &["btrfs", "findmnt"];

/// Fixed startup message; raw probe output is never shown.
const MISSING_TOOLS_MESSAGE: &str =
    "The following required tools are not installed. Install them and start buh again:";

const CONSOLIDATE_PROMPT: &str =
    "You have booted into an alternative snapshot.\nDo you want to consolidate it as your default?";

/// BTRFS Upgrade Helper: snapshots around system upgrades.
#[derive(Debug, Parser)]
#[command(
    name = "buh",
    author,
    version,
    about = "BTRFS Upgrade Helper - snapshots around system upgrades",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Take snapshots of the configured subvolumes.
    Snapshot(SnapshotArgs),
    /// Delete aged-out snapshots per each subvolume's retention count.
    Prune,
    /// Delete one specific snapshot together with its session log.
    Delete(DeleteArgs),
    /// Run the full upgrade pipeline.
    Upgrade(UpgradeArgs),
    /// Check for pending updates without upgrading anything.
    Check,
    /// Detect (and repair) a root booted from an alternate snapshot.
    Consolidate(ConsolidateArgs),
    /// Compute differences between a snapshot and its subvolume.
    Diff(DiffArgs),
    /// Show BTRFS filesystem usage figures.
    Status,
    /// List or edit the configured subvolumes.
    Subvolumes(SubvolumesArgs),
    /// Show or change settings.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct SnapshotArgs {
    /// Only snapshot the subvolume with this origin path.
    #[arg(long, value_name = "PATH")]
    origin: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct DeleteArgs {
    /// Full path of the snapshot to delete.
    snapshot: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct UpgradeArgs {
    /// Skip snapshot creation before upgrading.
    #[arg(long)]
    no_snapshots: bool,
    /// Keep old snapshots (skip the prune stage).
    #[arg(long)]
    keep_old: bool,
    /// Include AUR packages (Arch only).
    #[arg(long, conflicts_with = "no_aur")]
    aur: bool,
    /// Exclude AUR packages.
    #[arg(long)]
    no_aur: bool,
    /// Include snap packages.
    #[arg(long, conflicts_with = "no_snap")]
    snap: bool,
    /// Exclude snap packages.
    #[arg(long)]
    no_snap: bool,
}

#[derive(Debug, Clone, Args)]
struct ConsolidateArgs {
    /// Consolidate without asking.
    #[arg(long, short = 'y')]
    assume_yes: bool,
}

#[derive(Debug, Clone, Args)]
struct DiffArgs {
    /// Full path of the snapshot to compare.
    snapshot: PathBuf,
    /// Full recursive diff instead of the transid-based comparison.
    #[arg(long)]
    full: bool,
}

#[derive(Debug, Clone, Args)]
struct SubvolumesArgs {
    #[command(subcommand)]
    action: SubvolumesAction,
}

#[derive(Debug, Clone, Subcommand)]
enum SubvolumesAction {
    /// List the configured subvolumes.
    List,
    /// Add a subvolume to the managed set.
    Add {
        /// Subvolume origin path.
        origin: String,
        /// Directory where snapshots are stored.
        destination: String,
        /// Snapshot name prefix.
        prefix: String,
        /// Snapshots to keep (-1 keeps forever).
        #[arg(long, default_value_t = 2, allow_hyphen_values = true)]
        keep: i64,
    },
    /// Remove a subvolume from the managed set (snapshots are kept).
    Remove {
        /// Origin path of the subvolume to remove.
        origin: String,
    },
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigAction {
    /// Print the effective settings.
    Show,
    /// Set one settings key.
    Set {
        key: String,
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Target shell.
    shell: CompletionShell,
}

/// Console sink printing streamed command output as it arrives.
struct ConsoleSink;

impl OutputSink for ConsoleSink {
    fn write_line(&self, line: &str) {
        println!("{line}");
    }
}

pub fn run(args: &Cli) -> Result<()> {
    if args.no_color {
        colored::control::set_override(false);
    }

    if let Command::Completions(completions) = &args.command {
        generate(
            completions.shell,
            &mut Cli::command(),
            "buh",
            &mut io::stdout(),
        );
        return Ok(());
    }

    let paths = AppPaths::default();
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new());
    startup_gate(runner.as_ref())?;

    let store = SettingsStore::load(args.config.as_deref())?;
    let (log, logger_join) = spawn_logger(ActivityLogConfig::at(paths.activity_log.clone()))?;
    let services = Services::new(runner, shared(store), paths, log);
    warn_on_overlapping_prefixes(&services)?;

    let result = dispatch(&args.command, &services);

    services.log.shutdown();
    let _ = logger_join.join();
    result
}

fn startup_gate(runner: &dyn CommandRunner) -> Result<()> {
    let mut missing = Vec::new();
    for tool in CORE_TOOLS {
        if !(runner.binary_exists(tool, false)? || runner.binary_exists(tool, true)?) {
            missing.push(*tool);
        }
    }
    if missing.is_empty() {
        return Ok(());
    }
    eprintln!("{}", MISSING_TOOLS_MESSAGE.red());
    for tool in &missing {
        eprintln!("  {tool}");
    }
    Err(BuhError::CommandNotFound {
        binary: missing.join(", "),
    })
}

fn warn_on_overlapping_prefixes(services: &Services) -> Result<()> {
    let specs = services.settings.read().values().subvolume_specs()?;
    for (left, right) in overlapping_prefixes(&specs) {
        services.log.warn(
            EventKind::Error,
            format!("snapshot prefixes {left:?} and {right:?} overlap and may claim each other"),
        );
    }
    Ok(())
}

fn dispatch(command: &Command, services: &Services) -> Result<()> {
    match command {
        Command::Snapshot(args) => snapshot(services, args),
        Command::Prune => prune(services),
        Command::Delete(args) => {
            delete_specific_snapshot(services, &args.snapshot, Some(&ConsoleSink))?;
            println!("Deleted {}", args.snapshot.display());
            Ok(())
        }
        Command::Upgrade(args) => upgrade(services, args),
        Command::Check => check(services),
        Command::Consolidate(args) => consolidate(services, args),
        Command::Diff(args) => diff(services, args),
        Command::Status => status(services),
        Command::Subvolumes(args) => subvolumes(services, args),
        Command::Config(args) => config(services, args),
        Command::Completions(_) => Ok(()),
    }
}

fn snapshot(services: &Services, args: &SnapshotArgs) -> Result<()> {
    let subvolumes = Subvolume::from_settings(services)?;
    let selected: Vec<&Subvolume> = subvolumes
        .iter()
        .filter(|subvolume| {
            args.origin.as_deref().is_none_or(|origin| {
                subvolume.origin().trim_end_matches('/') == origin.trim_end_matches('/')
            })
        })
        .collect();
    if selected.is_empty() {
        return Err(BuhError::InvalidConfig {
            details: "no matching subvolume is configured".to_string(),
        });
    }
    for subvolume in selected {
        let created = subvolume.create_snapshot(Some(&ConsoleSink))?;
        println!("Created {}", created.display());
    }
    Ok(())
}

fn prune(services: &Services) -> Result<()> {
    let mut total = 0;
    for subvolume in Subvolume::from_settings(services)? {
        let deleted = subvolume.delete_snapshots(Some(&ConsoleSink))?;
        for path in &deleted {
            println!("Deleted {}", path.display());
        }
        total += deleted.len();
    }
    println!("{total} snapshot(s) pruned.");
    Ok(())
}

fn upgrade(services: &Services, args: &UpgradeArgs) -> Result<()> {
    let distro = Distro::detect(services.runner.as_ref())?;

    let mut run_config = {
        let settings = services.settings.read();
        UpgradeRunConfig::from_settings(settings.values())
    };
    if args.no_snapshots {
        run_config.take_snapshots = false;
    }
    if args.keep_old {
        run_config.remove_old_snapshots = false;
    }
    if args.aur {
        run_config.include_aur = true;
    }
    if args.no_aur {
        run_config.include_aur = false;
    }
    if args.snap {
        run_config.include_snap = true;
    }
    if args.no_snap {
        run_config.include_snap = false;
    }

    let (events_tx, events_rx) = unbounded();
    let orchestrator = UpgradeOrchestrator::new(services.clone(), distro, run_config, events_tx);
    let pipeline: thread::JoinHandle<()> = orchestrator.spawn()?;

    for event in events_rx {
        match event {
            ProgressEvent::StageStarted { stage } => {
                println!("{}", format!("==> {}", stage.label()).bold());
            }
            ProgressEvent::OutputLine(line) => println!("{line}"),
            ProgressEvent::StageFailed { stage, reason } => {
                eprintln!("{}", format!("{} failed: {reason}", stage.label()).red());
            }
            ProgressEvent::UpToDate => {
                println!("{}", "Your system is up to date.".green());
            }
            ProgressEvent::Finished => break,
            ProgressEvent::ControlsDisabled
            | ProgressEvent::ControlsEnabled
            | ProgressEvent::RefreshRequested => {}
        }
    }
    pipeline.join().map_err(|_| BuhError::Runtime {
        details: "the upgrade pipeline thread panicked".to_string(),
    })?;
    Ok(())
}

fn check(services: &Services) -> Result<()> {
    let distro = Distro::detect(services.runner.as_ref())?;
    let (notices_tx, _notices_rx) = unbounded();
    let checker = UpdateChecker::new(services.clone(), distro, notices_tx);
    match checker.query_pending_updates()? {
        Some(packages) => {
            println!("{} update(s) available:", packages.len());
            for line in packages {
                println!("  {line}");
            }
        }
        None => println!("{}", "Your system is up to date.".green()),
    }
    Ok(())
}

fn consolidate(services: &Services, args: &ConsolidateArgs) -> Result<()> {
    let subvolumes = Subvolume::from_settings(services)?;
    let consolidator = RootConsolidator::new(services.clone());
    match consolidator.check_root_snapshot(&subvolumes)? {
        RootCheck::Consolidated => {
            println!("The root subvolume is the configured default. Nothing to do.");
            Ok(())
        }
        RootCheck::NeedsConsolidation(candidate) => {
            println!("Booted snapshot: {}", candidate.mounted_subvol);
            let approved = args.assume_yes || confirm(CONSOLIDATE_PROMPT)?;
            let outcome = consolidator.resolve(&candidate, approved, Some(&ConsoleSink))?;
            match outcome {
                ConsolidationOutcome::Success => println!("{}", outcome.message().green()),
                ConsolidationOutcome::UserDeclined => {
                    eprintln!("{}", outcome.message().red());
                    std::process::exit(1);
                }
                ConsolidationOutcome::FstabPatchFailed | ConsolidationOutcome::OriginNotEmpty => {
                    eprintln!("{}", outcome.message().red());
                }
            }
            Ok(())
        }
    }
}

fn diff(services: &Services, args: &DiffArgs) -> Result<()> {
    let subvolumes = Subvolume::from_settings(services)?;
    let snapshot_str = args.snapshot.to_string_lossy();
    let owner = subvolumes
        .into_iter()
        .find(|subvolume| {
            snapshot_str.starts_with(&format!(
                "{}{}",
                subvolume.destination(),
                subvolume.prefix()
            ))
        })
        .ok_or_else(|| BuhError::InvalidConfig {
            details: format!("no configured subvolume owns snapshot {snapshot_str}"),
        })?;

    println!("Calculating differences for {snapshot_str}. This can take several minutes...");
    let reporter = SnapshotDiff::new(services.clone());
    let report_dir = if args.full {
        reporter.full_report(&owner, &args.snapshot)?
    } else {
        reporter.partial_report(&owner, &args.snapshot)?
    };
    println!("Reports written to {}", report_dir.display());
    Ok(())
}

fn status(services: &Services) -> Result<()> {
    let filesystems = probe_filesystems(services.runner.as_ref())?;
    if filesystems.is_empty() {
        println!("No mounted BTRFS filesystems found.");
        return Ok(());
    }
    for filesystem in filesystems {
        let label = filesystem.label.as_deref().unwrap_or("no label");
        println!("{} ({label})", filesystem.uuid.bold());
        println!("  devices: {}", filesystem.devices.join(", "));
        println!("  mounted: {}", filesystem.mounted_points.join(", "));
        if let Some(usage) = filesystem.usage {
            println!(
                "  size {} / allocated {}",
                usage.total_size, usage.total_allocated
            );
            println!(
                "  data {} of {} ({}%)",
                usage.data_used, usage.data_size, usage.data_percentage
            );
            println!(
                "  metadata {} of {} ({}%)",
                usage.metadata_used, usage.metadata_size, usage.metadata_percentage
            );
            println!(
                "  system {} of {} ({}%)",
                usage.system_used, usage.system_size, usage.system_percentage
            );
        }
    }
    Ok(())
}

fn subvolumes(services: &Services, args: &SubvolumesArgs) -> Result<()> {
    match &args.action {
        SubvolumesAction::List => {
            let specs = services.settings.read().values().subvolume_specs()?;
            if specs.is_empty() {
                println!("No subvolumes configured.");
            }
            for spec in specs {
                let keep = if spec.snapshots_to_keep < 0 {
                    "keep forever".to_string()
                } else {
                    format!("keep {}", spec.snapshots_to_keep)
                };
                println!(
                    "{} -> {} (prefix {:?}, {keep})",
                    spec.origin, spec.destination, spec.prefix
                );
            }
            Ok(())
        }
        SubvolumesAction::Add {
            origin,
            destination,
            prefix,
            keep,
        } => {
            let mut settings = services.settings.write();
            let mut specs = settings.values().subvolume_specs()?;
            specs.push(SubvolumeSpec {
                origin: origin.clone(),
                destination: destination.clone(),
                prefix: prefix.clone(),
                snapshots_to_keep: *keep,
            });
            settings.set_subvolumes(&specs)?;
            println!("Added {origin}.");
            Ok(())
        }
        SubvolumesAction::Remove { origin } => {
            let mut settings = services.settings.write();
            let mut specs = settings.values().subvolume_specs()?;
            let before = specs.len();
            specs.retain(|spec| {
                spec.origin.trim_end_matches('/') != origin.trim_end_matches('/')
            });
            if specs.len() == before {
                return Err(BuhError::InvalidConfig {
                    details: format!("no configured subvolume has origin {origin}"),
                });
            }
            settings.set_subvolumes(&specs)?;
            // Existing snapshots are left on disk on purpose.
            println!("Removed {origin}. Its snapshots were kept.");
            Ok(())
        }
    }
}

fn config(services: &Services, args: &ConfigArgs) -> Result<()> {
    match &args.action {
        ConfigAction::Show => {
            let settings = services.settings.read();
            let rendered =
                toml::to_string_pretty(settings.values()).map_err(BuhError::from)?;
            print!("{rendered}");
            Ok(())
        }
        ConfigAction::Set { key, value } => {
            let mut settings = services.settings.write();
            let parse_flag = || -> Result<i64> {
                value.parse().map_err(|_| BuhError::InvalidConfig {
                    details: format!("{key} expects an integer, got {value:?}"),
                })
            };
            match key.as_str() {
                "aur_repository" => {
                    let flag = parse_flag()?;
                    settings.update(|s| s.aur_repository = flag)?;
                }
                "check_at_startup" => {
                    let flag = parse_flag()?;
                    settings.update(|s| s.check_at_startup = flag)?;
                }
                "snap_packages" => {
                    let flag = parse_flag()?;
                    settings.update(|s| s.snap_packages = flag)?;
                }
                "grub_btrfs" => {
                    let flag = parse_flag()?;
                    settings.update(|s| s.grub_btrfs = flag)?;
                }
                "save_log" => {
                    let flag = parse_flag()?;
                    settings.update(|s| s.save_log = flag)?;
                }
                "path_to_consolidate_root_snapshot" => {
                    settings.set_path_to_consolidate(value)?;
                }
                other => {
                    return Err(BuhError::InvalidConfig {
                        details: format!("unknown settings key {other:?}"),
                    });
                }
            }
            println!("{key} = {value}");
            Ok(())
        }
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout()
        .flush()
        .map_err(|source| BuhError::io("stdout", source))?;
    let mut line = String::new();
    io::stdin()
        .read_line(&mut line)
        .map_err(|source| BuhError::io("stdin", source))?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}
