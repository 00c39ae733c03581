//! The upgrade pipeline: pre-check, snapshots, package upgrade, AUR, snap,
//! prune, GRUB, running strictly sequentially on one background thread.
//!
//! Stages are best-effort: a non-zero exit or a missing optional binary is
//! reported as a `StageFailed` event and the pipeline moves on. The only hard
//! stops are the pre-check finding no updates and a missing package manager.
//! Progress flows through a crossbeam channel; the caller owns the receiving
//! side and is responsible for serializing runs (disable/enable bracketing).

#![allow(missing_docs)]

use std::thread;

use crossbeam_channel::Sender;

use crate::core::errors::{BuhError, Result};
use crate::core::settings::Settings;
use crate::logger::activity::EventKind;
use crate::logger::session::SessionLog;
use crate::platform::distro::{AUR_HELPERS, Distro, SNAP_BINARY, SNAP_REFRESH};
use crate::platform::runner::OutputSink;
use crate::services::Services;
use crate::snapshot::subvolume::Subvolume;

/// Per-run flags, constructed fresh from settings/CLI state and never
/// persisted as an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeRunConfig {
    pub take_snapshots: bool,
    pub remove_old_snapshots: bool,
    pub include_aur: bool,
    pub include_snap: bool,
}

impl UpgradeRunConfig {
    /// Defaults derived from the persisted settings.
    #[must_use]
    pub const fn from_settings(settings: &Settings) -> Self {
        Self {
            take_snapshots: true,
            remove_old_snapshots: true,
            include_aur: settings.aur_enabled(),
            include_snap: settings.snap_enabled(),
        }
    }
}

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStage {
    PreCheck,
    Snapshots,
    SystemUpgrade,
    Aur,
    Snap,
    Prune,
}

impl UpgradeStage {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::PreCheck => "update check",
            Self::Snapshots => "snapshot creation",
            Self::SystemUpgrade => "system upgrade",
            Self::Aur => "AUR upgrade",
            Self::Snap => "snap upgrade",
            Self::Prune => "snapshot pruning",
        }
    }
}

/// Progress protocol between the pipeline thread and its caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Caller should disable interactive controls for the run's duration.
    ControlsDisabled,
    StageStarted { stage: UpgradeStage },
    /// One console line from a streaming command.
    OutputLine(String),
    StageFailed { stage: UpgradeStage, reason: String },
    /// Pre-check found nothing to do; every stage was skipped.
    UpToDate,
    /// Caller should refresh any filesystem statistics it displays.
    RefreshRequested,
    /// Caller may re-enable interactive controls.
    ControlsEnabled,
    /// The pipeline thread is done.
    Finished,
}

/// Console sink bridging command output into the event channel and the
/// per-session log.
struct ConsoleTee<'a> {
    events: &'a Sender<ProgressEvent>,
    session: Option<&'a SessionLog>,
}

impl ConsoleTee<'_> {
    fn line(&self, line: &str) {
        let _ = self
            .events
            .send(ProgressEvent::OutputLine(line.to_string()));
        if let Some(session) = self.session {
            session.append_line(line);
        }
    }
}

impl OutputSink for ConsoleTee<'_> {
    fn write_line(&self, line: &str) {
        self.line(line);
    }
}

/// Sequences one full upgrade run.
pub struct UpgradeOrchestrator {
    services: Services,
    distro: Distro,
    run_config: UpgradeRunConfig,
    events: Sender<ProgressEvent>,
}

impl UpgradeOrchestrator {
    #[must_use]
    pub const fn new(
        services: Services,
        distro: Distro,
        run_config: UpgradeRunConfig,
        events: Sender<ProgressEvent>,
    ) -> Self {
        Self {
            services,
            distro,
            run_config,
            events,
        }
    }

    /// Run the pipeline on a background thread.
    pub fn spawn(self) -> Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("buh-upgrade".to_string())
            .spawn(move || self.run())
            .map_err(|source| BuhError::io("buh-upgrade", source))
    }

    /// Run the pipeline to completion on the current thread.
    ///
    /// Emits `ControlsDisabled`/`ControlsEnabled` exactly once each, also
    /// around the no-update short-circuit.
    pub fn run(&self) {
        self.emit(ProgressEvent::ControlsDisabled);

        let session = self.open_session_log();
        let tee = ConsoleTee {
            events: &self.events,
            session: session.as_ref(),
        };

        if let Err(error) = self.pipeline(&tee) {
            self.services.log.error(error.code(), error.to_string());
            self.emit(ProgressEvent::StageFailed {
                stage: UpgradeStage::PreCheck,
                reason: error.to_string(),
            });
        }

        self.emit(ProgressEvent::ControlsEnabled);
        self.emit(ProgressEvent::Finished);
    }

    fn emit(&self, event: ProgressEvent) {
        let _ = self.events.send(event);
    }

    fn open_session_log(&self) -> Option<SessionLog> {
        if !self.services.settings.read().values().save_log_enabled() {
            return None;
        }
        match SessionLog::create_for_today(&self.services.paths.logs_dir) {
            Ok(log) => Some(log),
            Err(error) => {
                self.services.log.error(
                    error.code(),
                    format!("could not open the session log: {error}"),
                );
                None
            }
        }
    }

    fn pipeline(&self, tee: &ConsoleTee<'_>) -> Result<()> {
        tee.line("Checking for system updates.");
        tee.line("--------");
        self.emit(ProgressEvent::StageStarted {
            stage: UpgradeStage::PreCheck,
        });
        if !self.check_updates()? {
            self.services
                .log
                .info(EventKind::SystemUpToDate, self.distro.label());
            tee.line("Your system is up to date.");
            self.emit(ProgressEvent::UpToDate);
            return Ok(());
        }

        self.services
            .log
            .info(EventKind::UpgradeStarted, self.distro.label());
        tee.line("Starting system upgrading process. Please wait...");

        if self.run_config.take_snapshots {
            self.emit(ProgressEvent::StageStarted {
                stage: UpgradeStage::Snapshots,
            });
            tee.line("Creating snapshots and updating GRUB entries if needed...");
            self.snapshot_stage(tee)?;
        }

        self.emit(ProgressEvent::StageStarted {
            stage: UpgradeStage::SystemUpgrade,
        });
        tee.line("Upgrading the system. Please wait...");
        for argv in self.distro.upgrade_commands() {
            self.stage_command(UpgradeStage::SystemUpgrade, argv, true, tee);
        }

        if self.distro == Distro::Arch && self.run_config.include_aur {
            self.aur_stage(tee);
        }

        if self.run_config.include_snap {
            self.snap_stage(tee);
        }

        if self.run_config.remove_old_snapshots {
            self.emit(ProgressEvent::StageStarted {
                stage: UpgradeStage::Prune,
            });
            tee.line("Removing old snapshots and updating GRUB entries. Please wait...");
            self.prune_stage(tee)?;
        }

        self.services
            .log
            .info(EventKind::UpgradeFinished, self.distro.label());
        tee.line("System upgrading process finished.");
        self.emit(ProgressEvent::RefreshRequested);
        Ok(())
    }

    fn check_updates(&self) -> Result<bool> {
        if let Some(refresh) = self.distro.refresh_command() {
            let outcome = self.services.runner.run(refresh, true, None)?;
            if !outcome.success() {
                self.services.log.warn(
                    EventKind::StageFailed,
                    format!("repository refresh exited with status {:?}", outcome.status),
                );
            }
        }
        // The check command's exit status is unreliable (`pacman -Qu` and
        // `dnf check-update` are non-zero in ordinary situations); only the
        // output shape decides.
        let outcome = self
            .services
            .runner
            .run(self.distro.check_updates_command(), true, None)?;
        Ok(self.distro.has_pending_updates(outcome.text()))
    }

    fn snapshot_stage(&self, tee: &ConsoleTee<'_>) -> Result<()> {
        for subvolume in Subvolume::from_settings(&self.services)? {
            if let Err(error) = subvolume.create_snapshot(Some(tee)) {
                let reason = format!(
                    "snapshot of {} failed: {error}",
                    subvolume.origin()
                );
                tee.line(&reason);
                self.services.log.error(error.code(), reason.clone());
                self.emit(ProgressEvent::StageFailed {
                    stage: UpgradeStage::Snapshots,
                    reason,
                });
            }
        }
        Ok(())
    }

    fn aur_stage(&self, tee: &ConsoleTee<'_>) {
        self.emit(ProgressEvent::StageStarted {
            stage: UpgradeStage::Aur,
        });
        tee.line("Updating AUR packages if needed. Please wait...");
        for helper in AUR_HELPERS {
            match self.services.runner.binary_exists(helper.binary, false) {
                Ok(true) => {
                    // AUR helpers refuse to run as root.
                    self.stage_command(UpgradeStage::Aur, helper.upgrade, false, tee);
                    return;
                }
                Ok(false) => {}
                Err(error) => {
                    self.services.log.error(error.code(), error.to_string());
                    return;
                }
            }
        }
        // No helper installed: skip silently.
    }

    fn snap_stage(&self, tee: &ConsoleTee<'_>) {
        match self.services.runner.binary_exists(SNAP_BINARY, false) {
            Ok(true) => {
                self.emit(ProgressEvent::StageStarted {
                    stage: UpgradeStage::Snap,
                });
                tee.line("Updating snaps. Please wait...");
                self.stage_command(UpgradeStage::Snap, SNAP_REFRESH, true, tee);
            }
            Ok(false) => {}
            Err(error) => {
                self.services.log.error(error.code(), error.to_string());
            }
        }
    }

    fn prune_stage(&self, tee: &ConsoleTee<'_>) -> Result<()> {
        for subvolume in Subvolume::from_settings(&self.services)? {
            if let Err(error) = subvolume.delete_snapshots(Some(tee)) {
                let reason = format!("pruning {} failed: {error}", subvolume.origin());
                tee.line(&reason);
                self.services.log.error(error.code(), reason.clone());
                self.emit(ProgressEvent::StageFailed {
                    stage: UpgradeStage::Prune,
                    reason,
                });
            }
        }
        Ok(())
    }

    /// Run one stage command, converting failure into a logged event.
    fn stage_command(&self, stage: UpgradeStage, argv: &[&str], root: bool, tee: &ConsoleTee<'_>) {
        match self.services.runner.run(argv, root, Some(tee)) {
            Ok(outcome) if outcome.success() => {}
            Ok(outcome) => {
                let reason = format!("{} exited with status {:?}", argv[0], outcome.status);
                self.services
                    .log
                    .warn(EventKind::StageFailed, reason.clone());
                self.emit(ProgressEvent::StageFailed { stage, reason });
            }
            Err(error) => {
                let reason = error.to_string();
                self.services.log.error(error.code(), reason.clone());
                self.emit(ProgressEvent::StageFailed { stage, reason });
            }
        }
    }
}
