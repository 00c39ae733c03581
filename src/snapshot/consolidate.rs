//! Root-snapshot consolidation: detect a boot from an alternate snapshot and
//! promote that snapshot to be the new default root.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::core::errors::{BuhError, Result};
use crate::logger::activity::EventKind;
use crate::platform::runner::OutputSink;
use crate::services::Services;
use crate::snapshot::fstab;
use crate::snapshot::regenerate_grub_entries;
use crate::snapshot::subvolume::{BTRFS_SNAPSHOT_RW, Subvolume, real_subvolume_path};

/// Result of the startup root check.
pub enum RootCheck {
    /// Mounted root matches the recorded default (or nothing recorded yet).
    Consolidated,
    /// Booted from an alternate snapshot; a user decision is required.
    NeedsConsolidation(ConsolidationCandidate),
}

/// The booted snapshot and the subvolume it would replace.
pub struct ConsolidationCandidate {
    /// Subvolume path parsed from the mount table.
    pub mounted_subvol: String,
    /// The snapshot the system was booted from.
    pub snapshot_path: PathBuf,
    /// The configured root subvolume owning that snapshot.
    pub root_subvolume: Subvolume,
}

/// Closed set of consolidation outcomes, each with fixed user-facing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsolidationOutcome {
    Success,
    FstabPatchFailed,
    OriginNotEmpty,
    UserDeclined,
}

impl ConsolidationOutcome {
    /// Stable message shown to the user (never raw command output).
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Success => {
                "The booted snapshot is now the default root subvolume. \
                 Reboot to finish the consolidation."
            }
            Self::FstabPatchFailed => {
                "The new root subvolume was created but its fstab could not be \
                 updated. Review /etc/fstab in the new root before rebooting."
            }
            Self::OriginNotEmpty => {
                "The current root subvolume contains nested subvolumes and \
                 cannot be replaced."
            }
            Self::UserDeclined => {
                "Running from an unconsolidated snapshot is unsafe. \
                 The application will close."
            }
        }
    }
}

/// Subvolume path of the entry mounted on `/`, from raw `mount` output.
fn mounted_root_subvol(mount_output: &str) -> Option<String> {
    let entry = Regex::new(r"(?m)^\S+ on / type btrfs \(([^)]*)\)").ok()?;
    let options = entry.captures(mount_output)?.get(1)?.as_str();
    options
        .split(',')
        .find_map(|option| option.strip_prefix("subvol="))
        .map(|value| value.trim().to_string())
}

/// Detects and repairs a root mounted from a non-default snapshot.
pub struct RootConsolidator {
    services: Services,
}

impl RootConsolidator {
    #[must_use]
    pub const fn new(services: Services) -> Self {
        Self { services }
    }

    /// Compare the mounted root subvolume against the recorded default.
    ///
    /// With nothing recorded yet there is nothing to check. A mismatch with
    /// no matching snapshot among the configured subvolumes is logged and
    /// reported as `Consolidated`, since no repair is actionable.
    pub fn check_root_snapshot(&self, subvolumes: &[Subvolume]) -> Result<RootCheck> {
        let recorded = self
            .services
            .settings
            .read()
            .values()
            .path_to_consolidate()
            .map(ToString::to_string);
        let Some(recorded) = recorded else {
            return Ok(RootCheck::Consolidated);
        };

        let outcome = self.services.runner.run(&["mount"], false, None)?;
        let Some(mounted) = mounted_root_subvol(outcome.text()) else {
            return Err(BuhError::MountParse {
                details: "no btrfs entry for / with a subvol option in mount output".to_string(),
            });
        };

        let mounted_id = mounted.trim_start_matches('/');
        if mounted_id == recorded.trim_start_matches('/') {
            self.services.log.info(
                EventKind::ConsolidationChecked,
                format!("root is the recorded default ({recorded})"),
            );
            return Ok(RootCheck::Consolidated);
        }

        for subvolume in subvolumes {
            for snapshot in subvolume.list_snapshots()? {
                if snapshot.to_string_lossy().contains(mounted_id) {
                    self.services.log.warn(
                        EventKind::ConsolidationChecked,
                        format!("booted from alternate snapshot {mounted}"),
                    );
                    return Ok(RootCheck::NeedsConsolidation(ConsolidationCandidate {
                        mounted_subvol: mounted,
                        snapshot_path: snapshot,
                        root_subvolume: subvolume.clone(),
                    }));
                }
            }
        }

        self.services.log.warn(
            EventKind::ConsolidationChecked,
            format!("booted from {mounted} but no configured snapshot matches it"),
        );
        Ok(RootCheck::Consolidated)
    }

    /// Carry out (or decline) the consolidation the user was asked about.
    pub fn resolve(
        &self,
        candidate: &ConsolidationCandidate,
        approved: bool,
        sink: Option<&dyn OutputSink>,
    ) -> Result<ConsolidationOutcome> {
        if !approved {
            self.services.log.warn(
                EventKind::ConsolidationResolved,
                "user declined consolidation",
            );
            return Ok(ConsolidationOutcome::UserDeclined);
        }

        let root = &candidate.root_subvolume;
        match root.delete_origin() {
            Ok(()) => {}
            Err(BuhError::SnapshotNotEmpty { path }) => {
                self.services.log.error(
                    "BUH-2101",
                    format!("root subvolume {} has nested subvolumes", path.display()),
                );
                return Ok(ConsolidationOutcome::OriginNotEmpty);
            }
            Err(other) => return Err(other),
        }

        let origin = root.origin().trim_end_matches('/');
        let snapshot_str = candidate.snapshot_path.to_string_lossy().into_owned();
        let argv: Vec<&str> = BTRFS_SNAPSHOT_RW
            .iter()
            .copied()
            .chain([snapshot_str.as_str(), origin])
            .collect();
        let outcome = self.services.runner.run(&argv, true, sink)?;
        if !outcome.success() {
            return Err(BuhError::Runtime {
                details: format!(
                    "cloning {snapshot_str} onto {origin} exited with status {:?}",
                    outcome.status
                ),
            });
        }

        // The clone's fstab still references the booted snapshot; rewire it
        // to the new root's real path.
        let booted_real = match real_subvolume_path(self.services.runner.as_ref(), &snapshot_str) {
            Ok(path) => path,
            Err(error) => {
                self.services.log.error(error.code(), error.to_string());
                return Ok(ConsolidationOutcome::FstabPatchFailed);
            }
        };
        let new_real = match real_subvolume_path(self.services.runner.as_ref(), origin) {
            Ok(path) => path,
            Err(error) => {
                self.services.log.error(error.code(), error.to_string());
                return Ok(ConsolidationOutcome::FstabPatchFailed);
            }
        };

        match fstab::patch_snapshot_fstab(
            self.services.runner.as_ref(),
            Path::new(origin),
            &booted_real,
            &new_real,
            sink,
        ) {
            Ok(()) => {
                if self.services.settings.read().values().grub_btrfs_enabled()
                    && let Err(error) = regenerate_grub_entries(self.services.runner.as_ref(), sink)
                {
                    self.services
                        .log
                        .error(error.code(), format!("GRUB regeneration failed: {error}"));
                }
                if let Err(error) = self
                    .services
                    .settings
                    .write()
                    .set_path_to_consolidate(&new_real)
                {
                    self.services.log.error(
                        error.code(),
                        format!("could not record the new root path: {error}"),
                    );
                }
                self.services.log.info(
                    EventKind::ConsolidationResolved,
                    format!("{snapshot_str} consolidated onto {origin}"),
                );
                Ok(ConsolidationOutcome::Success)
            }
            Err(error) => {
                self.services.log.error(error.code(), error.to_string());
                Ok(ConsolidationOutcome::FstabPatchFailed)
            }
        }
    }
}
