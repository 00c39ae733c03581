//! Linux distribution detection and package-manager command tables.
//!
//! The argv tables are compatibility-critical: they must match what the
//! supported distributions actually ship. Pending-update heuristics mirror
//! each tool's output shape (`pacman -Qu` prints nothing when current;
//! `apt`/`zypper`/`dnf` print fixed headers before the package lines).

use crate::core::errors::{BuhError, Result};
use crate::platform::runner::CommandRunner;

/// Supported distribution families, keyed by their package manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distro {
    Arch,
    Debian,
    Suse,
    Fedora,
}

/// Detection probe order. SUSE first: `zypper` systems may also carry a
/// foreign `apt` shim, while the reverse does not happen.
const PROBE_ORDER: [Distro; 4] = [Distro::Suse, Distro::Debian, Distro::Arch, Distro::Fedora];

impl Distro {
    /// The package-manager binary that identifies this distribution.
    #[must_use]
    pub const fn package_manager(self) -> &'static str {
        match self {
            Self::Arch => "pacman",
            Self::Debian => "apt",
            Self::Suse => "zypper",
            Self::Fedora => "dnf",
        }
    }

    /// Human-facing distribution label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Arch => "Arch",
            Self::Debian => "Debian",
            Self::Suse => "SUSE",
            Self::Fedora => "Fedora",
        }
    }

    /// Probe installed package managers; no hit is a startup hard stop.
    pub fn detect(runner: &dyn CommandRunner) -> Result<Self> {
        for distro in PROBE_ORDER {
            if runner.binary_exists(distro.package_manager(), false)? {
                return Ok(distro);
            }
        }
        Err(BuhError::DistroUndetected)
    }

    /// Repository refresh run before checking for updates (Arch only).
    #[must_use]
    pub const fn refresh_command(self) -> Option<&'static [&'static str]> {
        match self {
            Self::Arch => Some(&["pacman", "-Sy"]),
            Self::Debian | Self::Suse | Self::Fedora => None,
        }
    }

    /// Command listing pending updates.
    #[must_use]
    pub const fn check_updates_command(self) -> &'static [&'static str] {
        match self {
            Self::Arch => &["pacman", "-Qu"],
            Self::Debian => &["apt", "list", "--upgradable"],
            Self::Suse => &["zypper", "list-updates"],
            Self::Fedora => &["dnf", "check-update"],
        }
    }

    /// Upgrade command sequence, run in order (Debian updates indexes first).
    #[must_use]
    pub const fn upgrade_commands(self) -> &'static [&'static [&'static str]] {
        match self {
            Self::Arch => &[&["pacman", "-Syu", "--noconfirm"]],
            Self::Debian => &[&["apt", "update"], &["apt", "upgrade", "-y"]],
            Self::Suse => &[&["zypper", "-n", "update"]],
            Self::Fedora => &[&["dnf", "upgrade", "--refresh", "--assumeyes"]],
        }
    }

    /// Decide from the check command's output whether updates are pending.
    #[must_use]
    pub fn has_pending_updates(self, output: &str) -> bool {
        let lines = output.lines().filter(|line| !line.trim().is_empty()).count();
        match self {
            Self::Arch => lines > 0,
            Self::Debian | Self::Fedora => lines > 1,
            Self::Suse => lines > 3,
        }
    }
}

/// One AUR helper and its unprivileged upgrade invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AurHelper {
    pub binary: &'static str,
    pub upgrade: &'static [&'static str],
}

/// AUR helpers in probe priority order.
pub const AUR_HELPERS: &[AurHelper] = &[
    AurHelper {
        binary: "yay",
        upgrade: &["yay", "-Syua", "--noconfirm"],
    },
    AurHelper {
        binary: "trizen",
        upgrade: &["trizen", "-Syua", "--noconfirm"],
    },
    AurHelper {
        binary: "yaourt",
        upgrade: &["yaourt", "-Syua", "--noconfirm"],
    },
];

/// Snap integration.
pub const SNAP_BINARY: &str = "snap";
/// Snap upgrade invocation (root).
pub const SNAP_REFRESH: &[&str] = &["snap", "refresh"];
