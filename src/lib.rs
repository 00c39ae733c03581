#![forbid(unsafe_code)]

//! BTRFS Upgrade Helper (buh) — snapshot lifecycle and upgrade orchestration.
//!
//! Three responsibilities:
//! 1. **Snapshot lifecycle** — date-and-ordinal snapshot naming, retention
//!    pruning, and root-snapshot consolidation after a boot from an
//!    alternate snapshot
//! 2. **Upgrade orchestration** — snapshots taken before a full package
//!    upgrade (pacman/apt/zypper/dnf, plus AUR helpers and snap), pruned and
//!    GRUB-refreshed after it
//! 3. **Update checking** — a background startup poll that surfaces pending
//!    updates without ever applying them
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use btrfs_upgrade_helper::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use btrfs_upgrade_helper::core::settings::SettingsStore;
//! use btrfs_upgrade_helper::snapshot::subvolume::Subvolume;
//! ```

pub mod prelude;

pub mod core;
pub mod filesystem;
pub mod logger;
pub mod platform;
pub mod services;
pub mod snapshot;
pub mod upgrade;
