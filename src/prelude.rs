//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use btrfs_upgrade_helper::prelude::*;
//! ```

// Core
pub use crate::core::errors::{BuhError, Result};
pub use crate::core::paths::AppPaths;
pub use crate::core::settings::{Settings, SettingsStore, SharedSettings, SubvolumeSpec, shared};
pub use crate::services::Services;

// Platform
pub use crate::platform::distro::Distro;
pub use crate::platform::runner::{
    CommandOutcome, CommandRunner, MockCommandRunner, OutputSink, SystemCommandRunner,
};

// Snapshot lifecycle
pub use crate::snapshot::consolidate::{
    ConsolidationCandidate, ConsolidationOutcome, RootCheck, RootConsolidator,
};
pub use crate::snapshot::retention::{KEEP_FOREVER, snapshots_to_delete};
pub use crate::snapshot::subvolume::Subvolume;

// Upgrade orchestration
pub use crate::upgrade::checker::{UpdateChecker, UpdateNotice};
pub use crate::upgrade::orchestrator::{
    ProgressEvent, UpgradeOrchestrator, UpgradeRunConfig, UpgradeStage,
};

// Logging
pub use crate::logger::activity::{ActivityHandle, ActivityLogConfig, spawn_logger};
pub use crate::logger::session::SessionLog;
