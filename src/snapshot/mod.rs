//! Snapshot lifecycle: subvolume model, retention, fstab patching, root
//! consolidation, and snapshot diffs.

pub mod consolidate;
pub mod diff;
pub mod fstab;
pub mod retention;
pub mod subvolume;

use crate::core::errors::Result;
use crate::platform::runner::{CommandOutcome, CommandRunner, OutputSink};

/// Bootloader menu regeneration (grub-btrfs integration).
pub const GRUB_MKCONFIG: &[&str] = &["grub-mkconfig", "-o", "/boot/grub/grub.cfg"];

/// Regenerate GRUB menu entries so snapshots stay independently bootable.
pub fn regenerate_grub_entries(
    runner: &dyn CommandRunner,
    sink: Option<&dyn OutputSink>,
) -> Result<CommandOutcome> {
    runner.run(GRUB_MKCONFIG, true, sink)
}
