//! Retention policy: how many same-prefix snapshots a prune pass deletes.

/// Retention sentinel meaning "never delete".
///
/// Kept as the integer `-1` (not a separate boolean) so existing
/// configuration files keep their meaning.
pub const KEEP_FOREVER: i64 = -1;

/// Number of oldest snapshots to delete given `existing` snapshots and a
/// keep-count. `KEEP_FOREVER` always yields zero.
#[must_use]
pub fn snapshots_to_delete(existing: usize, keep: i64) -> usize {
    let Ok(keep) = usize::try_from(keep) else {
        return 0;
    };
    existing.saturating_sub(keep)
}
