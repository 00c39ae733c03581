//! fstab patching with explicit subvolume-reference matching.
//!
//! Matching semantics (in order):
//! 1. Only uncommented, non-blank lines carrying a `subvol=` mount option are
//!    considered.
//! 2. Exact pass: the first entry whose `subvol=` value equals the recorded
//!    root path, leading-`/` insensitive.
//! 3. Longest-prefix pass: trailing segments are stripped from the recorded
//!    path one at a time; the first entry whose value sits under the longest
//!    surviving prefix wins.
//!
//! The rewrite is confined to the matched line's `subvol=` value and applied
//! with a line-addressed `sed -i` run as root. Because the substituted value
//! is the one parsed from the line, the sed pattern is guaranteed to match.

use std::fs;
use std::path::Path;

use crate::core::errors::{BuhError, Result};
use crate::platform::runner::{CommandRunner, OutputSink};

/// Location of the entry to rewrite inside an fstab file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabMatch {
    /// 1-based line number (sed addressing).
    pub line_number: usize,
    /// The `subvol=` value exactly as written on the matched line.
    pub subvol_value: String,
}

fn normalized(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// `subvol=` mount-option value of one fstab line, if present.
fn subvol_option_value(line: &str) -> Option<&str> {
    let options = line.split_whitespace().nth(3)?;
    options
        .split(',')
        .find_map(|option| option.strip_prefix("subvol="))
}

/// The recorded path followed by progressively shortened prefixes, longest
/// first.
#[must_use]
pub fn prefix_candidates(path: &str) -> Vec<String> {
    let segments: Vec<&str> = normalized(path)
        .trim_end_matches('/')
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    (1..=segments.len())
        .rev()
        .map(|length| segments[..length].join("/"))
        .collect()
}

/// Find the fstab entry referencing the recorded root subvolume.
#[must_use]
pub fn find_root_reference(content: &str, recorded_root: &str) -> Option<FstabMatch> {
    let entries: Vec<(usize, &str)> = content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let trimmed = line.trim_start();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .filter_map(|(index, line)| subvol_option_value(line).map(|value| (index + 1, value)))
        .collect();

    let target = normalized(recorded_root).trim_end_matches('/');
    for (line_number, value) in &entries {
        if normalized(value) == target {
            return Some(FstabMatch {
                line_number: *line_number,
                subvol_value: (*value).to_string(),
            });
        }
    }

    for candidate in prefix_candidates(recorded_root) {
        for (line_number, value) in &entries {
            let value_normalized = normalized(value);
            if value_normalized == candidate
                || value_normalized.starts_with(&format!("{candidate}/"))
            {
                return Some(FstabMatch {
                    line_number: *line_number,
                    subvol_value: (*value).to_string(),
                });
            }
        }
    }
    None
}

/// New `subvol=` value preserving the leading-`/` style of the existing one.
#[must_use]
pub(crate) fn replacement_value(existing: &str, new_subvol: &str) -> String {
    if existing.starts_with('/') {
        format!("/{}", normalized(new_subvol))
    } else {
        normalized(new_subvol).to_string()
    }
}

/// Rewrite the root reference inside a snapshot's `etc/fstab`.
///
/// The snapshot itself is never rolled back on failure; callers log the
/// error and leave the partially-patched state for the user.
pub fn patch_snapshot_fstab(
    runner: &dyn CommandRunner,
    snapshot_root: &Path,
    recorded_root: &str,
    new_subvol: &str,
    sink: Option<&dyn OutputSink>,
) -> Result<()> {
    let fstab_path = snapshot_root.join("etc/fstab");
    let content = fs::read_to_string(&fstab_path).map_err(|source| BuhError::FstabPatchFailed {
        path: fstab_path.clone(),
        reason: format!("unreadable: {source}"),
    })?;

    let Some(found) = find_root_reference(&content, recorded_root) else {
        return Err(BuhError::FstabPatchFailed {
            path: fstab_path,
            reason: format!("no uncommented entry references subvolume {recorded_root}"),
        });
    };

    let new_value = replacement_value(&found.subvol_value, new_subvol);
    let script = format!(
        "{}s|subvol={}|subvol={}|",
        found.line_number, found.subvol_value, new_value
    );
    let fstab_str = fstab_path.to_string_lossy().into_owned();
    let outcome = runner.run(&["sed", "-i", &script, &fstab_str], true, sink)?;
    if !outcome.success() {
        return Err(BuhError::FstabPatchFailed {
            path: fstab_path,
            reason: format!("sed exited with status {:?}", outcome.status),
        });
    }
    Ok(())
}
