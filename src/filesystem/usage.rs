//! BTRFS filesystem discovery and usage figures.
//!
//! Everything here is parsed from the real tooling's output: `btrfs
//! filesystem show [--mounted]` for filesystems and their devices,
//! `findmnt -nt btrfs` for mount points, and `btrfs filesystem usage` for
//! size/allocation figures. Sizes stay in the tool's own `30.00GiB` notation;
//! percentages are computed through byte conversion (1024-based units).

#![allow(missing_docs)]

use crate::core::errors::{BuhError, Result};
use crate::platform::runner::CommandRunner;

const BTRFS_SHOW_MOUNTED: &[&str] = &["btrfs", "filesystem", "show", "--mounted"];
const BTRFS_SHOW: &[&str] = &["btrfs", "filesystem", "show"];
const FINDMNT_BTRFS: &[&str] = &["findmnt", "-nt", "btrfs"];
const BTRFS_USAGE: &[&str] = &["btrfs", "filesystem", "usage"];

const DEVICE_SIZE_MARKER: &str = "Device size:";
const DEVICE_ALLOCATED_MARKER: &str = "Device allocated:";

/// 1024-based size units used by the btrfs tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    B,
    KiB,
    MiB,
    GiB,
    TiB,
}

impl SizeUnit {
    fn parse(text: &str) -> Result<Self> {
        match text {
            "B" => Ok(Self::B),
            "KiB" => Ok(Self::KiB),
            "MiB" => Ok(Self::MiB),
            "GiB" => Ok(Self::GiB),
            "TiB" => Ok(Self::TiB),
            other => Err(BuhError::UsageParse {
                details: format!("unknown size unit {other:?}"),
            }),
        }
    }

    const fn factor(self) -> f64 {
        match self {
            Self::B => 1.0,
            Self::KiB => 1024.0,
            Self::MiB => 1024.0 * 1024.0,
            Self::GiB => 1024.0 * 1024.0 * 1024.0,
            Self::TiB => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        }
    }
}

/// Split `30.00GiB` into number and unit.
pub fn parse_size(text: &str) -> Result<(f64, SizeUnit)> {
    let trimmed = text.trim();
    let split_at = trimmed
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| BuhError::UsageParse {
            details: format!("no unit in size {trimmed:?}"),
        })?;
    let (number_str, unit_str) = trimmed.split_at(split_at);
    let number: f64 = number_str.parse().map_err(|_| BuhError::UsageParse {
        details: format!("invalid size number {number_str:?}"),
    })?;
    Ok((number, SizeUnit::parse(unit_str)?))
}

/// Bytes represented by a parsed size.
#[must_use]
pub fn to_bytes(number: f64, unit: SizeUnit) -> f64 {
    number * unit.factor()
}

/// Integer percentage of `part` over `total` (`3.00GiB` of `30.00GiB` → 10).
pub fn percentage(total: &str, part: &str) -> Result<i64> {
    let (total_number, total_unit) = parse_size(total)?;
    let (part_number, part_unit) = parse_size(part)?;
    let total_bytes = to_bytes(total_number, total_unit);
    if total_bytes == 0.0 {
        return Ok(0);
    }
    let part_bytes = to_bytes(part_number, part_unit);
    #[allow(clippy::cast_possible_truncation)]
    let percent = ((part_bytes * 100.0) / total_bytes) as i64;
    Ok(percent)
}

/// One filesystem reported by `btrfs filesystem show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesystemId {
    pub uuid: String,
    pub label: Option<String>,
}

/// UUIDs (and labels) from `btrfs filesystem show` output.
#[must_use]
pub fn parse_filesystem_ids(output: &str) -> Vec<FilesystemId> {
    let mut ids = Vec::new();
    for line in output.lines() {
        let Some((label_part, uuid_part)) = line.split_once("uuid:") else {
            continue;
        };
        let label = label_part
            .trim()
            .strip_prefix("Label:")
            .map(str::trim)
            .filter(|text| *text != "none")
            .map(|text| text.trim_matches('\'').to_string());
        ids.push(FilesystemId {
            uuid: uuid_part.trim().to_string(),
            label,
        });
    }
    ids
}

/// Device paths belonging to `uuid` within `btrfs filesystem show` output.
#[must_use]
pub fn parse_devices(output: &str, uuid: &str) -> Vec<String> {
    let mut devices = Vec::new();
    let mut in_filesystem = false;
    for line in output.lines() {
        if line.contains("uuid:") {
            if in_filesystem {
                break;
            }
            in_filesystem = line.contains(uuid);
            continue;
        }
        if in_filesystem
            && line.contains("devid")
            && let Some(path_start) = line.find('/')
        {
            devices.push(line[path_start..].trim().to_string());
        }
    }
    devices
}

/// Mount points from `findmnt -nt btrfs` whose source is one of `devices`.
#[must_use]
pub fn parse_mounted_points(findmnt_output: &str, devices: &[String]) -> Vec<String> {
    let mut points = Vec::new();
    for line in findmnt_output.lines() {
        let mut columns = line.split_whitespace();
        let Some(target) = columns.next() else {
            continue;
        };
        let Some(source) = columns.next() else {
            continue;
        };
        // findmnt prints subvolume sources as /dev/sda2[/subvol].
        let device = source.split('[').next().unwrap_or(source);
        if devices.iter().any(|known| known == device) {
            points.push(target.to_string());
        }
    }
    points
}

/// Figures from `btrfs filesystem usage`, sizes in the tool's own notation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageFigures {
    pub total_size: String,
    pub total_allocated: String,
    pub data_size: String,
    pub data_used: String,
    pub data_percentage: i64,
    pub metadata_size: String,
    pub metadata_used: String,
    pub metadata_percentage: i64,
    pub system_size: String,
    pub system_used: String,
    pub system_percentage: i64,
}

impl Default for UsageFigures {
    fn default() -> Self {
        Self {
            total_size: "0B".to_string(),
            total_allocated: "0B".to_string(),
            data_size: "0B".to_string(),
            data_used: "0B".to_string(),
            data_percentage: 0,
            metadata_size: "0B".to_string(),
            metadata_used: "0B".to_string(),
            metadata_percentage: 0,
            system_size: "0B".to_string(),
            system_used: "0B".to_string(),
            system_percentage: 0,
        }
    }
}

fn size_used_pair(line: &str) -> Result<(String, String)> {
    let size = line
        .split_once("Size:")
        .map(|(_, rest)| rest)
        .and_then(|rest| rest.split(',').next())
        .map(str::trim)
        .ok_or_else(|| BuhError::UsageParse {
            details: format!("no Size: field in line {line:?}"),
        })?;
    let used = line
        .split_once("Used:")
        .map(|(_, rest)| rest)
        .and_then(|rest| rest.split_whitespace().next())
        .map(|text| text.trim_end_matches(','))
        .ok_or_else(|| BuhError::UsageParse {
            details: format!("no Used: field in line {line:?}"),
        })?;
    Ok((size.to_string(), used.to_string()))
}

/// Parse `btrfs filesystem usage` output.
///
/// Profile names vary (`Data,single`, `Metadata,DUP`, ...), so sections are
/// matched on the part before the comma.
pub fn parse_usage(output: &str) -> Result<UsageFigures> {
    let mut figures = UsageFigures::default();
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(DEVICE_SIZE_MARKER) {
            figures.total_size = rest.trim().to_string();
        } else if let Some(rest) = trimmed.strip_prefix(DEVICE_ALLOCATED_MARKER) {
            figures.total_allocated = rest.trim().to_string();
        } else if trimmed.starts_with("Data,") {
            let (size, used) = size_used_pair(trimmed)?;
            figures.data_percentage = percentage(&size, &used)?;
            figures.data_size = size;
            figures.data_used = used;
        } else if trimmed.starts_with("Metadata,") {
            let (size, used) = size_used_pair(trimmed)?;
            figures.metadata_percentage = percentage(&size, &used)?;
            figures.metadata_size = size;
            figures.metadata_used = used;
        } else if trimmed.starts_with("System,") {
            let (size, used) = size_used_pair(trimmed)?;
            figures.system_percentage = percentage(&size, &used)?;
            figures.system_size = size;
            figures.system_used = used;
        }
    }
    Ok(figures)
}

/// A discovered BTRFS filesystem with its usage figures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtrfsFilesystem {
    pub uuid: String,
    pub label: Option<String>,
    pub devices: Vec<String>,
    pub mounted_points: Vec<String>,
    pub usage: Option<UsageFigures>,
}

/// Discover mounted BTRFS filesystems and collect their usage figures.
pub fn probe_filesystems(runner: &dyn CommandRunner) -> Result<Vec<BtrfsFilesystem>> {
    let show = runner.run(BTRFS_SHOW_MOUNTED, true, None)?;
    let findmnt = runner.run(FINDMNT_BTRFS, true, None)?;

    let mut filesystems = Vec::new();
    for id in parse_filesystem_ids(show.text()) {
        let devices = parse_devices(show.text(), &id.uuid);
        let mounted_points = parse_mounted_points(findmnt.text(), &devices);
        let usage = match mounted_points.first() {
            Some(point) => {
                let argv: Vec<&str> = BTRFS_USAGE
                    .iter()
                    .copied()
                    .chain([point.as_str()])
                    .collect();
                let outcome = runner.run(&argv, true, None)?;
                Some(parse_usage(outcome.text())?)
            }
            None => None,
        };
        filesystems.push(BtrfsFilesystem {
            uuid: id.uuid,
            label: id.label,
            devices,
            mounted_points,
            usage,
        });
    }
    Ok(filesystems)
}

/// UUIDs of all (or only mounted) BTRFS filesystems.
pub fn filesystem_uuids(runner: &dyn CommandRunner, mounted_only: bool) -> Result<Vec<String>> {
    let argv = if mounted_only {
        BTRFS_SHOW_MOUNTED
    } else {
        BTRFS_SHOW
    };
    let outcome = runner.run(argv, true, None)?;
    Ok(parse_filesystem_ids(outcome.text())
        .into_iter()
        .map(|id| id.uuid)
        .collect())
}
