//! Settings store: TOML file carrying the legacy key set, saved on every mutation.
//!
//! Key names and encodings are kept byte-compatible with existing
//! configuration files: boolean knobs are 0/1 integers, the four subvolume
//! fields are `|`-delimited parallel lists, and
//! `path_to_consolidate_root_snapshot` uses `"0"` as its unset sentinel.

#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::errors::{BuhError, Result};
use crate::core::paths::AppPaths;
use crate::snapshot::retention::KEEP_FOREVER;

/// Sentinel meaning "never recorded" for the consolidation path.
pub const UNSET_SENTINEL: &str = "0";

const LIST_SEPARATOR: char = '|';

/// User-facing settings model. Field names are the on-disk key names.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub aur_repository: i64,
    pub check_at_startup: i64,
    pub snap_packages: i64,
    pub grub_btrfs: i64,
    pub save_log: i64,
    pub path_to_consolidate_root_snapshot: String,
    pub subvolumes_orig: String,
    pub subvolumes_dest: String,
    pub subvolumes_prefix: String,
    pub subvolumes_snapshots_to_keep: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            aur_repository: 0,
            check_at_startup: 0,
            snap_packages: 0,
            grub_btrfs: 0,
            save_log: 1,
            path_to_consolidate_root_snapshot: UNSET_SENTINEL.to_string(),
            subvolumes_orig: String::new(),
            subvolumes_dest: String::new(),
            subvolumes_prefix: String::new(),
            subvolumes_snapshots_to_keep: String::new(),
        }
    }
}

/// One configured subvolume, decoded from the parallel lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubvolumeSpec {
    pub origin: String,
    pub destination: String,
    pub prefix: String,
    pub snapshots_to_keep: i64,
}

impl Settings {
    #[must_use]
    pub const fn aur_enabled(&self) -> bool {
        self.aur_repository != 0
    }

    #[must_use]
    pub const fn check_at_startup_enabled(&self) -> bool {
        self.check_at_startup != 0
    }

    #[must_use]
    pub const fn snap_enabled(&self) -> bool {
        self.snap_packages != 0
    }

    #[must_use]
    pub const fn grub_btrfs_enabled(&self) -> bool {
        self.grub_btrfs != 0
    }

    #[must_use]
    pub const fn save_log_enabled(&self) -> bool {
        self.save_log != 0
    }

    /// Recorded default-root subvolume path, `None` while never recorded.
    #[must_use]
    pub fn path_to_consolidate(&self) -> Option<&str> {
        let raw = self.path_to_consolidate_root_snapshot.as_str();
        if raw.is_empty() || raw == UNSET_SENTINEL {
            None
        } else {
            Some(raw)
        }
    }

    /// Decode the `|`-delimited parallel lists into subvolume specs.
    pub fn subvolume_specs(&self) -> Result<Vec<SubvolumeSpec>> {
        if self.subvolumes_orig.is_empty() {
            return Ok(Vec::new());
        }

        let origins: Vec<&str> = self.subvolumes_orig.split(LIST_SEPARATOR).collect();
        let destinations: Vec<&str> = self.subvolumes_dest.split(LIST_SEPARATOR).collect();
        let prefixes: Vec<&str> = self.subvolumes_prefix.split(LIST_SEPARATOR).collect();
        let keeps: Vec<&str> = self
            .subvolumes_snapshots_to_keep
            .split(LIST_SEPARATOR)
            .collect();

        if origins.len() != destinations.len()
            || origins.len() != prefixes.len()
            || origins.len() != keeps.len()
        {
            return Err(BuhError::InvalidConfig {
                details: format!(
                    "subvolume lists have mismatched lengths: {} origins, {} destinations, \
                     {} prefixes, {} retention counts",
                    origins.len(),
                    destinations.len(),
                    prefixes.len(),
                    keeps.len()
                ),
            });
        }

        let mut specs = Vec::with_capacity(origins.len());
        for index in 0..origins.len() {
            let keep: i64 = keeps[index]
                .trim()
                .parse()
                .map_err(|_| BuhError::InvalidConfig {
                    details: format!(
                        "invalid retention count {:?} for subvolume {}",
                        keeps[index], origins[index]
                    ),
                })?;
            if keep < KEEP_FOREVER {
                return Err(BuhError::InvalidConfig {
                    details: format!(
                        "retention count {keep} for subvolume {} is below the keep-forever \
                         sentinel ({KEEP_FOREVER})",
                        origins[index]
                    ),
                });
            }
            specs.push(SubvolumeSpec {
                origin: origins[index].to_string(),
                destination: destinations[index].to_string(),
                prefix: prefixes[index].to_string(),
                snapshots_to_keep: keep,
            });
        }
        Ok(specs)
    }

    /// Re-encode subvolume specs into the parallel lists.
    pub fn encode_subvolumes(&mut self, specs: &[SubvolumeSpec]) {
        let join = |f: &dyn Fn(&SubvolumeSpec) -> String| -> String {
            specs
                .iter()
                .map(|spec| f(spec))
                .collect::<Vec<_>>()
                .join("|")
        };
        self.subvolumes_orig = join(&|spec| spec.origin.clone());
        self.subvolumes_dest = join(&|spec| spec.destination.clone());
        self.subvolumes_prefix = join(&|spec| spec.prefix.clone());
        self.subvolumes_snapshots_to_keep = join(&|spec| spec.snapshots_to_keep.to_string());
    }

    fn validate(&self) -> Result<()> {
        self.subvolume_specs().map(|_| ())
    }
}

/// Pairs of configured prefixes where one is a substring of the other.
///
/// Snapshot ownership is decided by prefix-substring matching, so overlapping
/// prefixes can claim each other's snapshots. Surfaced as a warning, not an
/// error, to keep existing configurations loadable.
#[must_use]
pub fn overlapping_prefixes(specs: &[SubvolumeSpec]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (index, left) in specs.iter().enumerate() {
        for right in &specs[index + 1..] {
            if left.prefix.contains(&right.prefix) || right.prefix.contains(&left.prefix) {
                pairs.push((left.prefix.clone(), right.prefix.clone()));
            }
        }
    }
    pairs
}

/// File-backed settings with load-at-startup / save-on-mutation lifecycle.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    values: Settings,
}

impl SettingsStore {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        AppPaths::default().config_file
    }

    /// Load settings from the default or an explicit path.
    ///
    /// A missing file is only an error when the path was given explicitly;
    /// the default path falls back to defaults so first runs work unconfigured.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let values = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf)
                .map_err(|source| BuhError::io(&path_buf, source))?;
            let parsed: Settings = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(BuhError::MissingConfig { path: path_buf });
        } else {
            Settings::default()
        };

        values.validate()?;
        Ok(Self {
            path: path_buf,
            values,
        })
    }

    /// Store with explicit initial values, persisted to `path` on mutation.
    #[must_use]
    pub const fn with_values(path: PathBuf, values: Settings) -> Self {
        Self { path, values }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn values(&self) -> &Settings {
        &self.values
    }

    /// Apply a mutation, validate, and persist in one step.
    pub fn update<F>(&mut self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Settings),
    {
        let mut candidate = self.values.clone();
        mutate(&mut candidate);
        candidate.validate()?;
        self.values = candidate;
        self.store()
    }

    /// Record the resolved default-root subvolume path.
    pub fn set_path_to_consolidate(&mut self, value: &str) -> Result<()> {
        self.update(|settings| {
            settings.path_to_consolidate_root_snapshot = value.to_string();
        })
    }

    /// Replace the configured subvolume list.
    pub fn set_subvolumes(&mut self, specs: &[SubvolumeSpec]) -> Result<()> {
        self.update(|settings| settings.encode_subvolumes(specs))
    }

    /// Persist using atomic rename for crash safety.
    pub fn store(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| BuhError::io(parent, source))?;
        }
        let rendered = toml::to_string_pretty(&self.values)?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, rendered).map_err(|source| BuhError::io(&tmp_path, source))?;
        fs::rename(&tmp_path, &self.path).map_err(|source| BuhError::io(&self.path, source))?;
        Ok(())
    }
}

/// Shared settings handle injected into components.
pub type SharedSettings = Arc<RwLock<SettingsStore>>;

/// Wrap a store for shared access.
#[must_use]
pub fn shared(store: SettingsStore) -> SharedSettings {
    Arc::new(RwLock::new(store))
}

#[cfg(test)]
mod tests {
    use super::{Settings, SettingsStore, SubvolumeSpec, overlapping_prefixes};
    use crate::core::errors::BuhError;
    use crate::snapshot::retention::KEEP_FOREVER;

    fn sample_specs() -> Vec<SubvolumeSpec> {
        vec![
            SubvolumeSpec {
                origin: "/mnt/defvol/_active/rootvol/".to_string(),
                destination: "/mnt/defvol/_snapshots/".to_string(),
                prefix: "root".to_string(),
                snapshots_to_keep: 2,
            },
            SubvolumeSpec {
                origin: "/home/".to_string(),
                destination: "/mnt/defvol/_snapshots/".to_string(),
                prefix: "home".to_string(),
                snapshots_to_keep: KEEP_FOREVER,
            },
        ]
    }

    #[test]
    fn defaults_keep_the_unset_sentinel() {
        let settings = Settings::default();
        assert!(settings.path_to_consolidate().is_none());
        assert_eq!(settings.path_to_consolidate_root_snapshot, "0");
        assert!(settings.save_log_enabled());
        assert!(!settings.grub_btrfs_enabled());
    }

    #[test]
    fn empty_sentinel_also_means_unset() {
        let settings = Settings {
            path_to_consolidate_root_snapshot: String::new(),
            ..Settings::default()
        };
        assert!(settings.path_to_consolidate().is_none());
    }

    #[test]
    fn recorded_path_round_trips() {
        let settings = Settings {
            path_to_consolidate_root_snapshot: "_active/rootvol".to_string(),
            ..Settings::default()
        };
        assert_eq!(settings.path_to_consolidate(), Some("_active/rootvol"));
    }

    #[test]
    fn subvolume_lists_encode_and_decode() {
        let mut settings = Settings::default();
        settings.encode_subvolumes(&sample_specs());
        assert_eq!(
            settings.subvolumes_orig,
            "/mnt/defvol/_active/rootvol/|/home/"
        );
        assert_eq!(settings.subvolumes_snapshots_to_keep, "2|-1");

        let decoded = settings.subvolume_specs().expect("specs should decode");
        assert_eq!(decoded, sample_specs());
    }

    #[test]
    fn empty_subvolume_list_decodes_to_nothing() {
        let settings = Settings::default();
        assert!(
            settings
                .subvolume_specs()
                .expect("empty lists are valid")
                .is_empty()
        );
    }

    #[test]
    fn mismatched_list_lengths_are_rejected() {
        let settings = Settings {
            subvolumes_orig: "/|/home".to_string(),
            subvolumes_dest: "/snapshots".to_string(),
            subvolumes_prefix: "root|home".to_string(),
            subvolumes_snapshots_to_keep: "2|-1".to_string(),
            ..Settings::default()
        };
        let err = settings.subvolume_specs().expect_err("must reject");
        assert!(matches!(err, BuhError::InvalidConfig { .. }));
    }

    #[test]
    fn retention_below_sentinel_is_rejected() {
        let settings = Settings {
            subvolumes_orig: "/".to_string(),
            subvolumes_dest: "/snapshots".to_string(),
            subvolumes_prefix: "root".to_string(),
            subvolumes_snapshots_to_keep: "-2".to_string(),
            ..Settings::default()
        };
        let err = settings.subvolume_specs().expect_err("must reject");
        assert!(matches!(err, BuhError::InvalidConfig { .. }));
    }

    #[test]
    fn store_and_reload_preserve_keep_forever() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        let mut store = SettingsStore {
            path: path.clone(),
            values: Settings::default(),
        };
        store
            .set_subvolumes(&sample_specs())
            .expect("store should succeed");

        let reloaded = SettingsStore::load(Some(&path)).expect("reload should succeed");
        let specs = reloaded
            .values()
            .subvolume_specs()
            .expect("specs should decode");
        assert_eq!(specs[1].snapshots_to_keep, KEEP_FOREVER);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nope.toml");
        let err = SettingsStore::load(Some(&path)).expect_err("must fail");
        assert!(matches!(err, BuhError::MissingConfig { .. }));
    }

    #[test]
    fn set_path_to_consolidate_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let mut store = SettingsStore {
            path: path.clone(),
            values: Settings::default(),
        };
        store
            .set_path_to_consolidate("_active/rootvol")
            .expect("mutation should persist");

        let reloaded = SettingsStore::load(Some(&path)).expect("reload");
        assert_eq!(
            reloaded.values().path_to_consolidate(),
            Some("_active/rootvol")
        );
    }

    #[test]
    fn overlapping_prefixes_are_reported() {
        let specs = vec![
            SubvolumeSpec {
                origin: "/".to_string(),
                destination: "/snapshots/".to_string(),
                prefix: "root".to_string(),
                snapshots_to_keep: 2,
            },
            SubvolumeSpec {
                origin: "/var/".to_string(),
                destination: "/snapshots/".to_string(),
                prefix: "rootvar".to_string(),
                snapshots_to_keep: 2,
            },
            SubvolumeSpec {
                origin: "/home/".to_string(),
                destination: "/snapshots/".to_string(),
                prefix: "home".to_string(),
                snapshots_to_keep: 2,
            },
        ];
        let pairs = overlapping_prefixes(&specs);
        assert_eq!(pairs, vec![("root".to_string(), "rootvar".to_string())]);
    }
}
