//! BUH-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, BuhError>;

/// Top-level error type for the BTRFS upgrade helper.
#[derive(Debug, Error)]
pub enum BuhError {
    #[error("[BUH-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[BUH-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[BUH-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[BUH-1101] no supported package manager found (pacman/apt/zypper/dnf)")]
    DistroUndetected,

    #[error("[BUH-2001] required command not found: {binary}")]
    CommandNotFound { binary: String },

    #[error("[BUH-2101] subvolume {path} is not empty (nested subvolumes present)")]
    SnapshotNotEmpty { path: PathBuf },

    #[error("[BUH-2102] fstab patch failed for {path}: {reason}")]
    FstabPatchFailed { path: PathBuf, reason: String },

    #[error("[BUH-2201] mount table parse failure: {details}")]
    MountParse { details: String },

    #[error("[BUH-2202] filesystem usage parse failure: {details}")]
    UsageParse { details: String },

    #[error("[BUH-2301] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[BUH-3001] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[BUH-3002] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[BUH-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl BuhError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "BUH-1001",
            Self::MissingConfig { .. } => "BUH-1002",
            Self::ConfigParse { .. } => "BUH-1003",
            Self::DistroUndetected => "BUH-1101",
            Self::CommandNotFound { .. } => "BUH-2001",
            Self::SnapshotNotEmpty { .. } => "BUH-2101",
            Self::FstabPatchFailed { .. } => "BUH-2102",
            Self::MountParse { .. } => "BUH-2201",
            Self::UsageParse { .. } => "BUH-2202",
            Self::Serialization { .. } => "BUH-2301",
            Self::Io { .. } => "BUH-3001",
            Self::ChannelClosed { .. } => "BUH-3002",
            Self::Runtime { .. } => "BUH-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::ChannelClosed { .. }
                | Self::MountParse { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for BuhError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for BuhError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

impl From<toml::ser::Error> for BuhError {
    fn from(value: toml::ser::Error) -> Self {
        Self::Serialization {
            context: "toml",
            details: value.to_string(),
        }
    }
}
