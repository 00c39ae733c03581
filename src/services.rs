//! Capability bundle injected into components.

use std::sync::Arc;

use crate::core::paths::AppPaths;
use crate::core::settings::SharedSettings;
use crate::logger::activity::ActivityHandle;
use crate::platform::runner::CommandRunner;

/// Everything a snapshot or upgrade component needs, passed explicitly at
/// construction so no component reaches into ambient global state.
#[derive(Clone)]
pub struct Services {
    /// Shell-command capability (real or mock).
    pub runner: Arc<dyn CommandRunner>,
    /// Settings store, read at stage start and written on explicit mutation.
    pub settings: SharedSettings,
    /// Config/data directories.
    pub paths: AppPaths,
    /// Activity log handle.
    pub log: ActivityHandle,
}

impl Services {
    #[must_use]
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        settings: SharedSettings,
        paths: AppPaths,
        log: ActivityHandle,
    ) -> Self {
        Self {
            runner,
            settings,
            paths,
            log,
        }
    }
}
