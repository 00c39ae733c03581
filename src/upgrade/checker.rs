//! Startup update check: wait for network reachability, then ask the distro
//! package manager whether updates are pending.
//!
//! Read-only: this never upgrades anything. It only surfaces the decision
//! point by handing the raw upgradable-package lines to the caller through a
//! channel. An unreachable network is a silent (logged) skip.

#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::core::errors::{BuhError, Result};
use crate::logger::activity::EventKind;
use crate::platform::distro::Distro;
use crate::platform::runner::CommandRunner;
use crate::services::Services;

/// Raw upgradable-package lines handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateNotice {
    pub packages: Vec<String>,
}

/// Network reachability probe.
pub trait ConnectivityProbe: Send + Sync {
    fn is_reachable(&self) -> bool;
}

/// Probe via `curl -sI` against a known-reachable host with a short timeout.
pub struct CurlProbe {
    runner: Arc<dyn CommandRunner>,
    url: String,
    timeout_secs: u64,
}

impl CurlProbe {
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            url: "https://www.google.com".to_string(),
            timeout_secs: 20,
        }
    }

    #[must_use]
    pub fn against(mut self, url: &str) -> Self {
        self.url = url.to_string();
        self
    }
}

impl ConnectivityProbe for CurlProbe {
    fn is_reachable(&self) -> bool {
        let timeout = self.timeout_secs.to_string();
        let argv = ["curl", "-sI", "--max-time", timeout.as_str(), &self.url];
        self.runner
            .run(&argv, false, None)
            .is_ok_and(|outcome| outcome.success())
    }
}

/// Retry schedule for the reachability poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for PollSchedule {
    /// Up to 60 attempts, 5 seconds apart (about five minutes).
    fn default() -> Self {
        Self {
            attempts: 60,
            delay: Duration::from_secs(5),
        }
    }
}

/// Background poller deciding whether to surface the update prompt.
pub struct UpdateChecker {
    services: Services,
    distro: Distro,
    probe: Arc<dyn ConnectivityProbe>,
    schedule: PollSchedule,
    notices: Sender<UpdateNotice>,
}

impl UpdateChecker {
    #[must_use]
    pub fn new(services: Services, distro: Distro, notices: Sender<UpdateNotice>) -> Self {
        let probe = Arc::new(CurlProbe::new(services.runner.clone()));
        Self {
            services,
            distro,
            probe,
            schedule: PollSchedule::default(),
            notices,
        }
    }

    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = probe;
        self
    }

    #[must_use]
    pub const fn with_schedule(mut self, schedule: PollSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Run the check on a background thread.
    pub fn spawn(self) -> Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("buh-update-check".to_string())
            .spawn(move || self.run())
            .map_err(|source| BuhError::io("buh-update-check", source))
    }

    /// Run the check on the current thread.
    pub fn run(&self) {
        if !self.wait_for_network() {
            self.services.log.warn(
                EventKind::UpdateCheck,
                format!(
                    "network unreachable after {} attempts, skipping the update check",
                    self.schedule.attempts
                ),
            );
            return;
        }

        if !self
            .services
            .settings
            .read()
            .values()
            .check_at_startup_enabled()
        {
            return;
        }

        match self.query_pending_updates() {
            Ok(Some(packages)) => {
                self.services.log.info(
                    EventKind::UpdateCheck,
                    format!("{} updates pending", packages.len()),
                );
                let _ = self.notices.send(UpdateNotice { packages });
            }
            Ok(None) => {
                self.services
                    .log
                    .info(EventKind::UpdateCheck, "system is up to date");
            }
            Err(error) => {
                // Logged only; the startup check never raises a dialog.
                self.services.log.error(error.code(), error.to_string());
            }
        }
    }

    fn wait_for_network(&self) -> bool {
        for attempt in 0..self.schedule.attempts {
            if self.probe.is_reachable() {
                return true;
            }
            if attempt + 1 < self.schedule.attempts {
                thread::sleep(self.schedule.delay);
            }
        }
        false
    }

    /// One-shot query of the distro's pending updates (no network wait, no
    /// preference gate), also used by the explicit `check` CLI command.
    pub fn query_pending_updates(&self) -> Result<Option<Vec<String>>> {
        if let Some(refresh) = self.distro.refresh_command() {
            let outcome = self.services.runner.run(refresh, true, None)?;
            if !outcome.success() {
                self.services.log.warn(
                    EventKind::UpdateCheck,
                    format!("repository refresh exited with status {:?}", outcome.status),
                );
            }
        }
        let outcome = self
            .services
            .runner
            .run(self.distro.check_updates_command(), true, None)?;
        if self.distro.has_pending_updates(outcome.text()) {
            let packages = outcome
                .text()
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(ToString::to_string)
                .collect();
            Ok(Some(packages))
        } else {
            Ok(None)
        }
    }
}
