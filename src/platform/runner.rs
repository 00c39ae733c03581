//! Command execution: privilege elevation, output streaming, binary probing.
//!
//! Every mutation of on-disk BTRFS state goes through the [`CommandRunner`]
//! trait, which is the seam the rest of the crate is tested against. The
//! system implementation elevates with `sudo` when the process is not already
//! root; the mock records invocations and can simulate snapshot operations on
//! a scratch directory.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;

use parking_lot::Mutex;

use crate::core::errors::{BuhError, Result};

/// Receives command output lines as they are produced.
pub trait OutputSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Outcome of a finished command.
///
/// A non-zero exit is data, not an error: upgrade and prune stages log it and
/// keep going. `Err` from [`CommandRunner::run`] is reserved for a missing
/// binary or a spawn failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Exit code, `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    /// Combined stdout+stderr, `None` when the output was streamed.
    pub output: Option<String>,
}

impl CommandOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    #[must_use]
    pub fn text(&self) -> &str {
        self.output.as_deref().unwrap_or("")
    }
}

/// Shell-command capability injected into every component.
pub trait CommandRunner: Send + Sync {
    /// Run `argv`, elevating with `sudo` when `root` is set.
    ///
    /// With a sink, stdout and stderr lines are forwarded as they arrive and
    /// the outcome carries no text; without one, combined stdout+stderr is
    /// captured (stderr appended after stdout, matching the way `btrfs`
    /// failure text is scanned).
    fn run(
        &self,
        argv: &[&str],
        root: bool,
        sink: Option<&dyn OutputSink>,
    ) -> Result<CommandOutcome>;

    /// `which`-style probe, elevated when `root` is set because some distros
    /// expose administrative binaries only in root's PATH.
    fn binary_exists(&self, program: &str, root: bool) -> Result<bool>;
}

// ──────────────────── system implementation ────────────────────

/// Real command runner shelling out via `std::process`.
#[derive(Debug)]
pub struct SystemCommandRunner {
    elevate: bool,
}

impl Default for SystemCommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCommandRunner {
    #[must_use]
    pub fn new() -> Self {
        Self {
            elevate: !effective_uid_is_root(),
        }
    }

    fn build_command(&self, argv: &[&str], root: bool) -> Command {
        if root && self.elevate {
            let mut cmd = Command::new("sudo");
            cmd.args(argv);
            cmd
        } else {
            let mut cmd = Command::new(argv[0]);
            cmd.args(&argv[1..]);
            cmd
        }
    }
}

#[cfg(unix)]
fn effective_uid_is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(unix))]
fn effective_uid_is_root() -> bool {
    false
}

impl CommandRunner for SystemCommandRunner {
    fn run(
        &self,
        argv: &[&str],
        root: bool,
        sink: Option<&dyn OutputSink>,
    ) -> Result<CommandOutcome> {
        let Some(program) = argv.first() else {
            return Err(BuhError::Runtime {
                details: "empty command line".to_string(),
            });
        };
        if !self.binary_exists(program, root)? {
            return Err(BuhError::CommandNotFound {
                binary: (*program).to_string(),
            });
        }

        let mut cmd = self.build_command(argv, root);
        match sink {
            Some(sink) => {
                let mut child = cmd
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .spawn()
                    .map_err(|source| BuhError::io(program, source))?;
                let stdout = child.stdout.take();
                let stderr = child.stderr.take();
                thread::scope(|scope| {
                    if let Some(stderr) = stderr {
                        scope.spawn(move || {
                            for line in BufReader::new(stderr).lines().map_while(io::Result::ok) {
                                sink.write_line(&line);
                            }
                        });
                    }
                    if let Some(stdout) = stdout {
                        for line in BufReader::new(stdout).lines().map_while(io::Result::ok) {
                            sink.write_line(&line);
                        }
                    }
                });
                let status = child
                    .wait()
                    .map_err(|source| BuhError::io(program, source))?;
                Ok(CommandOutcome {
                    status: status.code(),
                    output: None,
                })
            }
            None => {
                let output = cmd
                    .output()
                    .map_err(|source| BuhError::io(program, source))?;
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok(CommandOutcome {
                    status: output.status.code(),
                    output: Some(text),
                })
            }
        }
    }

    fn binary_exists(&self, program: &str, root: bool) -> Result<bool> {
        let mut cmd = if root && self.elevate {
            let mut cmd = Command::new("sudo");
            cmd.args(["which", program]);
            cmd
        } else {
            let mut cmd = Command::new("which");
            cmd.arg(program);
            cmd
        };
        let output = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| BuhError::io("which", source))?;
        Ok(output.success())
    }
}

// ──────────────────── mock implementation ────────────────────

/// One recorded invocation on the mock runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub argv: Vec<String>,
    pub root: bool,
    pub streamed: bool,
}

impl RecordedCommand {
    #[must_use]
    pub fn matches(&self, prefix: &[&str]) -> bool {
        self.argv.len() >= prefix.len()
            && self
                .argv
                .iter()
                .zip(prefix.iter())
                .all(|(got, want)| got == want)
    }
}

#[derive(Debug, Clone)]
struct CannedResponse {
    prefix: Vec<String>,
    output: String,
    status: i32,
}

/// Recording command runner for deterministic tests.
///
/// Canned outputs are matched by argv prefix (longest prefix wins). When
/// snapshot simulation is enabled, `btrfs subvolume snapshot`/`delete`
/// invocations without a canned response create and remove real directories
/// so listing-based logic can be exercised against a tempdir.
#[derive(Debug, Default)]
pub struct MockCommandRunner {
    invocations: Mutex<Vec<RecordedCommand>>,
    responses: Mutex<Vec<CannedResponse>>,
    missing: Mutex<HashSet<String>>,
    simulate_snapshots: bool,
}

impl MockCommandRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable directory-backed simulation of snapshot create/delete.
    #[must_use]
    pub fn with_snapshot_simulation(mut self) -> Self {
        self.simulate_snapshots = true;
        self
    }

    /// Register canned combined output for commands starting with `prefix`.
    pub fn respond_to(&self, prefix: &[&str], output: &str) {
        self.respond_with_status(prefix, output, 0);
    }

    /// Register canned output with an explicit exit status.
    pub fn respond_with_status(&self, prefix: &[&str], output: &str, status: i32) {
        self.responses.lock().push(CannedResponse {
            prefix: prefix.iter().map(ToString::to_string).collect(),
            output: output.to_string(),
            status,
        });
    }

    /// Report `program` as absent from PATH.
    pub fn mark_missing(&self, program: &str) {
        self.missing.lock().insert(program.to_string());
    }

    #[must_use]
    pub fn invocations(&self) -> Vec<RecordedCommand> {
        self.invocations.lock().clone()
    }

    /// Count of invocations whose argv starts with `prefix`.
    #[must_use]
    pub fn invocation_count(&self, prefix: &[&str]) -> usize {
        self.invocations
            .lock()
            .iter()
            .filter(|recorded| recorded.matches(prefix))
            .count()
    }

    fn canned_response(&self, argv: &[&str]) -> Option<CannedResponse> {
        let responses = self.responses.lock();
        responses
            .iter()
            .filter(|canned| {
                argv.len() >= canned.prefix.len()
                    && canned
                        .prefix
                        .iter()
                        .zip(argv.iter())
                        .all(|(want, got)| want == got)
            })
            .max_by_key(|canned| canned.prefix.len())
            .cloned()
    }

    fn simulate(&self, argv: &[&str]) {
        if !self.simulate_snapshots {
            return;
        }
        match argv {
            ["btrfs", "subvolume", "snapshot", "-r", src, dst]
            | ["btrfs", "subvolume", "snapshot", src, dst] => {
                let _ = fs::create_dir_all(Path::new(dst));
                // Carry the fstab over so bootable-snapshot patching can be
                // exercised against the simulated clone.
                let fstab_src = Path::new(src).join("etc/fstab");
                if fstab_src.is_file() {
                    let _ = fs::create_dir_all(Path::new(dst).join("etc"));
                    let _ = fs::copy(fstab_src, Path::new(dst).join("etc/fstab"));
                }
            }
            ["btrfs", "subvolume", "delete", path] => {
                let _ = fs::remove_dir_all(Path::new(path));
            }
            _ => {}
        }
    }
}

impl CommandRunner for MockCommandRunner {
    fn run(
        &self,
        argv: &[&str],
        root: bool,
        sink: Option<&dyn OutputSink>,
    ) -> Result<CommandOutcome> {
        let Some(program) = argv.first() else {
            return Err(BuhError::Runtime {
                details: "empty command line".to_string(),
            });
        };
        if self.missing.lock().contains(*program) {
            return Err(BuhError::CommandNotFound {
                binary: (*program).to_string(),
            });
        }

        self.invocations.lock().push(RecordedCommand {
            argv: argv.iter().map(ToString::to_string).collect(),
            root,
            streamed: sink.is_some(),
        });

        let canned = self.canned_response(argv);
        if canned.is_none() {
            self.simulate(argv);
        }
        let (text, status) = canned.map_or_else(
            || (String::new(), 0),
            |canned| (canned.output, canned.status),
        );

        match sink {
            Some(sink) => {
                for line in text.lines() {
                    sink.write_line(line);
                }
                Ok(CommandOutcome {
                    status: Some(status),
                    output: None,
                })
            }
            None => Ok(CommandOutcome {
                status: Some(status),
                output: Some(text),
            }),
        }
    }

    fn binary_exists(&self, program: &str, _root: bool) -> Result<bool> {
        Ok(!self.missing.lock().contains(program))
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandRunner, MockCommandRunner, OutputSink, SystemCommandRunner};
    use crate::core::errors::BuhError;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        lines: Mutex<Vec<String>>,
    }

    impl OutputSink for CollectingSink {
        fn write_line(&self, line: &str) {
            self.lines.lock().push(line.to_string());
        }
    }

    #[test]
    fn system_runner_captures_output() {
        let runner = SystemCommandRunner::new();
        let outcome = runner
            .run(&["echo", "hello"], false, None)
            .expect("echo should run");
        assert!(outcome.success());
        assert_eq!(outcome.text().trim(), "hello");
    }

    #[test]
    fn system_runner_streams_lines_to_sink() {
        let runner = SystemCommandRunner::new();
        let sink = CollectingSink::default();
        let outcome = runner
            .run(&["echo", "streamed"], false, Some(&sink))
            .expect("echo should run");
        assert!(outcome.success());
        assert!(outcome.output.is_none());
        assert_eq!(sink.lines.lock().as_slice(), ["streamed"]);
    }

    #[test]
    fn system_runner_reports_missing_binary() {
        let runner = SystemCommandRunner::new();
        let err = runner
            .run(&["buh-test-no-such-binary-1234"], false, None)
            .expect_err("must fail");
        assert!(matches!(err, BuhError::CommandNotFound { .. }));
    }

    #[test]
    fn mock_records_invocations_and_serves_canned_output() {
        let runner = MockCommandRunner::new();
        runner.respond_to(&["pacman", "-Qu"], "linux 6.8-1 -> 6.9-1\n");

        let outcome = runner
            .run(&["pacman", "-Qu"], true, None)
            .expect("mock run");
        assert!(outcome.text().contains("linux"));
        assert_eq!(runner.invocation_count(&["pacman", "-Qu"]), 1);
        assert!(runner.invocations()[0].root);
    }

    #[test]
    fn mock_prefers_the_longest_matching_prefix() {
        let runner = MockCommandRunner::new();
        runner.respond_to(&["btrfs", "subvolume", "show"], "generic\n");
        runner.respond_to(&["btrfs", "subvolume", "show", "/"], "_active/rootvol\n");

        let outcome = runner
            .run(&["btrfs", "subvolume", "show", "/"], true, None)
            .expect("mock run");
        assert_eq!(outcome.text().trim(), "_active/rootvol");
    }

    #[test]
    fn mock_canned_status_is_reported() {
        let runner = MockCommandRunner::new();
        runner.respond_with_status(&["pacman", "-Syu"], "error: failed to synchronize\n", 1);
        let outcome = runner
            .run(&["pacman", "-Syu", "--noconfirm"], true, None)
            .expect("mock run");
        assert!(!outcome.success());
        assert!(outcome.text().contains("failed to synchronize"));
    }

    #[test]
    fn mock_missing_binary_raises_command_not_found() {
        let runner = MockCommandRunner::new();
        runner.mark_missing("trizen");
        assert!(!runner.binary_exists("trizen", false).expect("probe"));
        let err = runner
            .run(&["trizen", "-Syua"], false, None)
            .expect_err("must fail");
        assert!(matches!(err, BuhError::CommandNotFound { .. }));
    }

    #[test]
    fn mock_simulation_creates_and_removes_snapshot_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let snap = dir.path().join("root-20260807-0");
        let snap_str = snap.to_string_lossy().into_owned();
        let runner = MockCommandRunner::new().with_snapshot_simulation();

        runner
            .run(
                &["btrfs", "subvolume", "snapshot", "-r", "/", &snap_str],
                true,
                None,
            )
            .expect("simulated snapshot");
        assert!(snap.is_dir());

        runner
            .run(&["btrfs", "subvolume", "delete", &snap_str], true, None)
            .expect("simulated delete");
        assert!(!snap.exists());
    }
}
