//! Process supervision: launching the plan's processes, reporting their
//! status and stopping them.
//!
//! Every managed process is tracked by a PID file named after it. Liveness is
//! always re-checked against the OS, and a live pid only counts as ours when its
//! command line invokes the configured Celery app. A PID file whose process is
//! gone, or was replaced by an unrelated one, is stale and gets removed on sight.

pub mod launcher;
pub mod logs;
pub mod pidfile;
pub mod process;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::config::Config;
use crate::core::errors::{CfhError, Result};
use crate::env::EnvSet;
use crate::topology::plan::{FLOWER_PROCESS, ManagedProcess, Plan};

use self::launcher::{CommandLine, Launched};
use self::pidfile::{PidFile, PidRead};
use self::process::{MatchedProcess, Target, Termination};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// A single step in a start or stop run.
#[derive(Debug, Clone, Serialize)]
pub struct Step {
    pub description: String,
    pub done: bool,
    pub error: Option<String>,
}

/// Ordered steps plus an overall verdict.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Steps {
    pub steps: Vec<Step>,
}

impl Steps {
    pub(crate) fn ok(&mut self, description: impl Into<String>) {
        self.steps.push(Step {
            description: description.into(),
            done: true,
            error: None,
        });
    }

    pub(crate) fn fail(&mut self, description: impl Into<String>, error: impl Into<String>) {
        self.steps.push(Step {
            description: description.into(),
            done: false,
            error: Some(error.into()),
        });
    }

    pub(crate) fn plan(&mut self, description: impl Into<String>) {
        self.steps.push(Step {
            description: description.into(),
            done: false,
            error: None,
        });
    }

    #[must_use]
    pub fn all_ok(&self) -> bool {
        self.steps.iter().all(|s| s.error.is_none())
    }
}

/// Outcome of `start` (and of launching flower).
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    #[serde(flatten)]
    pub steps: Steps,
    pub success: bool,
    pub dry_run: bool,
    pub launched: Vec<Launched>,
    /// Processes that were already running.
    pub skipped: Vec<String>,
    /// Command lines that would run (dry run only).
    pub planned: Vec<CommandLine>,
}

impl StartReport {
    fn new(dry_run: bool) -> Self {
        Self {
            steps: Steps::default(),
            success: false,
            dry_run,
            launched: Vec::new(),
            skipped: Vec::new(),
            planned: Vec::new(),
        }
    }
}

/// A process stopped through its PID file.
#[derive(Debug, Clone, Serialize)]
pub struct StoppedProcess {
    pub name: String,
    pub pid: i32,
    pub outcome: Termination,
}

/// Outcome of `stop`.
#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    #[serde(flatten)]
    pub steps: Steps,
    pub success: bool,
    pub stopped: Vec<StoppedProcess>,
    /// Processes found and terminated by the command-line pattern sweep.
    pub swept: Vec<MatchedProcess>,
    pub removed_pid_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartReport {
    pub stop: StopReport,
    pub start: StartReport,
    pub success: bool,
}

/// Observed state of one managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    /// PID file pointed at a dead process; the file was removed.
    Stale,
    /// PID file held garbage; the file was removed.
    Corrupt,
    Stopped,
}

impl ProcessState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stale => "stale",
            Self::Corrupt => "corrupt",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub name: String,
    /// Part of this host's plan (as opposed to flower or leftovers).
    pub planned: bool,
    pub state: ProcessState,
    pub pid: Option<i32>,
    /// When the PID file was written, for running processes.
    pub since: Option<DateTime<Utc>>,
    pub log: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub processes: Vec<ProcessStatus>,
    pub all_planned_running: bool,
}

impl StatusReport {
    #[must_use]
    pub fn running(&self) -> usize {
        self.processes
            .iter()
            .filter(|p| p.state == ProcessState::Running)
            .count()
    }
}

/// Options for [`Supervisor::start`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Restrict to these process names; empty means the whole plan.
    pub only: Vec<String>,
    pub dry_run: bool,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    config: Config,
    env: EnvSet,
    plan: Plan,
}

impl Supervisor {
    #[must_use]
    pub const fn new(config: Config, env: EnvSet, plan: Plan) -> Self {
        Self { config, env, plan }
    }

    #[must_use]
    pub const fn plan(&self) -> &Plan {
        &self.plan
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    fn pid_dir(&self) -> PathBuf {
        self.config.paths.pid_dir()
    }

    fn owns(&self, pid: i32) -> bool {
        is_managed(pid, &self.config.celery.app)
    }

    fn pid_file(&self, name: &str) -> Result<PidFile> {
        PidFile::new(&self.pid_dir(), name)
    }

    /// Launch the plan (or the `only` subset). Unknown names fail before
    /// anything is launched.
    pub fn start(&self, opts: &StartOptions) -> Result<StartReport> {
        let mut processes = self.plan.processes();
        if !opts.only.is_empty() {
            if let Some(unknown) = opts.only.iter().find(|n| self.plan.process(n).is_none()) {
                return Err(CfhError::UnknownProcess {
                    name: unknown.clone(),
                });
            }
            processes.retain(|p| opts.only.contains(&p.name));
        }

        let mut report = StartReport::new(opts.dry_run);
        for process in &processes {
            self.start_one(process, &mut report);
        }
        report.success = report.steps.all_ok();
        tracing::info!(
            launched = report.launched.len(),
            skipped = report.skipped.len(),
            success = report.success,
            dry_run = report.dry_run,
            "start finished"
        );
        Ok(report)
    }

    /// Launch the flower dashboard as the managed process `flower`.
    pub fn launch_flower(&self, port: u16, dry_run: bool) -> StartReport {
        let mut report = StartReport::new(dry_run);
        self.start_one(&ManagedProcess::flower(port), &mut report);
        report.success = report.steps.all_ok();
        report
    }

    fn start_one(&self, process: &ManagedProcess, report: &mut StartReport) {
        let name = &process.name;
        let pid_file = match self.pid_file(name) {
            Ok(file) => file,
            Err(err) => {
                report.steps.fail(format!("start {name}"), err.to_string());
                return;
            }
        };

        match pid_file.read() {
            Ok(PidRead::Valid(pid)) if self.owns(pid) => {
                report.steps.ok(format!("{name} already running (pid {pid})"));
                report.skipped.push(name.clone());
                return;
            }
            Ok(PidRead::Valid(pid)) if process::is_alive(pid) => {
                tracing::warn!(name = %name, pid, "PID file names an unrelated process");
                clear_pid_file(
                    &pid_file,
                    &format!("PID file for {name} naming unrelated pid {pid}"),
                    report,
                );
            }
            Ok(PidRead::Valid(pid)) => {
                clear_pid_file(&pid_file, &format!("stale PID file for {name} (pid {pid})"), report);
            }
            Ok(PidRead::Corrupt(raw)) => {
                clear_pid_file(&pid_file, &format!("corrupt PID file for {name} ({raw:?})"), report);
            }
            Ok(PidRead::Missing) => {}
            Err(err) => {
                report.steps.fail(format!("read PID file for {name}"), err.to_string());
                return;
            }
        }

        let line = launcher::command_line(&self.config, &self.env, process);
        if report.dry_run {
            report.steps.plan(format!("start {name}: {line}"));
            report.planned.push(line);
            return;
        }

        let log = launcher::log_path(&self.config, name);
        match launcher::launch(
            &line,
            &self.env,
            &pid_file,
            &log,
            self.config.celery.startup_grace(),
        ) {
            Ok(launched) => {
                tracing::info!(name = %name, pid = launched.pid, log = %log.display(), "started");
                report
                    .steps
                    .ok(format!("started {name} (pid {})", launched.pid));
                report.launched.push(launched);
            }
            Err(err) => {
                tracing::error!(name = %name, error = %err, "start failed");
                report.steps.fail(format!("start {name}"), err.to_string());
            }
        }
    }

    /// Terminate every process with a PID file, then sweep by command line.
    pub fn stop(&self) -> Result<StopReport> {
        let mut report = StopReport {
            steps: Steps::default(),
            success: false,
            stopped: Vec::new(),
            swept: Vec::new(),
            removed_pid_files: Vec::new(),
        };
        let grace = self.config.stop.grace_period();
        let poll = self.config.stop.poll_interval();

        for pid_file in pidfile::list(&self.pid_dir())? {
            let name = pid_file.name().to_string();
            match pid_file.read() {
                Ok(PidRead::Valid(pid)) if process::is_alive(pid) && !self.owns(pid) => {
                    tracing::warn!(name = %name, pid, "PID file names an unrelated process, not signalling it");
                    report
                        .steps
                        .ok(format!("{name}: pid {pid} is not a managed process, left running"));
                }
                Ok(PidRead::Valid(pid)) => match process::terminate(Target::Group(pid), grace, poll) {
                    Ok(outcome) => {
                        tracing::info!(name = %name, pid, ?outcome, "stopped");
                        report.steps.ok(format!("{name} (pid {pid}): {}", describe(outcome)));
                        report.stopped.push(StoppedProcess { name, pid, outcome });
                    }
                    Err(err) => {
                        tracing::error!(name = %name, pid, error = %err, "stop failed");
                        report.steps.fail(format!("stop {name} (pid {pid})"), err.to_string());
                    }
                },
                Ok(PidRead::Corrupt(raw)) => {
                    report.steps.ok(format!("{name}: discarded corrupt PID file ({raw:?})"));
                }
                Ok(PidRead::Missing) => {}
                Err(err) => report.steps.fail(format!("read PID file for {name}"), err.to_string()),
            }
            match pid_file.remove() {
                Ok(true) => report.removed_pid_files.push(pid_file.path().to_path_buf()),
                Ok(false) => {}
                Err(err) => report
                    .steps
                    .fail(format!("remove {}", pid_file.path().display()), err.to_string()),
            }
        }

        if self.config.stop.fallback_enabled {
            self.sweep(&mut report, grace, poll);
        }

        report.success = report.steps.all_ok();
        Ok(report)
    }

    fn sweep(&self, report: &mut StopReport, grace: std::time::Duration, poll: std::time::Duration) {
        let pattern = self.config.stop.pattern_for(&self.config.celery.app);
        let matches = match process::find_by_pattern(&pattern) {
            Ok(matches) => matches,
            Err(err) => {
                report.steps.fail(format!("scan for `{pattern}`"), err.to_string());
                return;
            }
        };
        for found in matches {
            match process::terminate(Target::Single(found.pid), grace, poll) {
                Ok(Termination::AlreadyGone) => {}
                Ok(outcome) => {
                    tracing::warn!(pid = found.pid, command = %found.command_line, "stopped untracked process");
                    report
                        .steps
                        .ok(format!("untracked pid {}: {}", found.pid, describe(outcome)));
                    report.swept.push(found);
                }
                Err(err) => report
                    .steps
                    .fail(format!("stop untracked pid {}", found.pid), err.to_string()),
            }
        }
    }

    pub fn restart(&self, opts: &StartOptions) -> Result<RestartReport> {
        let stop = self.stop()?;
        let start = self.start(opts)?;
        let success = stop.success && start.success;
        Ok(RestartReport {
            stop,
            start,
            success,
        })
    }

    /// Probe every planned process and every other PID file. Stale and corrupt
    /// PID files are removed.
    pub fn status(&self) -> Result<StatusReport> {
        let mut names: Vec<(String, bool)> = self
            .plan
            .processes()
            .into_iter()
            .map(|p| (p.name, true))
            .collect();
        for file in pidfile::list(&self.pid_dir())? {
            if !names.iter().any(|(n, _)| n == file.name()) {
                names.push((file.name().to_string(), false));
            }
        }

        let mut processes = Vec::with_capacity(names.len());
        for (name, planned) in names {
            let pid_file = self.pid_file(&name)?;
            let (state, pid, since) = match pid_file.read()? {
                PidRead::Valid(pid) if self.owns(pid) => (
                    ProcessState::Running,
                    Some(pid),
                    pid_file.modified().map(DateTime::<Utc>::from),
                ),
                PidRead::Valid(pid) => {
                    tracing::info!(name = %name, pid, reused = process::is_alive(pid), "removing stale PID file");
                    pid_file.remove()?;
                    (ProcessState::Stale, Some(pid), None)
                }
                PidRead::Corrupt(raw) => {
                    tracing::warn!(name = %name, raw = %raw, "removing corrupt PID file");
                    pid_file.remove()?;
                    (ProcessState::Corrupt, None, None)
                }
                PidRead::Missing => (ProcessState::Stopped, None, None),
            };
            processes.push(ProcessStatus {
                log: launcher::log_path(&self.config, &name),
                name,
                planned,
                state,
                pid,
                since,
            });
        }

        let all_planned_running = processes
            .iter()
            .filter(|p| p.planned)
            .all(|p| p.state == ProcessState::Running);
        Ok(StatusReport {
            generated_at: Utc::now(),
            processes,
            all_planned_running,
        })
    }

    /// Log files to show: the named process's, or every `*.log` in the log
    /// directory.
    pub fn log_files(&self, name: Option<&str>) -> Result<Vec<(String, PathBuf)>> {
        if let Some(name) = name {
            let known = self.plan.process(name).is_some() || name == FLOWER_PROCESS;
            let path = launcher::log_path(&self.config, name);
            if !pidfile::is_valid_name(name) || (!known && !path.is_file()) {
                return Err(CfhError::UnknownProcess {
                    name: name.to_string(),
                });
            }
            return Ok(vec![(name.to_string(), path)]);
        }
        list_logs(&self.config.paths.log_dir())
    }
}

/// Whether `pid` is alive and was invoked with `-A <app>` or `--app=<app>`.
#[must_use]
pub fn is_managed(pid: i32, app: &str) -> bool {
    process::is_alive(pid) && process::command_args(pid).is_some_and(|args| invokes_app(&args, app))
}

fn invokes_app(args: &[String], app: &str) -> bool {
    args.windows(2).any(|pair| pair[0] == "-A" && pair[1] == app)
        || args.iter().any(|arg| arg.strip_prefix("--app=") == Some(app))
}

fn clear_pid_file(pid_file: &PidFile, what: &str, report: &mut StartReport) {
    if report.dry_run {
        report.steps.plan(format!("remove {what}"));
        return;
    }
    match pid_file.remove() {
        Ok(_) => report.steps.ok(format!("removed {what}")),
        Err(err) => report.steps.fail(format!("remove {what}"), err.to_string()),
    }
}

fn list_logs(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(CfhError::io(dir, err)),
    };
    let mut logs = Vec::new();
    for entry in entries {
        let path = entry.map_err(|err| CfhError::io(dir, err))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            logs.push((stem.to_string(), path.clone()));
        }
    }
    logs.sort();
    Ok(logs)
}

const fn describe(outcome: Termination) -> &'static str {
    match outcome {
        Termination::AlreadyGone => "already gone",
        Termination::Terminated => "terminated",
        Termination::Killed => "killed after grace period",
    }
}
