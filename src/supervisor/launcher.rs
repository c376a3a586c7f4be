//! Command lines for managed processes and spawning them detached.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::config::Config;
use crate::core::errors::{CfhError, Result};
use crate::env::EnvSet;
use crate::topology::plan::{ManagedProcess, ProcessKind, WorkerSpec};

use super::pidfile::PidFile;

/// File name of the beat schedule database inside the PID directory.
pub const BEAT_SCHEDULE_FILE: &str = "celerybeat-schedule";

/// A program invocation, displayable as a shell-like line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// `$VIRTUAL_ENV/bin/celery` when that file exists, else the configured binary.
#[must_use]
pub fn celery_program(config: &Config, env: &EnvSet) -> PathBuf {
    if let Some(venv) = env.non_empty("VIRTUAL_ENV") {
        let candidate = Path::new(venv).join("bin").join("celery");
        if candidate.is_file() {
            return candidate;
        }
    }
    config.celery.binary.clone()
}

fn worker_args(config: &Config, worker: &WorkerSpec) -> Vec<String> {
    vec![
        "worker".to_string(),
        format!("--loglevel={}", config.celery.loglevel),
        format!("--hostname={}@%h", worker.name),
        format!("--queues={}", worker.queues.join(",")),
        format!("--concurrency={}", worker.concurrency),
        format!("--pool={}", worker.pool.as_str()),
        format!("--prefetch-multiplier={}", worker.prefetch_multiplier),
        format!("--max-tasks-per-child={}", worker.max_tasks_per_child),
        format!("--time-limit={}", worker.time_limit_secs),
        format!("--soft-time-limit={}", worker.soft_time_limit_secs),
    ]
}

/// Full invocation for `process` under `config`.
#[must_use]
pub fn command_line(config: &Config, env: &EnvSet, process: &ManagedProcess) -> CommandLine {
    let mut args = vec!["-A".to_string(), config.celery.app.clone()];
    match &process.kind {
        ProcessKind::Worker(worker) => args.extend(worker_args(config, worker)),
        ProcessKind::Beat => {
            let schedule = config.paths.pid_dir().join(BEAT_SCHEDULE_FILE);
            args.push("beat".to_string());
            args.push(format!("--loglevel={}", config.celery.loglevel));
            args.push(format!("--schedule={}", schedule.display()));
        }
        ProcessKind::Flower { port } => {
            args.push("flower".to_string());
            args.push(format!("--port={port}"));
        }
    }
    CommandLine {
        program: celery_program(config, env),
        args,
        cwd: config.paths.project_root.join(&config.celery.working_dir),
    }
}

/// Log file of a managed process.
#[must_use]
pub fn log_path(config: &Config, name: &str) -> PathBuf {
    config.paths.log_dir().join(format!("{name}.log"))
}

/// A process that survived its startup grace period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Launched {
    pub name: String,
    pub pid: u32,
    pub log: PathBuf,
}

/// Spawn `line` in its own process group with exactly `env`, record its PID,
/// then watch it for `grace`. A process that exits within the grace period
/// loses its PID file and yields `StartupFailed`.
pub fn launch(
    line: &CommandLine,
    env: &EnvSet,
    pid_file: &PidFile,
    log: &Path,
    grace: Duration,
) -> Result<Launched> {
    if let Some(dir) = log.parent() {
        fs::create_dir_all(dir).map_err(|err| CfhError::io(dir, err))?;
    }
    let out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .map_err(|err| CfhError::io(log, err))?;
    let err_out = out.try_clone().map_err(|err| CfhError::io(log, err))?;

    let mut child = Command::new(&line.program)
        .args(&line.args)
        .current_dir(&line.cwd)
        .env_clear()
        .envs(env.iter())
        .envs(env.non_utf8())
        .stdin(Stdio::null())
        .stdout(out)
        .stderr(err_out)
        .process_group(0)
        .spawn()
        .map_err(|err| CfhError::ExternalCommand {
            command: line.to_string(),
            details: err.to_string(),
        })?;

    let pid = child.id();
    pid_file.write(pid)?;
    tracing::debug!(name = pid_file.name(), pid, command = %line, "spawned");

    if exited_within(&mut child, grace)? {
        pid_file.remove()?;
        return Err(CfhError::StartupFailed {
            name: pid_file.name().to_string(),
            log: log.to_path_buf(),
        });
    }

    Ok(Launched {
        name: pid_file.name().to_string(),
        pid,
        log: log.to_path_buf(),
    })
}

fn exited_within(child: &mut Child, grace: Duration) -> Result<bool> {
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::warn!(pid = child.id(), %status, "exited during startup");
                return Ok(true);
            }
            Ok(None) => {}
            Err(err) => {
                return Err(CfhError::Runtime {
                    details: format!("waiting on pid {}: {err}", child.id()),
                });
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        thread::sleep(Duration::from_millis(50).min(deadline - now));
    }
}
