//! Liveness probes and termination for supervised processes.

use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;
use serde::Serialize;

use crate::core::errors::{CfhError, Result};

/// How long to keep probing after SIGKILL before giving up.
const KILL_CONFIRM: Duration = Duration::from_secs(5);

/// Whether `pid` refers to a live (non-zombie) process.
///
/// Signal 0 probes existence; `EPERM` means the process exists under another
/// user. Exited children of this process are reaped first so they do not linger
/// as zombies.
#[must_use]
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let target = Pid::from_raw(pid);
    // ECHILD for processes we did not spawn; nothing to reap then.
    let _ = waitpid(target, Some(WaitPidFlag::WNOHANG));
    match signal::kill(target, None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether any member of process group `pgid` still exists.
#[must_use]
pub fn group_alive(pgid: i32) -> bool {
    if pgid <= 1 {
        return false;
    }
    matches!(
        signal::killpg(Pid::from_raw(pgid), None),
        Ok(()) | Err(Errno::EPERM)
    )
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: i32) -> bool {
    // Field 3 of /proc/<pid>/stat, after the parenthesised command name.
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let after = stat.rsplit_once(')')?.1;
            after.trim_start().chars().next()
        })
        .is_some_and(|state| state == 'Z' || state == 'X')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: i32) -> bool {
    false
}

/// Which processes a signal is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// The process group led by the pid; used for processes we launched.
    Group(i32),
    Single(i32),
}

impl Target {
    #[must_use]
    pub const fn pid(self) -> i32 {
        match self {
            Self::Group(pid) | Self::Single(pid) => pid,
        }
    }

    fn alive(self) -> bool {
        match self {
            Self::Group(pid) => is_alive(pid) || group_alive(pid),
            Self::Single(pid) => is_alive(pid),
        }
    }

    fn send(self, sig: Signal) -> Result<()> {
        let result = match self {
            Self::Group(pid) => match signal::killpg(Pid::from_raw(pid), sig) {
                // Not a group leader (PID file written by someone else): fall back to the pid.
                Err(Errno::ESRCH) => signal::kill(Pid::from_raw(pid), sig),
                other => other,
            },
            Self::Single(pid) => signal::kill(Pid::from_raw(pid), sig),
        };
        match result {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(CfhError::Signal {
                pid: self.pid(),
                details: format!("{sig}: {errno}"),
            }),
        }
    }
}

/// Outcome of [`terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    AlreadyGone,
    /// Exited within the grace period after SIGTERM.
    Terminated,
    /// Needed SIGKILL.
    Killed,
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub fn terminate(target: Target, grace: Duration, poll: Duration) -> Result<Termination> {
    if !target.alive() {
        return Ok(Termination::AlreadyGone);
    }

    target.send(Signal::SIGTERM)?;
    if wait_until_gone(target, grace, poll) {
        return Ok(Termination::Terminated);
    }

    tracing::warn!(pid = target.pid(), grace_secs = grace.as_secs(), "still alive after SIGTERM, sending SIGKILL");
    target.send(Signal::SIGKILL)?;
    if wait_until_gone(target, KILL_CONFIRM, poll) {
        return Ok(Termination::Killed);
    }
    Err(CfhError::Signal {
        pid: target.pid(),
        details: "still alive after SIGKILL".to_string(),
    })
}

fn wait_until_gone(target: Target, budget: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + budget;
    loop {
        if !target.alive() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(poll.min(deadline - now));
    }
}

/// Arguments of `pid` as recorded by the kernel, or `None` when the process
/// is gone or its command line is unreadable.
#[cfg(target_os = "linux")]
#[must_use]
pub fn command_args(pid: i32) -> Option<Vec<String>> {
    if pid <= 0 {
        return None;
    }
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let args = split_cmdline(&raw);
    // Kernel threads and zombies have an empty cmdline.
    (!args.is_empty()).then_some(args)
}

/// Arguments of `pid` via `ps`, split on whitespace.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn command_args(pid: i32) -> Option<Vec<String>> {
    if pid <= 0 {
        return None;
    }
    let output = std::process::Command::new("ps")
        .args(["-o", "command=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    let args: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .map(str::to_string)
        .collect();
    (!args.is_empty()).then_some(args)
}

#[cfg(target_os = "linux")]
fn split_cmdline(raw: &[u8]) -> Vec<String> {
    raw.split(|&b| b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect()
}

/// A running process whose command line matched a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedProcess {
    pub pid: i32,
    pub command_line: String,
}

/// Processes whose space-joined command line contains `pattern`, excluding
/// this process.
#[cfg(target_os = "linux")]
pub fn find_by_pattern(pattern: &str) -> Result<Vec<MatchedProcess>> {
    let own = std::process::id();
    let proc_dir = std::path::Path::new("/proc");
    let entries = std::fs::read_dir(proc_dir).map_err(|err| CfhError::io(proc_dir, err))?;

    let mut matches = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if pid == own {
            continue;
        }
        // Processes can exit between readdir and read; skip them.
        let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let command_line = split_cmdline(&raw).join(" ");
        if command_line.contains(pattern) {
            let Ok(pid) = i32::try_from(pid) else {
                continue;
            };
            matches.push(MatchedProcess { pid, command_line });
        }
    }
    matches.sort_by_key(|m| m.pid);
    Ok(matches)
}

/// Processes whose command line contains `pattern`, via `pgrep -f`.
#[cfg(not(target_os = "linux"))]
pub fn find_by_pattern(pattern: &str) -> Result<Vec<MatchedProcess>> {
    let output = std::process::Command::new("pgrep")
        .arg("-fl")
        .arg(pattern)
        .output()
        .map_err(|err| CfhError::ExternalCommand {
            command: "pgrep".to_string(),
            details: err.to_string(),
        })?;
    let own = std::process::id();
    let text = String::from_utf8_lossy(&output.stdout);
    Ok(text
        .lines()
        .filter_map(|line| {
            let (pid, rest) = line.trim().split_once(' ')?;
            let pid: i32 = pid.parse().ok()?;
            (u32::try_from(pid).ok()? != own).then(|| MatchedProcess {
                pid,
                command_line: rest.to_string(),
            })
        })
        .collect())
}
