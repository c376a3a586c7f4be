//! Shared harness: run the `cfh` binary in a scratch project with a clean
//! environment and keep a per-case log of what happened.

#![allow(dead_code, missing_docs)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use tempfile::TempDir;

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

/// A throwaway project directory with `cfh.toml`, an empty `.env` and a fake
/// `celery` that just sleeps.
pub struct Project {
    pub dir: TempDir,
}

const FAKE_CELERY: &str = "#!/bin/sh\necho \"fake celery $*\"\nsleep 300\n";

impl Project {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let celery = dir.path().join("fake-celery");
        fs::write(&celery, FAKE_CELERY).expect("write fake celery");
        fs::set_permissions(&celery, fs::Permissions::from_mode(0o755)).expect("chmod");

        let config = format!(
            r#"[paths]
project_root = "{root}"

[celery]
app = "cfh_test_app"
binary = "{celery}"
startup_grace_ms = 300

[stop]
grace_period_secs = 2
poll_interval_ms = 50
fallback_enabled = false
"#,
            root = dir.path().display(),
            celery = celery.display(),
        );
        fs::write(dir.path().join("cfh.toml"), config).expect("write config");
        fs::write(dir.path().join(".env"), "").expect("write env");
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_env(&self, contents: &str) {
        fs::write(self.path().join(".env"), contents).expect("write env");
    }

    pub fn pid_dir(&self) -> PathBuf {
        self.path().join("pids")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.path().join("logs")
    }

    pub fn run(&self, case: &str, args: &[&str]) -> CmdResult {
        run_in(case, self.path(), args)
    }
}

/// Run `cfh` from a fresh empty directory (defaults everywhere).
pub fn run_cli_case(case: &str, args: &[&str]) -> CmdResult {
    let dir = tempfile::tempdir().expect("tempdir");
    run_in(case, dir.path(), args)
}

fn run_in(case: &str, cwd: &Path, args: &[&str]) -> CmdResult {
    let output = Command::new(env!("CARGO_BIN_EXE_cfh"))
        .args(args)
        .current_dir(cwd)
        .env_clear()
        .env("PATH", std::env::var("PATH").unwrap_or_default())
        .env("CFH_LOG", "debug")
        .output()
        .expect("spawn cfh");

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    let log_dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join("cfh-cli-cases");
    fs::create_dir_all(&log_dir).expect("create case log dir");
    let log_path = log_dir.join(format!("{case}.log"));
    let log = format!(
        "args: {args:?}\ncwd: {}\nstatus: {}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}\n",
        cwd.display(),
        output.status
    );
    fs::write(&log_path, log).expect("write case log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}
