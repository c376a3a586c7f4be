//! TOML configuration with defaults for every section.
//!
//! The file is optional: a missing default `cfh.toml` yields [`Config::default`],
//! while an explicitly requested file that does not exist is an error. A few
//! fields can be overridden from the loaded environment set.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{CfhError, Result};
use crate::env::EnvSet;

/// File name looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "cfh.toml";

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV_VAR: &str = "CFH_CONFIG";

/// Full configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub paths: PathsConfig,
    pub celery: CeleryConfig,
    pub stop: StopConfig,
    pub flower: FlowerConfig,
    pub health: HealthConfig,
    pub gpu_monitor: GpuMonitorConfig,
}

/// Filesystem layout. Relative paths resolve against `project_root`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub project_root: PathBuf,
    pub pid_dir: PathBuf,
    pub log_dir: PathBuf,
    pub env_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            pid_dir: PathBuf::from("pids"),
            log_dir: PathBuf::from("logs"),
            env_file: PathBuf::from(".env"),
        }
    }
}

impl PathsConfig {
    #[must_use]
    pub fn pid_dir(&self) -> PathBuf {
        self.project_root.join(&self.pid_dir)
    }

    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.project_root.join(&self.log_dir)
    }

    #[must_use]
    pub fn env_file(&self) -> PathBuf {
        self.project_root.join(&self.env_file)
    }
}

/// How Celery processes are invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CeleryConfig {
    /// Value passed to `-A`.
    pub app: String,
    /// Program used when `$VIRTUAL_ENV/bin/celery` does not exist.
    pub binary: PathBuf,
    pub loglevel: String,
    /// Working directory of launched processes, relative to the project root.
    pub working_dir: PathBuf,
    /// A process still alive after this long counts as started.
    pub startup_grace_ms: u64,
}

impl Default for CeleryConfig {
    fn default() -> Self {
        Self {
            app: "celery_app.celery_app".to_string(),
            binary: PathBuf::from("celery"),
            loglevel: "info".to_string(),
            working_dir: PathBuf::from("."),
            startup_grace_ms: 1_000,
        }
    }
}

impl CeleryConfig {
    #[must_use]
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

/// Termination behaviour of `stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StopConfig {
    pub grace_period_secs: u64,
    pub poll_interval_ms: u64,
    /// Command-line substring used by the fallback sweep. Defaults to
    /// `celery -A <app>` when unset.
    pub fallback_pattern: Option<String>,
    pub fallback_enabled: bool,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 10,
            poll_interval_ms: 200,
            fallback_pattern: None,
            fallback_enabled: true,
        }
    }
}

impl StopConfig {
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    #[must_use]
    pub fn pattern_for(&self, app: &str) -> String {
        self.fallback_pattern
            .clone()
            .unwrap_or_else(|| format!("celery -A {app}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowerConfig {
    pub port: u16,
}

impl Default for FlowerConfig {
    fn default() -> Self {
        Self { port: 5555 }
    }
}

/// Thresholds for `health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    pub disk_paths: Vec<PathBuf>,
    pub disk_warn_free_pct: f64,
    pub disk_critical_free_pct: f64,
    pub memory_warn_pct: f64,
    pub memory_critical_pct: f64,
    pub connect_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            disk_paths: vec![
                PathBuf::from("/"),
                PathBuf::from("/var/log"),
                PathBuf::from("/tmp"),
            ],
            disk_warn_free_pct: 15.0,
            disk_critical_free_pct: 5.0,
            memory_warn_pct: 80.0,
            memory_critical_pct: 90.0,
            connect_timeout_secs: 5,
        }
    }
}

impl HealthConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

/// GPU instance autoscaling monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GpuMonitorConfig {
    pub check_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub queues: Vec<String>,
    /// Prefix prepended to queue names to form the Redis list key.
    pub queue_key_prefix: String,
    pub gcloud_binary: PathBuf,
    pub default_zone: String,
}

impl Default for GpuMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            idle_timeout_secs: 300,
            queues: vec!["embeddings_gpu".to_string(), "scoring_tasks".to_string()],
            queue_key_prefix: String::new(),
            gcloud_binary: PathBuf::from("gcloud"),
            default_zone: "us-central1-a".to_string(),
        }
    }
}

impl GpuMonitorConfig {
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Config {
    /// Pick the config file: explicit flag, then `CFH_CONFIG`, then `./cfh.toml`.
    /// The boolean is true when the path was requested explicitly.
    #[must_use]
    pub fn resolve_path(explicit: Option<&Path>, env_value: Option<&str>) -> (PathBuf, bool) {
        if let Some(path) = explicit {
            return (path.to_path_buf(), true);
        }
        match env_value.filter(|value| !value.trim().is_empty()) {
            Some(value) => (PathBuf::from(value), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        }
    }

    /// Load from `path`. A missing file is an error only when `required`.
    pub fn load(path: &Path, required: bool) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if required {
                    return Err(CfhError::MissingConfig {
                        path: path.to_path_buf(),
                    });
                }
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(CfhError::io(path, err)),
        };
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `GPU_CHECK_INTERVAL` / `GPU_IDLE_TIMEOUT` from the environment.
    pub fn apply_env_overrides(&mut self, env: &EnvSet) -> Result<()> {
        if let Some(secs) = parse_secs(env, "GPU_CHECK_INTERVAL")? {
            self.gpu_monitor.check_interval_secs = secs;
        }
        if let Some(secs) = parse_secs(env, "GPU_IDLE_TIMEOUT")? {
            self.gpu_monitor.idle_timeout_secs = secs;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.celery.app.trim().is_empty() {
            return invalid("celery.app must not be empty");
        }
        if self.stop.grace_period_secs == 0 {
            return invalid("stop.grace_period_secs must be at least 1");
        }
        if self.flower.port == 0 {
            return invalid("flower.port must be non-zero");
        }
        let health = &self.health;
        if !(0.0..=100.0).contains(&health.disk_warn_free_pct)
            || !(0.0..=100.0).contains(&health.disk_critical_free_pct)
            || health.disk_critical_free_pct > health.disk_warn_free_pct
        {
            return invalid("health disk thresholds must satisfy 0 <= critical <= warn <= 100");
        }
        if !(0.0..=100.0).contains(&health.memory_warn_pct)
            || !(0.0..=100.0).contains(&health.memory_critical_pct)
            || health.memory_warn_pct > health.memory_critical_pct
        {
            return invalid("health memory thresholds must satisfy 0 <= warn <= critical <= 100");
        }
        if self.gpu_monitor.check_interval_secs == 0 {
            return invalid("gpu_monitor.check_interval_secs must be at least 1");
        }
        if self.gpu_monitor.queues.is_empty() {
            return invalid("gpu_monitor.queues must name at least one queue");
        }
        Ok(())
    }

    /// Serialize back to TOML, as printed by `cfh config`.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| CfhError::Serialization {
            context: "toml",
            details: err.to_string(),
        })
    }
}

fn invalid(details: &str) -> Result<()> {
    Err(CfhError::InvalidConfig {
        details: details.to_string(),
    })
}

fn parse_secs(env: &EnvSet, key: &str) -> Result<Option<u64>> {
    let Some(raw) = env.get(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| CfhError::InvalidConfig {
            details: format!("{key} must be a whole number of seconds, got {raw:?}"),
        })
}
