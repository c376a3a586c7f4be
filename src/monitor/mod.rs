//! Readiness health checks: a set of independent checks rolled up into an
//! overall status with a process exit code.

pub mod checks;
#[cfg(feature = "probes")]
pub mod probes;
pub mod system;

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::config::Config;
use crate::core::errors::{CfhError, Result};
use crate::env::EnvSet;
use crate::topology::Architecture;
use crate::topology::plan::Plan;

use self::system::SystemProbe;

/// Verdict of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    /// Not applicable here; counts toward the total only.
    Skip,
    Error,
}

impl CheckStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Skip => "skip",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, Value>,
}

impl CheckResult {
    fn with_status(status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self::with_status(CheckStatus::Ok, message)
    }

    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self::with_status(CheckStatus::Warning, message)
    }

    #[must_use]
    pub fn skip(message: impl Into<String>) -> Self {
        Self::with_status(CheckStatus::Skip, message)
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::with_status(CheckStatus::Error, message)
    }

    #[must_use]
    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// One readiness check.
pub trait HealthCheck {
    fn name(&self) -> &'static str;

    /// An `Err` is recorded as an `error` result, like a failed check.
    fn run(&self) -> Result<CheckResult>;
}

/// Roll-up of all check results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    MostlyHealthy,
    Warning,
    Critical,
}

impl OverallStatus {
    /// Healthy when nothing failed or warned; warnings (or failures) up to a
    /// fifth of all checks degrade one level at a time.
    #[must_use]
    pub fn from_summary(summary: &Summary) -> Self {
        let fifth_of_total = |count: usize| count * 5 <= summary.total;
        if summary.failed == 0 && summary.warnings == 0 {
            Self::Healthy
        } else if summary.failed == 0 && fifth_of_total(summary.warnings) {
            Self::MostlyHealthy
        } else if fifth_of_total(summary.failed) {
            Self::Warning
        } else {
            Self::Critical
        }
    }

    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Healthy => 0,
            Self::MostlyHealthy | Self::Warning => 1,
            Self::Critical => 2,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::MostlyHealthy => "mostly_healthy",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub warnings: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Summary {
    fn record(&mut self, status: CheckStatus) {
        self.total += 1;
        match status {
            CheckStatus::Ok => self.passed += 1,
            CheckStatus::Warning => self.warnings += 1,
            CheckStatus::Skip => self.skipped += 1,
            CheckStatus::Error => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NamedResult {
    pub name: &'static str,
    #[serde(flatten)]
    pub result: CheckResult,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub architecture: Architecture,
    pub overall_status: OverallStatus,
    pub summary: Summary,
    pub checks: Vec<NamedResult>,
}

impl HealthReport {
    /// Write the report as pretty JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|err| CfhError::io(dir, err))?;
        }
        std::fs::write(path, json).map_err(|err| CfhError::io(path, err))
    }
}

/// The readiness checks for this host, in report order.
#[must_use]
pub fn standard_checks(
    config: &Config,
    env: &EnvSet,
    plan: &Plan,
    probe: &Arc<dyn SystemProbe>,
) -> Vec<Box<dyn HealthCheck>> {
    let mut list: Vec<Box<dyn HealthCheck>> = vec![Box::new(checks::EnvironmentCheck {
        env: env.clone(),
        server: plan.architecture.server,
    })];

    #[cfg(feature = "probes")]
    {
        use crate::env::settings::{DatabaseSettings, RedisSettings};

        let timeout = config.health.connect_timeout();
        let redis = RedisSettings::from_env(env).ok();
        let prefix = &config.gpu_monitor.queue_key_prefix;
        list.push(Box::new(probes::RedisCheck {
            settings: redis.clone(),
            timeout,
        }));
        list.push(Box::new(probes::DatabaseCheck {
            settings: DatabaseSettings::from_env(env).ok(),
            timeout,
        }));
        list.push(Box::new(probes::QueuesCheck {
            settings: redis,
            keys: plan.queues().iter().map(|q| format!("{prefix}{q}")).collect(),
            timeout,
        }));
    }

    list.push(Box::new(checks::WorkersCheck {
        plan: plan.clone(),
        pid_dir: config.paths.pid_dir(),
        app: config.celery.app.clone(),
    }));
    list.push(Box::new(checks::DiskSpaceCheck::from_config(
        &config.health,
        std::slice::from_ref(&config.paths.project_root),
        Arc::clone(probe),
    )));
    list.push(Box::new(checks::MemoryCheck {
        warn_pct: config.health.memory_warn_pct,
        critical_pct: config.health.memory_critical_pct,
        probe: Arc::clone(probe),
    }));
    list
}

/// Run every check in order. Failures and panics inside a check become its
/// `error` result; the run always completes.
pub fn run_checks(architecture: Architecture, checks: &[Box<dyn HealthCheck>]) -> HealthReport {
    let mut summary = Summary::default();
    let mut results = Vec::with_capacity(checks.len());

    for check in checks {
        let started = Instant::now();
        let result = match panic::catch_unwind(AssertUnwindSafe(|| check.run())) {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => CheckResult::error(err.to_string()).detail("code", err.code()),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "check panicked".to_string());
                CheckResult::error(format!("check panicked: {message}"))
            }
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::debug!(check = check.name(), status = result.status.as_str(), duration_ms, "health check finished");
        summary.record(result.status);
        results.push(NamedResult {
            name: check.name(),
            result,
            duration_ms,
        });
    }

    let overall_status = OverallStatus::from_summary(&summary);
    tracing::info!(status = overall_status.as_str(), failed = summary.failed, warnings = summary.warnings, "health checks complete");
    HealthReport {
        generated_at: Utc::now(),
        architecture,
        overall_status,
        summary,
        checks: results,
    }
}
