//! Host-local checks: environment, managed workers, disk space and memory.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::core::config::HealthConfig;
use crate::core::errors::Result;
use crate::env::EnvSet;
use crate::env::settings::{self, Severity};
use crate::supervisor::pidfile::{PidFile, PidRead};
use crate::supervisor;
use crate::topology::ServerType;
use crate::topology::plan::Plan;

use super::system::SystemProbe;
use super::{CheckResult, HealthCheck};

/// Connection settings and role-specific variables.
pub struct EnvironmentCheck {
    pub env: EnvSet,
    pub server: ServerType,
}

impl HealthCheck for EnvironmentCheck {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn run(&self) -> Result<CheckResult> {
        let issues = settings::validate(&self.env, self.server);
        let errors: Vec<&str> = issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .map(|i| i.message.as_str())
            .collect();
        let warnings: Vec<&str> = issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
            .map(|i| i.message.as_str())
            .collect();

        let result = if !errors.is_empty() {
            CheckResult::error(errors.join("; "))
        } else if !warnings.is_empty() {
            CheckResult::warning(warnings.join("; "))
        } else {
            CheckResult::ok("required variables present")
        };
        Ok(result.detail(
            "source",
            self.env
                .source()
                .map_or(Value::Null, |p| Value::from(p.display().to_string())),
        ))
    }
}

/// Liveness of the plan's processes via their PID files. Read-only: stale
/// files are reported, not removed.
/// Planned processes whose PID file names a live process running the app.
pub struct WorkersCheck {
    pub plan: Plan,
    pub pid_dir: PathBuf,
    pub app: String,
}

impl HealthCheck for WorkersCheck {
    fn name(&self) -> &'static str {
        "workers"
    }

    fn run(&self) -> Result<CheckResult> {
        let processes = self.plan.processes();
        let mut running = Vec::new();
        let mut down = Vec::new();
        for managed in &processes {
            let alive = match PidFile::new(&self.pid_dir, &managed.name)?.read()? {
                PidRead::Valid(pid) => supervisor::is_managed(pid, &self.app),
                PidRead::Missing | PidRead::Corrupt(_) => false,
            };
            if alive {
                running.push(managed.name.clone());
            } else {
                down.push(managed.name.clone());
            }
        }

        let result = if running.is_empty() {
            CheckResult::error(format!("no managed processes running ({} planned)", processes.len()))
        } else if down.is_empty() {
            CheckResult::ok(format!("all {} managed processes running", running.len()))
        } else {
            CheckResult::warning(format!("not running: {}", down.join(", ")))
        };
        Ok(result
            .detail("running", running)
            .detail("down", down)
            .detail("total_concurrency", self.plan.total_concurrency()))
    }
}

/// Free space on the watched paths. Paths that do not exist are skipped.
pub struct DiskSpaceCheck {
    pub paths: Vec<PathBuf>,
    pub warn_free_pct: f64,
    pub critical_free_pct: f64,
    pub probe: Arc<dyn SystemProbe>,
}

impl DiskSpaceCheck {
    #[must_use]
    pub fn from_config(health: &HealthConfig, extra: &[PathBuf], probe: Arc<dyn SystemProbe>) -> Self {
        let mut seen = HashSet::new();
        let paths = health
            .disk_paths
            .iter()
            .chain(extra)
            .filter(|p| seen.insert((*p).clone()))
            .cloned()
            .collect();
        Self {
            paths,
            warn_free_pct: health.disk_warn_free_pct,
            critical_free_pct: health.disk_critical_free_pct,
            probe,
        }
    }
}

impl HealthCheck for DiskSpaceCheck {
    fn name(&self) -> &'static str {
        "disk_space"
    }

    fn run(&self) -> Result<CheckResult> {
        let mut critical = Vec::new();
        let mut low = Vec::new();
        let mut checked = serde_json::Map::new();

        for path in self.paths.iter().filter(|p| p.exists()) {
            let free = self.probe.fs_stats(path)?.free_pct();
            let label = format!("{}: {free:.1}% free", path.display());
            checked.insert(path.display().to_string(), Value::from((free * 10.0).round() / 10.0));
            if free < self.critical_free_pct {
                critical.push(label);
            } else if free < self.warn_free_pct {
                low.push(label);
            }
        }

        let result = if !critical.is_empty() {
            CheckResult::error(format!("critically low disk space: {}", critical.join(", ")))
        } else if !low.is_empty() {
            CheckResult::warning(format!("low disk space: {}", low.join(", ")))
        } else if checked.is_empty() {
            CheckResult::skip("none of the watched paths exist")
        } else {
            CheckResult::ok("enough free disk space")
        };
        Ok(result.detail("free_pct", Value::Object(checked)))
    }
}

pub struct MemoryCheck {
    pub warn_pct: f64,
    pub critical_pct: f64,
    pub probe: Arc<dyn SystemProbe>,
}

impl HealthCheck for MemoryCheck {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn run(&self) -> Result<CheckResult> {
        let Some(info) = self.probe.memory_info()? else {
            return Ok(CheckResult::skip("memory figures unavailable on this platform"));
        };
        let used = info.used_pct();
        let result = if used > self.critical_pct {
            CheckResult::error(format!("critically high memory use: {used:.1}%"))
        } else if used > self.warn_pct {
            CheckResult::warning(format!("high memory use: {used:.1}%"))
        } else {
            CheckResult::ok(format!("memory use normal: {used:.1}%"))
        };
        #[allow(clippy::cast_precision_loss)]
        let gib = |bytes: u64| (bytes as f64 / 1_073_741_824.0 * 10.0).round() / 10.0;
        Ok(result
            .detail("total_gb", gib(info.total_bytes))
            .detail("available_gb", gib(info.available_bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::CfhError;
    use crate::monitor::CheckStatus;
    use crate::monitor::system::{FsStats, MemoryInfo};
    use crate::topology::Architecture;
    use std::path::Path;

    struct FakeProbe {
        free_pct: u64,
        memory: Option<MemoryInfo>,
    }

    impl SystemProbe for FakeProbe {
        fn fs_stats(&self, _path: &Path) -> Result<FsStats> {
            Ok(FsStats {
                total_bytes: 100,
                available_bytes: self.free_pct,
            })
        }

        fn memory_info(&self) -> Result<Option<MemoryInfo>> {
            Ok(self.memory)
        }
    }

    struct BrokenProbe;

    impl SystemProbe for BrokenProbe {
        fn fs_stats(&self, path: &Path) -> Result<FsStats> {
            Err(CfhError::PermissionDenied {
                path: path.to_path_buf(),
            })
        }

        fn memory_info(&self) -> Result<Option<MemoryInfo>> {
            Ok(None)
        }
    }

    fn disk(free_pct: u64, paths: Vec<PathBuf>) -> DiskSpaceCheck {
        DiskSpaceCheck {
            paths,
            warn_free_pct: 15.0,
            critical_free_pct: 5.0,
            probe: Arc::new(FakeProbe {
                free_pct,
                memory: None,
            }),
        }
    }

    #[test]
    fn disk_thresholds() {
        let root = vec![PathBuf::from("/")];
        assert_eq!(disk(50, root.clone()).run().expect("run").status, CheckStatus::Ok);
        assert_eq!(disk(10, root.clone()).run().expect("run").status, CheckStatus::Warning);
        let critical = disk(3, root).run().expect("run");
        assert_eq!(critical.status, CheckStatus::Error);
        assert!(critical.message.contains("3.0% free"));
    }

    #[test]
    fn missing_disk_paths_are_skipped() {
        let result = disk(1, vec![PathBuf::from("/definitely/not/here")]).run().expect("run");
        assert_eq!(result.status, CheckStatus::Skip);
    }

    #[test]
    fn disk_probe_errors_propagate() {
        let check = DiskSpaceCheck {
            paths: vec![PathBuf::from("/")],
            warn_free_pct: 15.0,
            critical_free_pct: 5.0,
            probe: Arc::new(BrokenProbe),
        };
        assert_eq!(check.run().unwrap_err().code(), "CFH-3001");
    }

    #[test]
    fn disk_paths_are_deduplicated() {
        let health = HealthConfig::default();
        let check = DiskSpaceCheck::from_config(
            &health,
            &[PathBuf::from("/"), PathBuf::from("/srv/app")],
            Arc::new(BrokenProbe),
        );
        assert_eq!(check.paths.iter().filter(|p| p.as_path() == Path::new("/")).count(), 1);
        assert!(check.paths.contains(&PathBuf::from("/srv/app")));
    }

    #[test]
    fn memory_thresholds_and_platform_skip() {
        let memory = |available: u64| MemoryCheck {
            warn_pct: 80.0,
            critical_pct: 90.0,
            probe: Arc::new(FakeProbe {
                free_pct: 50,
                memory: Some(MemoryInfo {
                    total_bytes: 100,
                    available_bytes: available,
                }),
            }),
        };
        assert_eq!(memory(50).run().expect("run").status, CheckStatus::Ok);
        assert_eq!(memory(15).run().expect("run").status, CheckStatus::Warning);
        assert_eq!(memory(5).run().expect("run").status, CheckStatus::Error);

        let unavailable = MemoryCheck {
            warn_pct: 80.0,
            critical_pct: 90.0,
            probe: Arc::new(BrokenProbe),
        };
        assert_eq!(unavailable.run().expect("run").status, CheckStatus::Skip);
    }

    #[test]
    fn environment_check_reports_missing_settings() {
        let check = EnvironmentCheck {
            env: EnvSet::default(),
            server: ServerType::Cpu,
        };
        let result = check.run().expect("run");
        assert_eq!(result.status, CheckStatus::Error);
        assert!(result.message.contains("CFH-1005"), "{}", result.message);
    }

    #[test]
    fn workers_check_with_no_pid_files_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let check = WorkersCheck {
            plan: Plan::for_architecture(Architecture::new(ServerType::Gpu, true)),
            pid_dir: dir.path().to_path_buf(),
            app: "cfh_app".to_string(),
        };
        let result = check.run().expect("run");
        assert_eq!(result.status, CheckStatus::Error);
        assert_eq!(
            result.details.get("down"),
            Some(&serde_json::json!(["embeddings_gpu", "scoring_tasks", "default_gpu"]))
        );
    }

    #[test]
    fn workers_check_partial_is_a_warning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut worker = std::process::Command::new("sh")
            .args(["-c", "sleep 30; true", "celery", "-A", "cfh_app", "worker"])
            .stdin(std::process::Stdio::null())
            .spawn()
            .expect("spawn");
        PidFile::new(dir.path(), "embeddings_gpu")
            .expect("name")
            .write(worker.id())
            .expect("write");
        // The test binary itself is alive but is not a worker of the app.
        PidFile::new(dir.path(), "scoring_tasks")
            .expect("name")
            .write(std::process::id())
            .expect("write");
        let check = WorkersCheck {
            plan: Plan::for_architecture(Architecture::new(ServerType::Gpu, true)),
            pid_dir: dir.path().to_path_buf(),
            app: "cfh_app".to_string(),
        };
        let result = check.run().expect("run");
        worker.kill().expect("kill");
        worker.wait().expect("wait");

        assert_eq!(result.status, CheckStatus::Warning, "{result:?}");
        assert_eq!(result.details.get("running"), Some(&serde_json::json!(["embeddings_gpu"])));
        assert!(result.message.contains("scoring_tasks"));
    }
}
