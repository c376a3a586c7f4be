//! Process plans per architecture.

use serde::Serialize;

use super::{Architecture, ServerType};

/// Name of the managed beat scheduler process.
pub const BEAT_PROCESS: &str = "beat";

/// Name of the managed flower dashboard process.
pub const FLOWER_PROCESS: &str = "flower";

/// Celery execution pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Pool {
    Prefork,
    /// Single in-process executor; keeps CUDA contexts out of forked children.
    Solo,
}

impl Pool {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Prefork => "prefork",
            Self::Solo => "solo",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSpec {
    pub name: &'static str,
    pub queues: Vec<&'static str>,
    pub concurrency: u32,
    pub prefetch_multiplier: u32,
    pub max_tasks_per_child: u32,
    pub time_limit_secs: u32,
    pub soft_time_limit_secs: u32,
    pub pool: Pool,
}

/// What a managed process runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProcessKind {
    Worker(WorkerSpec),
    Beat,
    Flower { port: u16 },
}

/// A process the supervisor owns a PID file for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedProcess {
    pub name: String,
    #[serde(flatten)]
    pub kind: ProcessKind,
}

impl ManagedProcess {
    #[must_use]
    pub fn worker(spec: WorkerSpec) -> Self {
        Self {
            name: spec.name.to_string(),
            kind: ProcessKind::Worker(spec),
        }
    }

    #[must_use]
    pub fn beat() -> Self {
        Self {
            name: BEAT_PROCESS.to_string(),
            kind: ProcessKind::Beat,
        }
    }

    #[must_use]
    pub fn flower(port: u16) -> Self {
        Self {
            name: FLOWER_PROCESS.to_string(),
            kind: ProcessKind::Flower { port },
        }
    }
}

/// Everything one host runs for a given architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub architecture: Architecture,
    pub workers: Vec<WorkerSpec>,
    pub runs_beat: bool,
    /// systemd units expected on this host (informational).
    pub services: Vec<&'static str>,
}

impl Plan {
    #[must_use]
    pub fn for_architecture(architecture: Architecture) -> Self {
        match architecture.server {
            ServerType::Cpu => cpu_plan(architecture),
            ServerType::Gpu => gpu_plan(architecture),
        }
    }

    /// Union of worker queues in declaration order.
    #[must_use]
    pub fn queues(&self) -> Vec<&'static str> {
        let mut queues = Vec::new();
        for worker in &self.workers {
            for queue in &worker.queues {
                if !queues.contains(queue) {
                    queues.push(*queue);
                }
            }
        }
        queues
    }

    /// Managed processes started by `start`, workers first.
    #[must_use]
    pub fn processes(&self) -> Vec<ManagedProcess> {
        let mut processes: Vec<ManagedProcess> = self
            .workers
            .iter()
            .cloned()
            .map(ManagedProcess::worker)
            .collect();
        if self.runs_beat {
            processes.push(ManagedProcess::beat());
        }
        processes
    }

    #[must_use]
    pub fn process(&self, name: &str) -> Option<ManagedProcess> {
        self.processes().into_iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn total_concurrency(&self) -> u32 {
        self.workers.iter().map(|w| w.concurrency).sum()
    }
}

#[allow(clippy::too_many_arguments)]
const fn spec(
    name: &'static str,
    concurrency: u32,
    prefetch_multiplier: u32,
    max_tasks_per_child: u32,
    time_limit_secs: u32,
    soft_time_limit_secs: u32,
    pool: Pool,
) -> WorkerSpec {
    WorkerSpec {
        name,
        queues: Vec::new(),
        concurrency,
        prefetch_multiplier,
        max_tasks_per_child,
        time_limit_secs,
        soft_time_limit_secs,
        pool,
    }
}

fn on(mut worker: WorkerSpec, queues: &[&'static str]) -> WorkerSpec {
    worker.queues = queues.to_vec();
    worker
}

fn cpu_plan(architecture: Architecture) -> Plan {
    let mut workers = vec![
        on(spec("default", 2, 2, 500, 300, 240, Pool::Prefork), &["default"]),
        on(spec("fillout", 2, 1, 100, 180, 150, Pool::Prefork), &["fillout"]),
        on(
            spec("search_basic", 2, 1, 100, 300, 240, Pool::Prefork),
            &["search_basic"],
        ),
    ];
    // Without a GPU host the CPU server drains the GPU queues itself.
    if !architecture.gpu_enabled {
        workers.push(on(
            spec("embeddings_cpu", 1, 1, 50, 600, 540, Pool::Prefork),
            &["embeddings_gpu"],
        ));
        workers.push(on(
            spec("scoring_cpu", 1, 1, 50, 300, 240, Pool::Prefork),
            &["scoring_tasks"],
        ));
    }

    let mut services = vec!["redis-server", "postgresql", "hr-celery-beat"];
    if architecture.gpu_enabled {
        services.push("hr-gpu-monitor");
    }

    Plan {
        architecture,
        workers,
        runs_beat: true,
        services,
    }
}

fn gpu_plan(architecture: Architecture) -> Plan {
    Plan {
        architecture,
        workers: vec![
            on(
                spec("embeddings_gpu", 1, 1, 50, 600, 540, Pool::Solo),
                &["embeddings_gpu"],
            ),
            on(
                spec("scoring_tasks", 1, 1, 50, 300, 240, Pool::Solo),
                &["scoring_tasks"],
            ),
            on(
                spec("default_gpu", 1, 1, 100, 300, 240, Pool::Solo),
                &["default"],
            ),
        ],
        runs_beat: false,
        services: vec!["hr-celery-workers"],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(plan: &Plan) -> Vec<&'static str> {
        plan.workers.iter().map(|w| w.name).collect()
    }

    #[test]
    fn cpu_without_gpu_drains_gpu_queues() {
        let plan = Plan::for_architecture(Architecture::new(ServerType::Cpu, false));
        assert_eq!(
            names(&plan),
            vec!["default", "fillout", "search_basic", "embeddings_cpu", "scoring_cpu"]
        );
        assert_eq!(
            plan.queues(),
            vec!["default", "fillout", "search_basic", "embeddings_gpu", "scoring_tasks"]
        );
        assert!(plan.runs_beat);
        assert!(!plan.services.contains(&"hr-gpu-monitor"));
        assert_eq!(plan.total_concurrency(), 8);
    }

    #[test]
    fn cpu_with_gpu_leaves_gpu_queues_alone() {
        let plan = Plan::for_architecture(Architecture::new(ServerType::Cpu, true));
        assert_eq!(names(&plan), vec!["default", "fillout", "search_basic"]);
        assert!(!plan.queues().contains(&"embeddings_gpu"));
        assert!(plan.services.contains(&"hr-gpu-monitor"));
        let names: Vec<String> = plan.processes().into_iter().map(|p| p.name).collect();
        assert_eq!(names.last().map(String::as_str), Some(BEAT_PROCESS));
    }

    #[test]
    fn gpu_plan_uses_solo_pool_and_no_beat() {
        let plan = Plan::for_architecture(Architecture::new(ServerType::Gpu, true));
        assert_eq!(names(&plan), vec!["embeddings_gpu", "scoring_tasks", "default_gpu"]);
        assert_eq!(plan.queues(), vec!["embeddings_gpu", "scoring_tasks", "default"]);
        assert!(plan.workers.iter().all(|w| w.pool == Pool::Solo && w.concurrency == 1));
        let default_gpu = plan.workers.iter().find(|w| w.name == "default_gpu").expect("default_gpu");
        assert_eq!(
            (default_gpu.max_tasks_per_child, default_gpu.time_limit_secs, default_gpu.soft_time_limit_secs),
            (100, 300, 240)
        );
        assert!(!plan.runs_beat);
        assert!(plan.process(BEAT_PROCESS).is_none());
    }

    #[test]
    fn worker_limits_match_queue_profiles() {
        let plan = Plan::for_architecture(Architecture::new(ServerType::Cpu, false));
        let fillout = plan.workers.iter().find(|w| w.name == "fillout").expect("fillout");
        assert_eq!(
            (fillout.time_limit_secs, fillout.soft_time_limit_secs, fillout.max_tasks_per_child),
            (180, 150, 100)
        );
        assert!(plan
            .workers
            .iter()
            .all(|w| w.soft_time_limit_secs < w.time_limit_secs));
    }
}
