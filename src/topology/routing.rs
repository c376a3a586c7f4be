//! Task routing table: task-name patterns mapped to queue names.
//!
//! Patterns are either exact task names or `prefix.*`. Lookup prefers an exact
//! match, then the longest matching prefix.

use serde::Serialize;

use super::{Architecture, ServerType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub pattern: &'static str,
    pub queue: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

const CPU_BASE: &[(&str, &str)] = &[
    ("tasks.workflows.*", "default"),
    ("tasks.analysis_tasks.*", "default"),
    ("tasks.notification_tasks.*", "default"),
    ("tasks.integration_tasks.*", "default"),
    ("tasks.fillout_tasks.*", "fillout"),
    ("tasks.matching.*", "search_basic"),
];

const GPU_OFFLOAD: &[(&str, &str)] = &[
    ("tasks.embedding_tasks.*", "embeddings_gpu"),
    ("tasks.scoring_tasks.*", "scoring_tasks"),
];

const GPU_FALLBACK: &[(&str, &str)] = &[
    ("tasks.embedding_tasks.*", "default"),
    ("tasks.scoring_tasks.*", "default"),
];

impl RoutingTable {
    #[must_use]
    pub fn for_architecture(architecture: Architecture) -> Self {
        let entries: Vec<&(&str, &str)> = match architecture.server {
            ServerType::Gpu => GPU_OFFLOAD.iter().collect(),
            ServerType::Cpu if architecture.gpu_enabled => {
                CPU_BASE.iter().chain(GPU_OFFLOAD).collect()
            }
            ServerType::Cpu => CPU_BASE.iter().chain(GPU_FALLBACK).collect(),
        };
        Self {
            routes: entries
                .into_iter()
                .map(|&(pattern, queue)| Route { pattern, queue })
                .collect(),
        }
    }

    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Queue for `task`, or `None` when Celery's default queue applies.
    #[must_use]
    pub fn route(&self, task: &str) -> Option<&'static str> {
        if let Some(exact) = self.routes.iter().find(|r| r.pattern == task) {
            return Some(exact.queue);
        }
        self.routes
            .iter()
            .filter_map(|r| {
                let prefix = r.pattern.strip_suffix('*')?;
                task.starts_with(prefix).then_some((prefix.len(), r.queue))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, queue)| queue)
    }

    /// Distinct destination queues in table order.
    #[must_use]
    pub fn queues(&self) -> Vec<&'static str> {
        let mut queues = Vec::new();
        for route in &self.routes {
            if !queues.contains(&route.queue) {
                queues.push(route.queue);
            }
        }
        queues
    }
}
