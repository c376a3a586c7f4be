//! celery_fleet_helper: supervise Celery worker fleets split across a CPU
//! server and a GPU server.
//!
//! The library holds everything the `cfh` binary does: environment loading,
//! the per-architecture process plan and routing table, PID-file process
//! supervision, readiness checks and the GPU instance autoscaler.

pub mod core;
pub mod env;
pub mod logger;
pub mod monitor;
pub mod supervisor;
pub mod topology;

#[cfg(feature = "daemon")]
pub mod daemon;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "cli")]
pub mod cli_app;
