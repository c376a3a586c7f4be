//! GPU instance autoscaling: a foreground loop on the CPU server that starts
//! the GPU instance when its queues fill and stops it after an idle period.

pub mod autoscaler;
pub mod gcloud;
pub mod loop_main;
pub mod queues;
pub mod signals;
