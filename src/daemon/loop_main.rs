//! The GPU monitor loop: poll queue depth and instance state on a fixed
//! interval and act on the autoscaler's decision.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, select, tick};
use serde::Serialize;

use crate::core::errors::Result;

use super::autoscaler::{Autoscaler, Decision, InstanceControl, InstanceState, QueueDepth};

/// Everything one tick observed and did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub pending: u64,
    pub instance: InstanceState,
    pub decision: Decision,
    /// Whether a start or stop call was made and succeeded.
    pub acted: bool,
}

pub struct GpuMonitor<Q, I> {
    queues: Q,
    instance: I,
    scaler: Autoscaler,
    interval: Duration,
}

impl<Q: QueueDepth, I: InstanceControl> GpuMonitor<Q, I> {
    #[must_use]
    pub fn new(queues: Q, instance: I, interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            queues,
            instance,
            scaler: Autoscaler::new(idle_timeout, Instant::now()),
            interval,
        }
    }

    /// One observation and at most one start or stop call.
    pub fn tick(&mut self, now: Instant) -> Result<TickReport> {
        let pending = self.queues.pending()?;
        let instance = self.instance.state()?;
        let decision = self.scaler.decide(pending, &instance, now);

        let acted = match &decision {
            Decision::Start { pending } => {
                tracing::info!(pending, "GPU jobs waiting, starting instance");
                self.instance.start()?;
                self.scaler.record_activity(now);
                true
            }
            Decision::Stop { idle_secs } => {
                tracing::info!(idle_secs, "GPU instance idle, stopping");
                self.instance.stop()?;
                true
            }
            Decision::Busy { pending } => {
                tracing::debug!(pending, "GPU instance busy");
                false
            }
            Decision::Hold { reason } => {
                tracing::debug!(%reason, "holding");
                false
            }
        };
        Ok(TickReport {
            pending,
            instance,
            decision,
            acted,
        })
    }

    /// Tick immediately, then every interval, until `shutdown` yields or
    /// disconnects. Tick failures are logged and do not end the loop.
    pub fn run(&mut self, shutdown: &Receiver<i32>) {
        tracing::info!(interval_secs = self.interval.as_secs(), "GPU monitor started");
        let ticker = tick(self.interval);
        self.tick_logged();
        loop {
            select! {
                recv(shutdown) -> _ => break,
                recv(ticker) -> _ => self.tick_logged(),
            }
        }
        tracing::info!("GPU monitor stopped");
    }

    fn tick_logged(&mut self) {
        if let Err(err) = self.tick(Instant::now()) {
            tracing::error!(error = %err, code = err.code(), "GPU monitor tick failed");
        }
    }
}
