//! Start/stop decisions for the on-demand GPU instance.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::errors::Result;

/// Lifecycle state of a compute instance, folded from the provider's status
/// strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "raw")]
pub enum InstanceState {
    Running,
    /// Provisioning or staging; will be running shortly.
    Starting,
    Stopping,
    Stopped,
    NotFound,
    Unknown(String),
}

impl InstanceState {
    /// Map a Compute Engine `status` value.
    #[must_use]
    pub fn from_status(status: &str) -> Self {
        match status.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => Self::Running,
            "PROVISIONING" | "STAGING" | "REPAIRING" => Self::Starting,
            "STOPPING" | "SUSPENDING" => Self::Stopping,
            "TERMINATED" | "STOPPED" | "SUSPENDED" => Self::Stopped,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Control over the remote GPU instance.
pub trait InstanceControl {
    fn state(&self) -> Result<InstanceState>;
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

/// Number of jobs waiting in the GPU queues.
pub trait QueueDepth {
    fn pending(&mut self) -> Result<u64>;
}

/// What one tick decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Decision {
    Start { pending: u64 },
    Stop { idle_secs: u64 },
    /// Work is flowing; the idle clock was reset.
    Busy { pending: u64 },
    Hold { reason: String },
}

/// Idle tracking across ticks.
#[derive(Debug, Clone)]
pub struct Autoscaler {
    idle_timeout: Duration,
    last_activity: Instant,
}

impl Autoscaler {
    /// The idle clock starts at `now`, so a freshly started monitor never
    /// stops an instance before one full idle timeout has passed.
    #[must_use]
    pub const fn new(idle_timeout: Duration, now: Instant) -> Self {
        Self {
            idle_timeout,
            last_activity: now,
        }
    }

    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    pub fn decide(&mut self, pending: u64, state: &InstanceState, now: Instant) -> Decision {
        match state {
            InstanceState::Running | InstanceState::Starting if pending > 0 => {
                self.record_activity(now);
                Decision::Busy { pending }
            }
            InstanceState::Stopped | InstanceState::Unknown(_) if pending > 0 => {
                Decision::Start { pending }
            }
            InstanceState::Stopping if pending > 0 => Decision::Hold {
                reason: "instance is stopping; start once it is down".to_string(),
            },
            InstanceState::NotFound => Decision::Hold {
                reason: "instance not found".to_string(),
            },
            InstanceState::Running => {
                let idle = self.idle_for(now);
                if idle > self.idle_timeout {
                    Decision::Stop {
                        idle_secs: idle.as_secs(),
                    }
                } else {
                    Decision::Hold {
                        reason: format!(
                            "idle {}s of {}s",
                            idle.as_secs(),
                            self.idle_timeout.as_secs()
                        ),
                    }
                }
            }
            _ => Decision::Hold {
                reason: "no pending jobs".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(300);

    #[test]
    fn status_strings_are_folded() {
        assert_eq!(InstanceState::from_status("RUNNING"), InstanceState::Running);
        assert_eq!(InstanceState::from_status("staging"), InstanceState::Starting);
        assert_eq!(InstanceState::from_status("TERMINATED"), InstanceState::Stopped);
        assert_eq!(InstanceState::from_status("STOPPING"), InstanceState::Stopping);
        assert_eq!(
            InstanceState::from_status("WEIRD"),
            InstanceState::Unknown("WEIRD".to_string())
        );
    }

    #[test]
    fn pending_work_starts_a_stopped_instance() {
        let now = Instant::now();
        let mut scaler = Autoscaler::new(TIMEOUT, now);
        assert_eq!(
            scaler.decide(3, &InstanceState::Stopped, now),
            Decision::Start { pending: 3 }
        );
        assert!(matches!(
            scaler.decide(0, &InstanceState::Stopped, now),
            Decision::Hold { .. }
        ));
    }

    #[test]
    fn fresh_monitor_does_not_stop_immediately() {
        let start = Instant::now();
        let mut scaler = Autoscaler::new(TIMEOUT, start);
        assert!(matches!(
            scaler.decide(0, &InstanceState::Running, start + Duration::from_secs(1)),
            Decision::Hold { .. }
        ));
        assert_eq!(
            scaler.decide(0, &InstanceState::Running, start + TIMEOUT + Duration::from_secs(1)),
            Decision::Stop { idle_secs: 301 }
        );
    }

    #[test]
    fn activity_resets_the_idle_clock() {
        let start = Instant::now();
        let mut scaler = Autoscaler::new(TIMEOUT, start);
        let busy_at = start + Duration::from_secs(280);
        assert_eq!(
            scaler.decide(2, &InstanceState::Running, busy_at),
            Decision::Busy { pending: 2 }
        );
        // 310s after start but only 30s after the last busy tick.
        assert!(matches!(
            scaler.decide(0, &InstanceState::Running, start + Duration::from_secs(310)),
            Decision::Hold { .. }
        ));
        assert_eq!(scaler.idle_for(start + Duration::from_secs(310)), Duration::from_secs(30));
    }

    #[test]
    fn stopping_and_missing_instances_are_left_alone() {
        let now = Instant::now();
        let mut scaler = Autoscaler::new(TIMEOUT, now);
        assert!(matches!(
            scaler.decide(5, &InstanceState::Stopping, now),
            Decision::Hold { .. }
        ));
        assert!(matches!(
            scaler.decide(5, &InstanceState::NotFound, now),
            Decision::Hold { .. }
        ));
    }
}
