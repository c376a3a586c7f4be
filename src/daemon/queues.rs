//! Queue depth from the broker's Redis lists.

use std::time::Duration;

use crate::core::errors::Result;
use crate::env::settings::RedisSettings;
use crate::monitor::probes;

use super::autoscaler::QueueDepth;

/// Sums `LLEN` over the GPU queue keys, reconnecting after any failure.
pub struct RedisQueueDepth {
    settings: RedisSettings,
    keys: Vec<String>,
    timeout: Duration,
    connection: Option<redis::Connection>,
}

impl RedisQueueDepth {
    #[must_use]
    pub fn new(settings: RedisSettings, keys: Vec<String>, timeout: Duration) -> Self {
        Self {
            settings,
            keys,
            timeout,
            connection: None,
        }
    }

    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

/// Broker keys for `queues`: the configured prefix plus the queue name.
#[must_use]
pub fn queue_keys(prefix: &str, queues: &[String]) -> Vec<String> {
    queues.iter().map(|q| format!("{prefix}{q}")).collect()
}

impl QueueDepth for RedisQueueDepth {
    fn pending(&mut self) -> Result<u64> {
        let mut con = match self.connection.take() {
            Some(con) => con,
            None => probes::redis_connection(&self.settings, self.timeout)?,
        };
        let lengths = probes::queue_lengths(&mut con, &self.keys)?;
        self.connection = Some(con);
        for (key, len) in lengths.iter().filter(|(_, len)| *len > 0) {
            tracing::info!(queue = %key, pending = len, "GPU queue has work");
        }
        Ok(lengths.iter().map(|(_, len)| len).sum())
    }
}
