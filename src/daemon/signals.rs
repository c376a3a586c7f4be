//! SIGINT/SIGTERM delivered as messages on a channel.

use std::thread;

use crossbeam_channel::{Receiver, bounded};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::core::errors::{CfhError, Result};

/// Register handlers and forward each received signal number. The forwarding
/// thread lives for the rest of the process.
pub fn shutdown_channel() -> Result<Receiver<i32>> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|err| CfhError::Runtime {
        details: format!("cannot install signal handlers: {err}"),
    })?;
    let (tx, rx) = bounded(4);
    thread::Builder::new()
        .name("cfh-signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                tracing::info!(signal, "shutdown signal received");
                if tx.send(signal).is_err() {
                    break;
                }
            }
        })
        .map_err(|err| CfhError::Runtime {
            details: format!("cannot spawn signal thread: {err}"),
        })?;
    Ok(rx)
}
