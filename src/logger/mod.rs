//! Diagnostic logging: `tracing` events formatted to stderr, filtered by
//! `CFH_LOG` (same syntax as `RUST_LOG`).

use tracing_subscriber::EnvFilter;

use crate::core::errors::{CfhError, Result};

/// Variable holding the filter directives.
pub const LOG_ENV_VAR: &str = "CFH_LOG";

/// Filter directives: `CFH_LOG` when set, else `info` (`debug` when verbose).
#[must_use]
pub fn filter_directives(env_value: Option<&str>, verbose: bool) -> String {
    match env_value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(value) => value.to_string(),
        None if verbose => "debug".to_string(),
        None => "info".to_string(),
    }
}

/// Install the global subscriber. Stdout stays free for command output.
pub fn init(verbose: bool) -> Result<()> {
    let directives = filter_directives(std::env::var(LOG_ENV_VAR).ok().as_deref(), verbose);
    let filter = EnvFilter::try_new(&directives).map_err(|err| CfhError::InvalidConfig {
        details: format!("{LOG_ENV_VAR}={directives:?}: {err}"),
    })?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| CfhError::Runtime {
            details: format!("logger already installed: {err}"),
        })
}

#[cfg(test)]
mod tests {
    use super::filter_directives;

    #[test]
    fn env_value_wins_over_verbosity() {
        assert_eq!(filter_directives(Some("warn,celery_fleet_helper=trace"), true), "warn,celery_fleet_helper=trace");
        assert_eq!(filter_directives(None, false), "info");
        assert_eq!(filter_directives(None, true), "debug");
        assert_eq!(filter_directives(Some("  "), false), "info");
    }
}
