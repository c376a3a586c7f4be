//! `cfh` binary entry point.

use std::process::ExitCode;

use clap::Parser;

use celery_fleet_helper::cli_app::{self, Cli};
use celery_fleet_helper::logger;

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logger::init(cli.verbose) {
        eprintln!("warning: {err}");
    }
    match cli_app::run(&cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            tracing::debug!(code = err.code(), retryable = err.is_retryable(), "command failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}
