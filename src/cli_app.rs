//! Top-level CLI definition and dispatch.

use std::io::{IsTerminal, Write as _};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use serde::Serialize;
use serde_json::json;

use crate::cli::render;
use crate::core::config::{CONFIG_ENV_VAR, Config};
use crate::core::errors::{CfhError, Result};
use crate::daemon::gcloud::{GcloudInstance, InstanceTarget};
use crate::daemon::loop_main::GpuMonitor;
use crate::daemon::queues::{RedisQueueDepth, queue_keys};
use crate::daemon::signals;
use crate::env::EnvSet;
use crate::env::settings::{self, DatabaseSettings, RedisSettings, Severity};
use crate::monitor::probes;
use crate::monitor::system::{HostProbe, SystemProbe};
use crate::monitor::{run_checks, standard_checks};
use crate::supervisor::{StartOptions, Supervisor, logs};
use crate::topology::plan::Plan;
use crate::topology::routing::RoutingTable;
use crate::topology::{Architecture, ServerType};

/// Poll interval for `logs --follow`.
const FOLLOW_POLL: Duration = Duration::from_millis(250);

/// cfh - supervisor for Celery worker fleets on CPU and GPU servers.
#[derive(Debug, Parser)]
#[command(name = "cfh", version, about, long_about = None)]
pub struct Cli {
    /// Server role; overrides SERVER_TYPE.
    #[arg(long, global = true, value_name = "cpu|gpu")]
    pub server_type: Option<ServerType>,
    /// Environment file loaded under the process environment.
    #[arg(long, global = true, value_name = "PATH")]
    pub env_file: Option<PathBuf>,
    /// TOML configuration file.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,
    /// Debug logging on stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Launch the planned worker processes.
    Start {
        /// Launch only these processes (repeatable or comma-separated).
        #[arg(long, value_delimiter = ',', value_name = "NAME")]
        only: Vec<String>,
        /// Show the command lines without launching anything.
        #[arg(long)]
        dry_run: bool,
        /// Skip the environment, Redis and database checks.
        #[arg(long)]
        skip_preflight: bool,
    },
    /// Stop every managed process, then sweep leftovers by pattern.
    Stop,
    /// Stop, then start.
    Restart {
        #[arg(long, value_delimiter = ',', value_name = "NAME")]
        only: Vec<String>,
        #[arg(long)]
        skip_preflight: bool,
    },
    /// Show the state of every managed process.
    Status,
    /// Print the tail of one or every managed log.
    Logs {
        /// Process name; every log when omitted.
        name: Option<String>,
        /// Number of lines.
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
        /// Keep printing appended output until interrupted.
        #[arg(short, long)]
        follow: bool,
    },
    /// Launch the flower dashboard.
    Flower {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the readiness checks (exit 0 healthy, 1 degraded, 2 critical).
    Health {
        /// Also write the JSON report to this file.
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Validate the environment for this server role.
    Validate,
    /// Print the effective configuration.
    Config,
    /// Print the worker plan for this server role.
    Workers,
    /// Print the task routing table, or the queue for one task.
    Routes {
        #[arg(long, value_name = "NAME")]
        task: Option<String>,
    },
    /// Start and stop the GPU instance from queue depth.
    GpuMonitor {
        /// Run a single tick and exit.
        #[arg(long)]
        once: bool,
    },
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Everything a command needs after config and environment are resolved.
struct Context {
    config: Config,
    env: EnvSet,
    architecture: Architecture,
    json: bool,
}

impl Context {
    fn load(cli: &Cli) -> Result<Self> {
        let env_value = std::env::var(CONFIG_ENV_VAR).ok();
        let (path, required) = Config::resolve_path(cli.config.as_deref(), env_value.as_deref());
        let mut config = Config::load(&path, required)?;
        let env_path = cli
            .env_file
            .clone()
            .unwrap_or_else(|| config.paths.env_file());
        let env = EnvSet::load(&env_path, EnvSet::from_process())?;
        config.apply_env_overrides(&env)?;
        let architecture = Architecture::detect(cli.server_type, &env)?;
        tracing::debug!(
            config = %path.display(),
            env_file = %env_path.display(),
            server = %architecture.server,
            gpu = architecture.gpu_enabled,
            "context loaded"
        );
        Ok(Self {
            config,
            env,
            architecture,
            json: cli.json,
        })
    }

    fn plan(&self) -> Plan {
        Plan::for_architecture(self.architecture)
    }

    fn supervisor(&self) -> Supervisor {
        Supervisor::new(self.config.clone(), self.env.clone(), self.plan())
    }

    /// Print `value` as JSON, or the rendered text.
    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce() -> String) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        } else {
            print!("{}", text());
        }
        Ok(())
    }
}

/// Dispatch a parsed command line. Returns the process exit code.
pub fn run(cli: &Cli) -> Result<u8> {
    if cli.json || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }
    if let Command::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "cfh", &mut std::io::stdout());
        return Ok(0);
    }

    let ctx = Context::load(cli)?;
    match &cli.command {
        Command::Start {
            only,
            dry_run,
            skip_preflight,
        } => {
            if !*skip_preflight && !*dry_run {
                preflight(&ctx)?;
            }
            let report = ctx.supervisor().start(&StartOptions {
                only: only.clone(),
                dry_run: *dry_run,
            })?;
            ctx.emit(&report, || render::format_start_report(&report))?;
            Ok(exit_flag(report.success))
        }
        Command::Stop => {
            let report = ctx.supervisor().stop()?;
            ctx.emit(&report, || render::format_stop_report(&report))?;
            Ok(exit_flag(report.success))
        }
        Command::Restart {
            only,
            skip_preflight,
        } => {
            if !*skip_preflight {
                preflight(&ctx)?;
            }
            let report = ctx.supervisor().restart(&StartOptions {
                only: only.clone(),
                dry_run: false,
            })?;
            ctx.emit(&report, || render::format_restart_report(&report))?;
            Ok(exit_flag(report.success))
        }
        Command::Status => {
            let report = ctx.supervisor().status()?;
            ctx.emit(&report, || render::format_status(&report))?;
            Ok(exit_flag(report.all_planned_running))
        }
        Command::Logs {
            name,
            lines,
            follow,
        } => show_logs(&ctx, name.as_deref(), *lines, *follow),
        Command::Flower { port, dry_run } => {
            let port = port.unwrap_or(ctx.config.flower.port);
            let report = ctx.supervisor().launch_flower(port, *dry_run);
            ctx.emit(&report, || render::format_start_report(&report))?;
            Ok(exit_flag(report.success))
        }
        Command::Health { output } => {
            let probe: Arc<dyn SystemProbe> = Arc::new(HostProbe);
            let checks = standard_checks(&ctx.config, &ctx.env, &ctx.plan(), &probe);
            let report = run_checks(ctx.architecture, &checks);
            if let Some(path) = output {
                report.write_json(path)?;
            }
            ctx.emit(&report, || render::format_health(&report))?;
            Ok(u8::try_from(report.overall_status.exit_code()).unwrap_or(2))
        }
        Command::Validate => validate(&ctx),
        Command::Config => {
            if ctx.json {
                println!("{}", serde_json::to_string_pretty(&ctx.config)?);
            } else {
                print!("{}", ctx.config.to_toml()?);
            }
            Ok(0)
        }
        Command::Workers => {
            let plan = ctx.plan();
            ctx.emit(&plan, || render::format_plan(&plan))?;
            Ok(0)
        }
        Command::Routes { task } => {
            let table = RoutingTable::for_architecture(ctx.architecture);
            match task {
                Some(task) => {
                    let queue = table.route(task);
                    ctx.emit(&json!({ "task": task, "queue": queue }), || {
                        format!("{task} -> {}\n", queue.unwrap_or("(celery default queue)"))
                    })?;
                }
                None => ctx.emit(&table, || render::format_routes(&table))?,
            }
            Ok(0)
        }
        Command::GpuMonitor { once } => gpu_monitor(&ctx, *once),
        Command::Completions { .. } => Ok(0),
    }
}

const fn exit_flag(success: bool) -> u8 {
    if success { 0 } else { 1 }
}

/// Required variables present, Redis and the database answering.
fn preflight(ctx: &Context) -> Result<()> {
    let (redis, database) = settings::require_connection_settings(&ctx.env)?;
    let timeout = ctx.config.health.connect_timeout();
    probes::ping_redis(&redis, timeout)?;
    tracing::info!(redis = %redis.masked(), "redis reachable");
    let version = probes::ping_database(&database, timeout)?;
    tracing::info!(database = %database.masked(), %version, "database reachable");
    Ok(())
}

fn validate(ctx: &Context) -> Result<u8> {
    let issues = settings::validate(&ctx.env, ctx.architecture.server);
    let failed = issues.iter().any(|i| i.severity == Severity::Error);
    let payload = json!({
        "architecture": ctx.architecture,
        "env_file": ctx.env.source(),
        "variables_from_file": ctx.env.from_file_count(),
        "redis": RedisSettings::from_env(&ctx.env).ok().map(|r| r.masked()),
        "database": DatabaseSettings::from_env(&ctx.env).ok().map(|d| d.masked()),
        "valid": !failed,
        "issues": issues,
    });
    ctx.emit(&payload, || {
        let mut out = format!(
            "{} server, GPU {}\n",
            ctx.architecture.server.as_str().cyan(),
            if ctx.architecture.gpu_enabled { "enabled" } else { "disabled" }
        );
        out.push_str(&render::format_issues(&issues));
        out
    })?;
    Ok(exit_flag(!failed))
}

fn show_logs(ctx: &Context, name: Option<&str>, lines: usize, follow: bool) -> Result<u8> {
    let supervisor = ctx.supervisor();
    let files = supervisor.log_files(name)?;
    if follow && files.len() != 1 {
        return Err(CfhError::InvalidConfig {
            details: "--follow needs exactly one process name".to_string(),
        });
    }

    if ctx.json {
        let mut payload = Vec::new();
        for (name, path) in &files {
            let tail = if path.is_file() {
                logs::tail_lines(path, lines)?.0
            } else {
                Vec::new()
            };
            payload.push(json!({ "name": name, "path": path, "lines": tail }));
        }
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(0);
    }

    if files.is_empty() {
        println!("{}", "No log files yet".yellow());
        return Ok(0);
    }
    let mut stdout = std::io::stdout().lock();
    let offset = write_tails(&mut stdout, &files, lines)?;
    if follow {
        let stop = Arc::new(AtomicBool::new(false));
        for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&stop)).map_err(|err| {
                CfhError::Runtime {
                    details: format!("cannot install signal handler: {err}"),
                }
            })?;
        }
        let (_, path) = &files[0];
        logs::follow(path, offset, FOLLOW_POLL, &stop, &mut stdout)?;
    }
    Ok(0)
}

/// Print the last `lines` of each file; returns the end offset of the last one read.
fn write_tails(out: &mut impl std::io::Write, files: &[(String, PathBuf)], lines: usize) -> Result<u64> {
    let stdout_err = |err: std::io::Error| CfhError::io("<stdout>", err);
    let mut offset = 0;
    for (name, path) in files {
        if files.len() > 1 {
            writeln!(out, "==> {} <==", name.cyan()).map_err(stdout_err)?;
        }
        if !path.is_file() {
            writeln!(out, "(no log at {})", path.display()).map_err(stdout_err)?;
            continue;
        }
        let (tail, end) = logs::tail_lines(path, lines)?;
        for line in tail {
            writeln!(out, "{line}").map_err(stdout_err)?;
        }
        offset = end;
    }
    Ok(offset)
}

fn gpu_monitor(ctx: &Context, once: bool) -> Result<u8> {
    let target = InstanceTarget::resolve(ctx.architecture, &ctx.env, &ctx.config)?;
    let redis = RedisSettings::from_env(&ctx.env)?;
    let monitor_config = &ctx.config.gpu_monitor;
    let keys = queue_keys(&monitor_config.queue_key_prefix, &monitor_config.queues);
    tracing::info!(
        instance = %target.name,
        zone = %target.zone,
        project = %target.project,
        queues = ?keys,
        "GPU monitor configured"
    );
    let queues = RedisQueueDepth::new(redis, keys, ctx.config.health.connect_timeout());
    let instance = GcloudInstance::new(monitor_config.gcloud_binary.clone(), target);
    let mut monitor = GpuMonitor::new(
        queues,
        instance,
        monitor_config.check_interval(),
        monitor_config.idle_timeout(),
    );

    if once {
        let report = monitor.tick(Instant::now())?;
        ctx.emit(&report, || render::format_tick(&report))?;
        return Ok(0);
    }
    let shutdown = signals::shutdown_channel()?;
    monitor.run(&shutdown);
    Ok(0)
}
