//! Human-readable formatting of reports. Every function returns a `String`
//! so output stays testable; color comes from `colored` and is switched off
//! globally when stdout is not a terminal.

use std::fmt::Write as _;

use colored::Colorize;

use crate::daemon::loop_main::TickReport;
use crate::env::settings::{Issue, Severity};
use crate::monitor::{CheckStatus, HealthReport, OverallStatus};
use crate::supervisor::{ProcessState, RestartReport, StartReport, StatusReport, Steps, StopReport};
use crate::topology::plan::Plan;
use crate::topology::routing::RoutingTable;

fn format_steps(out: &mut String, steps: &Steps) {
    for step in &steps.steps {
        let icon = if step.error.is_some() {
            "FAIL".red()
        } else if step.done {
            "DONE".green()
        } else {
            "PLAN".yellow()
        };
        let _ = writeln!(out, "  [{icon}] {}", step.description);
        if let Some(err) = &step.error {
            let _ = writeln!(out, "         error: {err}");
        }
    }
}

#[must_use]
pub fn format_start_report(report: &StartReport) -> String {
    let mut out = String::new();
    let mode = if report.dry_run { "dry-run" } else { "start" };
    let _ = writeln!(out, "cfh {mode} report:\n");
    format_steps(&mut out, &report.steps);

    if report.dry_run {
        for line in &report.planned {
            let _ = writeln!(out, "\n  {}\n    cwd: {}", line, line.cwd.display());
        }
    } else if !report.launched.is_empty() {
        out.push('\n');
        for launched in &report.launched {
            let _ = writeln!(
                out,
                "  {:<20} pid {:<8} log {}",
                launched.name.cyan(),
                launched.pid,
                launched.log.display()
            );
        }
    }
    if !report.skipped.is_empty() {
        let _ = writeln!(out, "\n  already running: {}", report.skipped.join(", "));
    }
    out
}

#[must_use]
pub fn format_stop_report(report: &StopReport) -> String {
    let mut out = String::from("cfh stop report:\n\n");
    format_steps(&mut out, &report.steps);
    if report.steps.steps.is_empty() {
        let _ = writeln!(out, "  {}", "Nothing was running".yellow());
    }
    if !report.removed_pid_files.is_empty() {
        let _ = writeln!(out, "\n  removed {} PID file(s)", report.removed_pid_files.len());
    }
    out
}

#[must_use]
pub fn format_restart_report(report: &RestartReport) -> String {
    let mut out = format_stop_report(&report.stop);
    out.push('\n');
    out.push_str(&format_start_report(&report.start));
    out
}

#[must_use]
pub fn format_status(report: &StatusReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:<9} {:<8} {:<25} LOG",
        "PROCESS", "STATE", "PID", "SINCE"
    );
    for process in &report.processes {
        let state = match process.state {
            ProcessState::Running => process.state.as_str().green(),
            ProcessState::Stopped if !process.planned => process.state.as_str().dimmed(),
            ProcessState::Stopped => process.state.as_str().red(),
            ProcessState::Stale | ProcessState::Corrupt => process.state.as_str().yellow(),
        };
        let pid = process.pid.map_or_else(|| "-".to_string(), |pid| pid.to_string());
        let since = process
            .since
            .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string());
        let marker = if process.planned { "" } else { " (not planned)" };
        let _ = writeln!(
            out,
            "{:<20} {:<9} {:<8} {:<25} {}{marker}",
            process.name,
            state,
            pid,
            since,
            process.log.display()
        );
    }
    let planned = report.processes.iter().filter(|p| p.planned).count();
    let summary = format!("{}/{planned} planned processes running", report.running());
    let summary = if report.all_planned_running {
        summary.green()
    } else {
        summary.red()
    };
    let _ = writeln!(out, "\n{summary}");
    out
}

fn status_icon(status: CheckStatus) -> colored::ColoredString {
    match status {
        CheckStatus::Ok => "OK".green(),
        CheckStatus::Warning => "WARN".yellow(),
        CheckStatus::Skip => "SKIP".dimmed(),
        CheckStatus::Error => "FAIL".red(),
    }
}

#[must_use]
pub fn format_health(report: &HealthReport) -> String {
    let mut out = String::new();
    let arch = report.architecture;
    let _ = writeln!(
        out,
        "Health check ({} server, GPU {}):\n",
        arch.server,
        if arch.gpu_enabled { "enabled" } else { "disabled" }
    );
    for check in &report.checks {
        let _ = writeln!(
            out,
            "  [{:<4}] {:<12} {} ({} ms)",
            status_icon(check.result.status),
            check.name,
            check.result.message,
            check.duration_ms
        );
    }
    let s = &report.summary;
    let overall = match report.overall_status {
        OverallStatus::Healthy => report.overall_status.as_str().green().bold(),
        OverallStatus::MostlyHealthy | OverallStatus::Warning => {
            report.overall_status.as_str().yellow().bold()
        }
        OverallStatus::Critical => report.overall_status.as_str().red().bold(),
    };
    let _ = writeln!(
        out,
        "\nOverall: {overall} ({} passed, {} warnings, {} failed, {} skipped of {})",
        s.passed, s.warnings, s.failed, s.skipped, s.total
    );
    out
}

#[must_use]
pub fn format_issues(issues: &[Issue]) -> String {
    if issues.is_empty() {
        return format!("{}\n", "Environment OK".green());
    }
    let mut out = String::new();
    for issue in issues {
        let label = match issue.severity {
            Severity::Error => "error".red(),
            Severity::Warning => "warning".yellow(),
        };
        let _ = writeln!(out, "  {label}: {}", issue.message);
    }
    out
}

#[must_use]
pub fn format_plan(plan: &Plan) -> String {
    let mut out = String::new();
    let arch = plan.architecture;
    let _ = writeln!(
        out,
        "{} server, GPU {}\n",
        arch.server.as_str().cyan(),
        if arch.gpu_enabled { "enabled" } else { "disabled" }
    );
    for worker in &plan.workers {
        let _ = writeln!(
            out,
            "  {:<16} queues={} concurrency={} pool={} prefetch={} max-tasks={} time-limit={}s soft={}s",
            worker.name.cyan(),
            worker.queues.join(","),
            worker.concurrency,
            worker.pool.as_str(),
            worker.prefetch_multiplier,
            worker.max_tasks_per_child,
            worker.time_limit_secs,
            worker.soft_time_limit_secs
        );
    }
    let _ = writeln!(
        out,
        "\n  beat: {}",
        if plan.runs_beat { "yes" } else { "no" }
    );
    let _ = writeln!(out, "  total concurrency: {}", plan.total_concurrency());
    if !plan.services.is_empty() {
        let _ = writeln!(out, "  services: {}", plan.services.join(", "));
    }
    out
}

#[must_use]
pub fn format_routes(table: &RoutingTable) -> String {
    let mut out = String::new();
    for route in table.routes() {
        let _ = writeln!(out, "  {:<32} -> {}", route.pattern, route.queue.cyan());
    }
    out
}

#[must_use]
pub fn format_tick(report: &TickReport) -> String {
    let decision = serde_json::to_string(&report.decision).unwrap_or_default();
    format!(
        "pending={} instance={:?} decision={decision} acted={}\n",
        report.pending, report.instance, report.acted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvSet;
    use crate::supervisor::{ProcessStatus, StatusReport};
    use crate::topology::{Architecture, ServerType};
    use chrono::Utc;
    use std::path::PathBuf;

    fn plain() {
        colored::control::set_override(false);
    }

    #[test]
    fn start_report_dry_run_lists_plans() {
        plain();
        let mut steps = Steps::default();
        steps.plan("launch beat");
        let report = StartReport {
            steps,
            success: true,
            dry_run: true,
            launched: Vec::new(),
            skipped: vec!["default".into()],
            planned: Vec::new(),
        };
        let output = format_start_report(&report);
        assert!(output.contains("cfh dry-run report"));
        assert!(output.contains("[PLAN] launch beat"));
        assert!(output.contains("already running: default"));
    }

    #[test]
    fn stop_report_failure_shows_error() {
        plain();
        let mut steps = Steps::default();
        steps.fail("stop default (pid 42)", "permission denied");
        let report = StopReport {
            steps,
            success: false,
            stopped: Vec::new(),
            swept: Vec::new(),
            removed_pid_files: Vec::new(),
        };
        let output = format_stop_report(&report);
        assert!(output.contains("[FAIL] stop default (pid 42)"));
        assert!(output.contains("error: permission denied"));
    }

    #[test]
    fn status_marks_unplanned_processes() {
        plain();
        let report = StatusReport {
            generated_at: Utc::now(),
            processes: vec![
                ProcessStatus {
                    name: "default".into(),
                    planned: true,
                    state: ProcessState::Running,
                    pid: Some(1234),
                    since: None,
                    log: PathBuf::from("logs/default.log"),
                },
                ProcessStatus {
                    name: "flower".into(),
                    planned: false,
                    state: ProcessState::Stopped,
                    pid: None,
                    since: None,
                    log: PathBuf::from("logs/flower.log"),
                },
            ],
            all_planned_running: true,
        };
        let output = format_status(&report);
        assert!(output.contains("1234"));
        assert!(output.contains("(not planned)"));
        assert!(output.contains("1/1 planned processes running"));
    }

    #[test]
    fn issues_render_severity() {
        plain();
        assert!(format_issues(&[]).contains("Environment OK"));
        let env = EnvSet::from_pairs([("SERVER_TYPE", "cpu")]);
        let issues = crate::env::settings::validate(&env, ServerType::Cpu);
        let output = format_issues(&issues);
        assert!(output.contains("error:"));
    }

    #[test]
    fn plan_and_routes_render() {
        plain();
        let arch = Architecture::new(ServerType::Gpu, true);
        let output = format_plan(&Plan::for_architecture(arch));
        assert!(output.contains("gpu server, GPU enabled"));
        assert!(output.contains("pool=solo"));
        let routes = format_routes(&RoutingTable::for_architecture(arch));
        assert!(routes.contains("tasks.embedding_tasks.*"));
        assert!(routes.contains("embeddings_gpu"));
    }
}
