//! Status reports for the managed services and database containers.
use std::{fmt::Write as _, path::PathBuf};

use serde::Serialize;
use sysinfo::{ProcessesToUpdate, System};

use crate::{
    config::{RunMode, ServiceName},
    database::{DatabaseEngine, DatabaseRole},
};

const GREEN_BOLD: &str = "\x1b[1;32m"; // Bright Green
const RED_BOLD: &str = "\x1b[1;31m"; // Bright Red
const MAGENTA_BOLD: &str = "\x1b[1;35m"; // Magenta
const RESET: &str = "\x1b[0m"; // Reset color

/// Observed state of one core service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub name: ServiceName,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Observed state of one configured database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseStatus {
    pub role: DatabaseRole,
    pub engine: DatabaseEngine,
    pub container: String,
    pub port: u16,
    pub running: bool,
}

/// Everything `status` prints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub mode: RunMode,
    pub services: Vec<ServiceStatus>,
    pub databases: Vec<DatabaseStatus>,
}

/// Uptime in seconds and resident memory in MiB for a live PID.
pub fn process_metrics(pid: u32) -> (Option<u64>, Option<f64>) {
    let target = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    match system.process(target) {
        Some(process) => (
            Some(process.run_time()),
            Some(process.memory() as f64 / (1024.0 * 1024.0)),
        ),
        None => (None, None),
    }
}

/// Human readable elapsed time.
pub fn format_elapsed(total_seconds: u64) -> String {
    match total_seconds {
        0..=59 => format!("{total_seconds} secs"),
        60..=3_599 => format!("{} mins", total_seconds / 60),
        3_600..=86_399 => format!("{} hours", total_seconds / 3_600),
        86_400..=604_799 => format!("{} days", total_seconds / 86_400),
        _ => format!("{} weeks", total_seconds / 604_800),
    }
}

/// Renders the report as JSON.
pub fn render_json(report: &StatusReport) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(report)
}

/// Renders the report for a terminal. `color` enables ANSI styling.
pub fn render_text(report: &StatusReport, color: bool) -> String {
    let paint = |style: &'static str| if color { style } else { "" };
    let (green, red, magenta, reset) = (
        paint(GREEN_BOLD),
        paint(RED_BOLD),
        paint(MAGENTA_BOLD),
        paint(RESET),
    );

    let mut out = String::new();
    let _ = writeln!(out, "Mode: {}", report.mode);

    for service in &report.services {
        if !service.running {
            let _ = writeln!(out, "● {} - {red}Not running{reset}", service.name);
            if let Some(log) = &service.log_path {
                let _ = writeln!(out, "      Log: {}", log.display());
            }
            continue;
        }

        let _ = writeln!(out, "{green}● {} Running{reset}", service.name);
        match service.uptime_secs {
            Some(secs) => {
                let _ = writeln!(
                    out,
                    "   Active: {green}active (running){reset} for {}",
                    format_elapsed(secs)
                );
            }
            None => {
                let _ = writeln!(out, "   Active: {green}active (running){reset}");
            }
        }
        if let Some(pid) = service.pid {
            let _ = writeln!(out, " Main PID: {pid}");
        }
        let _ = writeln!(out, "     Port: {}", service.port);
        if let Some(memory) = service.memory_mb {
            let _ = writeln!(out, "   {magenta}Memory: {memory:.1}M{reset}");
        }
        if let Some(container) = &service.container {
            let _ = writeln!(out, "Container: {container}");
        }
        if let Some(image) = &service.image {
            let _ = writeln!(out, "    Image: {image}");
        }
        if let Some(log) = &service.log_path {
            let _ = writeln!(out, "      Log: {}", log.display());
        }
    }

    if !report.databases.is_empty() {
        let _ = writeln!(out, "Databases:");
        for db in &report.databases {
            let state = if db.running {
                format!("{green}Running{reset}")
            } else {
                format!("{red}Not running{reset}")
            };
            let _ = writeln!(
                out,
                "● {} {} - {state} ({}, port {})",
                db.role, db.engine, db.container, db.port
            );
        }
    }

    out
}
