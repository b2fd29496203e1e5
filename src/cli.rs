//! Command-line interface for stackctl.
use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::{
    config::ServiceName,
    constants::DEFAULT_LOG_LINES,
    database::{DatabaseEngine, DatabaseRole},
};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for stackctl.
#[derive(Parser, Debug)]
#[command(name = "stackctl", version)]
#[command(
    about = "Start, stop and inspect the engine and console, natively or in containers",
    long_about = None
)]
pub struct Cli {
    /// Root directory holding config, PID files, logs and manifests.
    #[arg(long, value_name = "DIR", global = true)]
    pub root: Option<PathBuf>,

    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start one service, or engine then console.
    Start {
        /// Service to start (defaults to all).
        service: Option<ServiceName>,
    },

    /// Stop one service, or console then engine.
    Stop {
        /// Service to stop (defaults to all).
        service: Option<ServiceName>,
    },

    /// Stop everything; in docker mode also remove the core containers.
    Down,

    /// Stop then start one service, or all of them.
    Restart {
        /// Service to restart (defaults to all).
        service: Option<ServiceName>,
    },

    /// Show whether services and databases are running.
    Status {
        /// Limit the report to one service.
        service: Option<ServiceName>,

        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,

        /// Disable ANSI colors in output.
        #[arg(long = "no-color")]
        no_color: bool,
    },

    /// Show logs for a service.
    Logs {
        /// The service whose logs should be displayed.
        service: ServiceName,

        /// Number of lines to show.
        #[arg(short = 'n', long, default_value_t = DEFAULT_LOG_LINES)]
        lines: usize,

        /// Keep printing new output.
        #[arg(short, long)]
        follow: bool,
    },

    /// Run a service attached to this terminal (manual mode). Press q or Ctrl-T to stop.
    Run {
        /// Service to run.
        service: ServiceName,
    },

    /// Manage auxiliary database containers.
    #[command(subcommand)]
    Db(DbCommands),

    /// Inspect or free TCP ports.
    #[command(subcommand)]
    Port(PortCommands),
}

/// Database subcommands.
#[derive(Subcommand, Debug)]
pub enum DbCommands {
    /// Create or replace the database for a role.
    Up(DbUpArgs),

    /// Remove the database for a role. Its data volume is kept.
    Down {
        /// Database role.
        #[arg(long)]
        role: DatabaseRole,
    },

    /// Show configured databases.
    Status {
        /// Emit machine-readable JSON output instead of a table.
        #[arg(long)]
        json: bool,
    },
}

/// Arguments for `db up`.
#[derive(Args, Debug)]
pub struct DbUpArgs {
    /// Database role: system or project.
    #[arg(long)]
    pub role: DatabaseRole,

    /// Database engine.
    #[arg(long)]
    pub engine: DatabaseEngine,

    /// Database user.
    #[arg(long)]
    pub user: Option<String>,

    /// Database password.
    #[arg(long)]
    pub password: Option<String>,

    /// Database name.
    #[arg(long)]
    pub database: Option<String>,
}

/// Port subcommands.
#[derive(Subcommand, Debug)]
pub enum PortCommands {
    /// Report whether a port can be bound.
    Check {
        /// TCP port.
        port: u16,
    },

    /// Terminate whatever holds a port (manual mode).
    Free {
        /// TCP port.
        port: u16,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
