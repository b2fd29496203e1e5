//! Error handling for stackctl.
use std::path::PathBuf;

use thiserror::Error;

/// Defines all possible errors surfaced by the lifecycle supervisor.
#[derive(Debug, Error)]
pub enum StackError {
    /// Error reading or parsing the persisted configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Error spawning a native service process.
    #[error("Failed to start service '{service}': {source}")]
    ServiceStartError {
        /// The service name that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error stopping a native service process.
    #[error("Failed to stop service '{service}': {source}")]
    ServiceStopError {
        /// The service name that failed to stop.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The spawned process exited during the settle window.
    #[error(
        "Service '{service}' exited immediately ({status}); see {}",
        log_path.display()
    )]
    ServiceExitedEarly {
        /// The service name.
        service: String,
        /// Human readable exit status.
        status: String,
        /// Log file holding the child's output.
        log_path: PathBuf,
    },

    /// The forceful kill did not take effect.
    #[error("Service '{service}' (PID {pid}) is still alive after SIGKILL")]
    ServiceStillAlive {
        /// The service name.
        service: String,
        /// The PID that refused to die.
        pid: u32,
    },

    /// A foreground run was requested while a detached instance is alive.
    #[error("Service '{service}' is already running in the background (PID {pid})")]
    AlreadyRunning {
        /// The service name.
        service: String,
        /// PID of the detached instance.
        pid: u32,
    },

    /// The requested service is not managed by this supervisor.
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// Foreground mode was requested while the container backend is active.
    #[error("'{operation}' is only available in manual mode")]
    NativeOnly {
        /// Operation that was refused.
        operation: String,
    },

    /// No database is configured for the role.
    #[error("No database is configured for role '{role}'")]
    DatabaseNotConfigured {
        /// The database role.
        role: String,
    },

    /// Error for PID file.
    #[error("PID file error: {0}")]
    PidFile(#[from] PidFileError),

    /// Error for orchestration manifests.
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Error from the container engine.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// Error reading a log file.
    #[error("Failed to read log file {}: {source}", path.display())]
    LogRead {
        /// Log file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Error type for the persisted configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading the configuration file.
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        /// Config file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error parsing YAML configuration.
    #[error("Invalid YAML in {}: {source}", path.display())]
    Parse {
        /// Config file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: serde_yaml::Error,
    },

    /// Error writing the configuration file.
    #[error("Failed to write config file {}: {source}", path.display())]
    Write {
        /// Config file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error serialising the configuration.
    #[error("Failed to serialise config: {0}")]
    Serialize(#[source] serde_yaml::Error),

    /// Neither an explicit root nor a home directory could be found.
    #[error("Cannot determine the root directory; set STACKCTL_HOME or pass --root")]
    MissingRoot,
}

/// Error type for PID file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error reading a PID file.
    #[error("Failed to read PID file {}: {source}", path.display())]
    Read {
        /// PID file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error writing a PID file.
    #[error("Failed to write PID file {}: {source}", path.display())]
    Write {
        /// PID file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error removing a PID file.
    #[error("Failed to remove PID file {}: {source}", path.display())]
    Remove {
        /// PID file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Error type for orchestration manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Error reading a manifest.
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        /// Manifest path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The manifest exists but is not a valid document.
    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        /// Manifest path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: serde_yaml::Error,
    },

    /// Error writing or removing a manifest.
    #[error("Failed to write {}: {source}", path.display())]
    Write {
        /// Manifest path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error serialising a manifest.
    #[error("Failed to serialise manifest: {0}")]
    Serialize(#[source] serde_yaml::Error),

    /// Error acquiring the advisory lock next to a manifest.
    #[error("Failed to lock {}: {source}", path.display())]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while driving the external container tool.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container tool binary is not installed.
    #[error(
        "'{tool}' was not found on PATH. Install Docker (https://docs.docker.com/get-docker/) \
         or set `container_tool` in config.yaml, or switch to manual mode."
    )]
    EngineMissing {
        /// Tool binary name.
        tool: String,
    },

    /// The tool is installed but its daemon does not answer.
    #[error(
        "The {tool} daemon is not running ({detail}). Start Docker Desktop or run \
         `sudo systemctl start docker`, then retry."
    )]
    DaemonUnavailable {
        /// Tool binary name.
        tool: String,
        /// First line of the tool's stderr.
        detail: String,
    },

    /// Neither compose form is available.
    #[error(
        "Neither '{tool} compose' (v2) nor '{tool}-compose' (v1) is available. \
         Install the Compose plugin (https://docs.docker.com/compose/install/)."
    )]
    ComposeMissing {
        /// Tool binary name.
        tool: String,
    },

    /// A command ran and returned a non-zero exit status.
    #[error("`{command}` failed with {}: {stderr}", exit_label(*exit_code))]
    CommandFailed {
        /// Rendered command line.
        command: String,
        /// Process exit code when available.
        exit_code: Option<i32>,
        /// Trimmed stderr.
        stderr: String,
    },

    /// A command could not be executed at all.
    #[error("Failed to execute `{command}`: {source}")]
    Exec {
        /// Rendered command line.
        command: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

/// Errors raised by the version-lookup collaborator.
#[derive(Debug, Error)]
pub enum VersionLookupError {
    /// Transport failure.
    #[error("release index request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The index answered with an unexpected body.
    #[error("release index returned an invalid body: {0}")]
    Body(#[from] serde_json::Error),

    /// The index answered with an error status.
    #[error("release index returned HTTP {0}")]
    Status(u16),
}
