//! Constants and configuration values for stackctl.
//!
//! This module centralizes all magic numbers, strings, and fixed values used by the
//! supervisors so that naming and port rules stay identical across invocations.

use std::time::Duration;

// ============================================================================
// File System Constants
// ============================================================================

/// Environment variable that overrides the root configuration directory.
pub const ROOT_ENV_VAR: &str = "STACKCTL_HOME";

/// Directory created under the user's home when no override is given.
pub const DEFAULT_ROOT_DIR_NAME: &str = ".stackctl";

/// Name of the persisted configuration file inside the root directory.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Directory holding one PID file per native service.
pub const RUN_DIR_NAME: &str = "run";

/// Directory holding one append-only log file per native service.
pub const LOG_DIR_NAME: &str = "logs";

/// Directory holding the orchestration manifests.
pub const DOCKER_DIR_NAME: &str = "docker";

/// Main manifest (engine + console).
pub const MAIN_MANIFEST_NAME: &str = "compose.yaml";

/// Auxiliary manifest (database containers only).
pub const DATABASE_MANIFEST_NAME: &str = "databases.yaml";

/// Suffix of the advisory lock file placed next to a manifest.
pub const MANIFEST_LOCK_SUFFIX: &str = ".lock";

// ============================================================================
// Naming
// ============================================================================

/// Prefix shared by every container this tool creates.
pub const CONTAINER_PREFIX: &str = "stackctl";

/// Compose project name used for the main manifest.
pub const MAIN_PROJECT_NAME: &str = "stackctl";

/// Compose project name used for the database manifest.
pub const DATABASE_PROJECT_NAME: &str = "stackctl-db";

/// Default container tool binary.
pub const DEFAULT_CONTAINER_TOOL: &str = "docker";

/// Tag used when no version is pinned.
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// Default image repository for the engine.
pub const DEFAULT_ENGINE_IMAGE: &str = "stackctl/engine";

/// Default image repository for the console.
pub const DEFAULT_CONSOLE_IMAGE: &str = "stackctl/console";

/// Restart policy written for every container.
pub const RESTART_POLICY: &str = "unless-stopped";

// ============================================================================
// Ports
// ============================================================================

/// Host port the engine listens on.
pub const DEFAULT_ENGINE_PORT: u16 = 8080;

/// Host port the console listens on.
pub const DEFAULT_CONSOLE_PORT: u16 = 8000;

/// Port the console container serves on internally.
pub const CONSOLE_CONTAINER_PORT: u16 = 80;

/// Offset added to an engine's base port for the "project" database role.
pub const PROJECT_ROLE_PORT_OFFSET: u16 = 1000;

// ============================================================================
// Process Management Timing
// ============================================================================

/// Delay after spawning before a native start returns.
pub const START_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Grace window between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between liveness checks while waiting for a process to exit.
pub const PROCESS_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for the kernel to reap a SIGKILLed process.
pub const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

/// Tolerance when comparing a process start time with the PID file mtime.
pub const PID_REUSE_TOLERANCE: Duration = Duration::from_secs(2);

/// Wait between graceful and forceful termination of a port holder.
pub const PORT_RELEASE_WAIT: Duration = Duration::from_secs(1);

// ============================================================================
// Logging and Output Constants
// ============================================================================

/// Default number of log lines shown by `logs` and `status`.
pub const DEFAULT_LOG_LINES: usize = 50;

/// Initial window read from the end of a log file when tailing.
pub const LOG_TAIL_WINDOW: u64 = 64 * 1024;

/// Poll interval while following a native log file.
pub const LOG_FOLLOW_INTERVAL: Duration = Duration::from_millis(250);

/// Refresh interval of the pull progress ticker.
pub const PROGRESS_TICK: Duration = Duration::from_millis(120);

// ============================================================================
// Network Timing
// ============================================================================

/// Request timeout for the release index.
pub const RELEASE_INDEX_TIMEOUT: Duration = Duration::from_secs(30);
