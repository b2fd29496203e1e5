//! stackctl is an operator CLI that supervises the engine and console services. In
//! manual mode it spawns them directly and tracks them with PID files; in docker mode
//! it renders compose manifests and drives the container tool. It also provisions
//! auxiliary database containers and diagnoses port conflicts.

/// Crash-safe file replacement.
pub mod atomic;

/// CLI interface.
pub mod cli;

/// Compose manifest documents and their lock.
pub mod compose;

/// Persisted configuration.
pub mod config;

/// Shared constants.
pub mod constants;

/// Container backend driving the external tool.
pub mod container;

/// Lifecycle controller used by every command.
pub mod controller;

/// Native process management.
pub mod daemon;

/// Database container descriptions.
pub mod database;

/// Error handling.
pub mod error;

/// Attached "run and watch" mode.
pub mod foreground;

/// Logs management.
pub mod logs;

/// Port availability and conflict resolution.
pub mod ports;

/// Process liveness and signalling.
pub mod probe;

/// Terminal progress ticker.
pub mod progress;

/// Root directory layout.
pub mod runtime;

/// Status reports.
pub mod status;

/// Release index lookups for floating image tags.
pub mod versions;
