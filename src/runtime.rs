//! Runtime paths under the root configuration directory.
use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

use crate::{constants::*, error::ConfigError};

/// Where state, logs and manifests live for one invocation.
///
/// Resolved once in `main` and handed to the lifecycle controller. Nothing in the
/// crate reads the environment for paths after this point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    root: PathBuf,
}

impl RuntimePaths {
    /// Uses `root` as the configuration directory.
    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves the root from `STACKCTL_HOME`, falling back to `~/.stackctl`.
    pub fn discover() -> Result<Self, ConfigError> {
        if let Some(root) = env::var_os(ROOT_ENV_VAR).filter(|v| !v.is_empty()) {
            return Ok(Self::from_root(root));
        }

        home_dir()
            .map(|home| Self::from_root(home.join(DEFAULT_ROOT_DIR_NAME)))
            .ok_or(ConfigError::MissingRoot)
    }

    /// Root configuration directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persisted configuration file.
    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE_NAME)
    }

    /// PID files.
    pub fn run_dir(&self) -> PathBuf {
        self.root.join(RUN_DIR_NAME)
    }

    /// Native service logs.
    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR_NAME)
    }

    /// Directory holding both manifests.
    pub fn docker_dir(&self) -> PathBuf {
        self.root.join(DOCKER_DIR_NAME)
    }

    /// Engine/console manifest.
    pub fn main_manifest(&self) -> PathBuf {
        self.docker_dir().join(MAIN_MANIFEST_NAME)
    }

    /// Database manifest.
    pub fn database_manifest(&self) -> PathBuf {
        self.docker_dir().join(DATABASE_MANIFEST_NAME)
    }

    /// PID file for a native service.
    pub fn pid_file(&self, service: &str) -> PathBuf {
        self.run_dir().join(format!("{service}.pid"))
    }

    /// Log file for a native service.
    pub fn log_file(&self, service: &str) -> PathBuf {
        self.log_dir().join(format!("{service}.log"))
    }

    /// Installed binary for a native service.
    pub fn service_binary(&self, service: &str) -> PathBuf {
        let name = if cfg!(windows) {
            format!("{service}.exe")
        } else {
            service.to_string()
        };
        self.root.join("bin").join(name)
    }

    /// Working directory of a native service (also bind-mounted for the engine).
    pub fn service_dir(&self, service: &str) -> PathBuf {
        self.root.join(service)
    }

    /// Creates the run, log and manifest directories.
    pub fn ensure_layout(&self) -> io::Result<()> {
        fs::create_dir_all(self.run_dir())?;
        fs::create_dir_all(self.log_dir())?;
        fs::create_dir_all(self.docker_dir())?;
        Ok(())
    }
}

fn home_dir() -> Option<PathBuf> {
    let key = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
