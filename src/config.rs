//! Persisted configuration for stackctl.
use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use tracing::{debug, warn};

use crate::{
    atomic::write_atomic,
    constants::*,
    database::{DatabaseInstanceConfig, DatabaseRole},
    error::ConfigError,
};

/// Which backend runs the engine and console.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunMode {
    /// Containers described by a manifest.
    #[default]
    Docker,
    /// Directly spawned processes tracked by PID files.
    Manual,
}

/// The two managed services.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    AsRefStr,
    Display,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServiceName {
    Engine,
    Console,
}

impl ServiceName {
    /// Start order: the console proxies to the engine.
    pub const START_ORDER: [ServiceName; 2] = [ServiceName::Engine, ServiceName::Console];

    /// Stop order: reverse of start.
    pub const STOP_ORDER: [ServiceName; 2] = [ServiceName::Console, ServiceName::Engine];

    /// Deterministic container name.
    pub fn container_name(&self) -> String {
        format!("{CONTAINER_PREFIX}-{self}")
    }
}

/// Image tags for the core services. Unset means `latest`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageVersions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<String>,
}

impl ImageVersions {
    /// Tag for `service`, defaulting to `latest` when unset or blank.
    pub fn tag_for(&self, service: ServiceName) -> String {
        let raw = match service {
            ServiceName::Engine => self.engine.as_deref(),
            ServiceName::Console => self.console.as_deref(),
        };
        raw.map(str::trim)
            .filter(|tag| !tag.is_empty())
            .unwrap_or(DEFAULT_IMAGE_TAG)
            .to_string()
    }

    /// True when `service` has no explicit tag.
    pub fn is_floating(&self, service: ServiceName) -> bool {
        self.tag_for(service) == DEFAULT_IMAGE_TAG
    }

    /// Sets the tag for `service`.
    pub fn set(&mut self, service: ServiceName, tag: String) {
        match service {
            ServiceName::Engine => self.engine = Some(tag),
            ServiceName::Console => self.console = Some(tag),
        }
    }
}

/// Image repositories for the core services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRepositories {
    #[serde(default = "default_engine_image")]
    pub engine: String,
    #[serde(default = "default_console_image")]
    pub console: String,
}

impl Default for ImageRepositories {
    fn default() -> Self {
        Self {
            engine: default_engine_image(),
            console: default_console_image(),
        }
    }
}

impl ImageRepositories {
    /// Repository for `service`.
    pub fn repository(&self, service: ServiceName) -> &str {
        match service {
            ServiceName::Engine => &self.engine,
            ServiceName::Console => &self.console,
        }
    }
}

fn default_engine_image() -> String {
    DEFAULT_ENGINE_IMAGE.to_string()
}

fn default_console_image() -> String {
    DEFAULT_CONSOLE_IMAGE.to_string()
}

/// Fixed host ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default = "default_engine_port")]
    pub engine: u16,
    #[serde(default = "default_console_port")]
    pub console: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            engine: DEFAULT_ENGINE_PORT,
            console: DEFAULT_CONSOLE_PORT,
        }
    }
}

impl PortConfig {
    /// Host port for `service`.
    pub fn port_for(&self, service: ServiceName) -> u16 {
        match service {
            ServiceName::Engine => self.engine,
            ServiceName::Console => self.console,
        }
    }
}

fn default_engine_port() -> u16 {
    DEFAULT_ENGINE_PORT
}

fn default_console_port() -> u16 {
    DEFAULT_CONSOLE_PORT
}

/// Represents environment variables for a native service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Optional path to an environment file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Key-value pairs of environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
}

impl EnvConfig {
    /// Resolves the full path to the env file based on a base directory.
    pub fn path(&self, base: &Path) -> Option<PathBuf> {
        self.file.as_ref().map(|f| {
            let path = Path::new(f);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        })
    }

    /// Builds the environment map, giving inline `vars` precedence over entries
    /// loaded from `file`.
    pub fn resolve(&self, base: &Path, service_name: &str) -> BTreeMap<String, String> {
        let mut resolved = BTreeMap::new();

        if let Some(file_path) = self.path(base) {
            match fs::read_to_string(&file_path) {
                Ok(content) => {
                    for (key, value) in parse_env_lines(&content, service_name) {
                        resolved.entry(key).or_insert(value);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(
                        "Env file {} for '{service_name}' does not exist",
                        file_path.display()
                    );
                }
                Err(err) => {
                    warn!("Failed to read env file for '{service_name}': {err}");
                }
            }
        }

        for (key, value) in &self.vars {
            resolved.insert(key.clone(), value.clone());
        }

        resolved
    }
}

fn parse_env_lines(content: &str, service_name: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for raw_line in content.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((key, value)) = line.split_once('=') {
            let mut value = value.trim();
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }
            pairs.push((key.trim().to_string(), value.to_string()));
        } else {
            warn!("Ignoring malformed line in env file for '{service_name}': {line}");
        }
    }
    pairs
}

/// Overrides for how a native service is launched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCommand {
    /// Executable path; defaults to `<root>/bin/<service>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Working directory; defaults to `<root>/<service>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<EnvConfig>,
}

/// Native-mode settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<NativeCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console: Option<NativeCommand>,
    /// Grace window before SIGKILL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_timeout_secs: Option<u64>,
}

impl NativeConfig {
    /// Launch override for `service`.
    pub fn command_for(&self, service: ServiceName) -> Option<&NativeCommand> {
        match service {
            ServiceName::Engine => self.engine.as_ref(),
            ServiceName::Console => self.console.as_ref(),
        }
    }

    /// Grace window between graceful and forceful termination.
    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_STOP_TIMEOUT)
    }
}

/// Databases recorded per role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRoles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<DatabaseInstanceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<DatabaseInstanceConfig>,
}

impl DatabaseRoles {
    /// Configured database for `role`.
    pub fn get(&self, role: DatabaseRole) -> Option<&DatabaseInstanceConfig> {
        match role {
            DatabaseRole::System => self.system.as_ref(),
            DatabaseRole::Project => self.project.as_ref(),
        }
    }

    /// Replaces the database for `role`.
    pub fn set(&mut self, role: DatabaseRole, value: Option<DatabaseInstanceConfig>) {
        match role {
            DatabaseRole::System => self.system = value,
            DatabaseRole::Project => self.project = value,
        }
    }

    /// Makes each entry's `role` agree with the slot it is stored under.
    fn normalize_roles(&mut self) {
        for (slot, entry) in [
            (DatabaseRole::System, self.system.as_mut()),
            (DatabaseRole::Project, self.project.as_mut()),
        ] {
            if let Some(db) = entry
                && db.role != slot
            {
                warn!(
                    "Database configured under '{slot}' declares role '{}'; using '{slot}'",
                    db.role
                );
                db.role = slot;
            }
        }
    }
}

/// Represents the structure of `config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RunMode>,
    #[serde(default)]
    pub versions: ImageVersions,
    #[serde(default)]
    pub images: ImageRepositories,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_index_url: Option<String>,
    #[serde(default)]
    pub ports: PortConfig,
    #[serde(default)]
    pub native: NativeConfig,
    #[serde(default)]
    pub databases: DatabaseRoles,
}

impl StackConfig {
    /// Loads the configuration; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("No config at {}; using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let mut config: Self =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.databases.normalize_roles();
        Ok(config)
    }

    /// Writes the configuration atomically.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self).map_err(ConfigError::Serialize)?;
        write_atomic(path, yaml.as_bytes()).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Backend selected for this invocation; containers when unset.
    pub fn run_mode(&self) -> RunMode {
        self.mode.unwrap_or_default()
    }

    /// Container tool binary.
    pub fn container_tool(&self) -> &str {
        self.container_tool
            .as_deref()
            .filter(|tool| !tool.trim().is_empty())
            .unwrap_or(DEFAULT_CONTAINER_TOOL)
    }
}
