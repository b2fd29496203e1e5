//! Auxiliary database containers: deterministic names, ports and service specs.
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use crate::{
    compose::ServiceSpec,
    constants::{CONTAINER_PREFIX, PROJECT_ROLE_PORT_OFFSET, RESTART_POLICY},
};

/// Database engines that can be provisioned as containers.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    AsRefStr,
    Display,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DatabaseEngine {
    Postgres,
    Mysql,
    Mariadb,
    Sqlserver,
    Mongodb,
    Redis,
}

impl DatabaseEngine {
    /// Port the engine listens on inside its container, also the host port for the
    /// "system" role.
    pub const fn base_port(&self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::Mysql | Self::Mariadb => 3306,
            Self::Sqlserver => 1433,
            Self::Mongodb => 27017,
            Self::Redis => 6379,
        }
    }

    /// Image reference used for the container.
    pub const fn image(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres:16",
            Self::Mysql => "mysql:8.4",
            Self::Mariadb => "mariadb:11",
            Self::Sqlserver => "mcr.microsoft.com/mssql/server:2022-latest",
            Self::Mongodb => "mongo:7",
            Self::Redis => "redis:7",
        }
    }

    /// Persistent data directory inside the container.
    pub const fn data_path(&self) -> &'static str {
        match self {
            Self::Postgres => "/var/lib/postgresql/data",
            Self::Mysql | Self::Mariadb => "/var/lib/mysql",
            Self::Sqlserver => "/var/opt/mssql",
            Self::Mongodb => "/data/db",
            Self::Redis => "/data",
        }
    }
}

/// Which database a container backs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    AsRefStr,
    Display,
    EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DatabaseRole {
    /// The platform's own metadata database.
    System,
    /// A per-project application database.
    Project,
}

/// A database the operator asked for, as persisted in `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInstanceConfig {
    pub engine: DatabaseEngine,
    pub role: DatabaseRole,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_database")]
    pub database: String,
}

fn default_user() -> String {
    "stackctl".to_string()
}

fn default_database() -> String {
    "stackctl".to_string()
}

impl DatabaseInstanceConfig {
    /// Builds a config with default credentials.
    pub fn new(engine: DatabaseEngine, role: DatabaseRole) -> Self {
        Self {
            engine,
            role,
            user: default_user(),
            password: String::new(),
            database: default_database(),
        }
    }

    /// `<prefix>-<role>-<engine>`.
    pub fn container_name(&self) -> String {
        container_name(self.role, self.engine)
    }

    /// Base port for "system", base + 1000 for "project".
    pub fn host_port(&self) -> u16 {
        host_port(self.role, self.engine)
    }

    /// Named volume holding the database files.
    pub fn volume_name(&self) -> String {
        format!("{}-data", self.container_name())
    }

    /// Container spec ready to be upserted into the database manifest.
    pub fn service_spec(&self) -> ServiceSpec {
        let engine = self.engine;
        let mut spec = ServiceSpec {
            image: engine.image().to_string(),
            container_name: self.container_name(),
            environment: self.environment(),
            ports: vec![format!("{}:{}", self.host_port(), engine.base_port())],
            volumes: vec![format!("{}:{}", self.volume_name(), engine.data_path())],
            restart: RESTART_POLICY.to_string(),
            command: None,
        };

        if engine == DatabaseEngine::Redis && !self.password.is_empty() {
            spec.command = Some(format!("redis-server --requirepass {}", self.password));
        }

        spec
    }

    fn environment(&self) -> Vec<String> {
        let user = &self.user;
        let password = &self.password;
        let database = &self.database;
        match self.engine {
            DatabaseEngine::Postgres => vec![
                format!("POSTGRES_USER={user}"),
                format!("POSTGRES_PASSWORD={password}"),
                format!("POSTGRES_DB={database}"),
            ],
            DatabaseEngine::Mysql => {
                let mut env = vec![
                    format!("MYSQL_ROOT_PASSWORD={password}"),
                    format!("MYSQL_DATABASE={database}"),
                ];
                if user != "root" {
                    env.push(format!("MYSQL_USER={user}"));
                    env.push(format!("MYSQL_PASSWORD={password}"));
                }
                env
            }
            DatabaseEngine::Mariadb => {
                let mut env = vec![
                    format!("MARIADB_ROOT_PASSWORD={password}"),
                    format!("MARIADB_DATABASE={database}"),
                ];
                if user != "root" {
                    env.push(format!("MARIADB_USER={user}"));
                    env.push(format!("MARIADB_PASSWORD={password}"));
                }
                env
            }
            DatabaseEngine::Sqlserver => vec![
                "ACCEPT_EULA=Y".to_string(),
                format!("MSSQL_SA_PASSWORD={password}"),
            ],
            DatabaseEngine::Mongodb => vec![
                format!("MONGO_INITDB_ROOT_USERNAME={user}"),
                format!("MONGO_INITDB_ROOT_PASSWORD={password}"),
                format!("MONGO_INITDB_DATABASE={database}"),
            ],
            DatabaseEngine::Redis => Vec::new(),
        }
    }
}

/// Deterministic container name for a role/engine pair.
pub fn container_name(role: DatabaseRole, engine: DatabaseEngine) -> String {
    format!("{CONTAINER_PREFIX}-{role}-{engine}")
}

/// Deterministic host port for a role/engine pair.
pub fn host_port(role: DatabaseRole, engine: DatabaseEngine) -> u16 {
    match role {
        DatabaseRole::System => engine.base_port(),
        DatabaseRole::Project => engine.base_port() + PROJECT_ROLE_PORT_OFFSET,
    }
}
