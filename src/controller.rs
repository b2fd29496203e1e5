//! Lifecycle controller: the single entry point commands use.
//!
//! The run mode is read from the persisted configuration once, at construction, and
//! every operation of this invocation goes to that backend only.
use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, atomic::AtomicBool},
};

use tracing::{debug, info, warn};

use crate::{
    compose::ComposeDocument,
    config::{ImageVersions, RunMode, ServiceName, StackConfig},
    container::{CommandRunner, ContainerBackend, SystemRunner},
    daemon::{NativeSupervisor, ServiceDescriptor, StartOutcome, StopOutcome},
    database::{DatabaseInstanceConfig, DatabaseRole},
    error::StackError,
    foreground::{ForegroundExit, run_foreground},
    logs,
    ports::{ConflictResolution, PortProber, check_port},
    probe::system_probe,
    runtime::RuntimePaths,
    status::{DatabaseStatus, ServiceStatus, StatusReport, process_metrics},
    versions::{HttpReleaseIndex, ReleaseIndex},
};

/// Image mismatch between a container and its manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    pub service: ServiceName,
    pub running: String,
    pub wanted: String,
}

/// Builds the native launch recipes from the root layout and config overrides.
pub fn native_descriptors(paths: &RuntimePaths, config: &StackConfig) -> Vec<ServiceDescriptor> {
    ServiceName::START_ORDER
        .into_iter()
        .map(|service| {
            let name = service.as_ref();
            let overrides = config.native.command_for(service);
            let port = config.ports.port_for(service);

            let command = overrides
                .and_then(|o| o.command.as_deref())
                .map(|cmd| resolve_under(paths.root(), cmd))
                .unwrap_or_else(|| paths.service_binary(name));
            let working_dir = overrides
                .and_then(|o| o.working_dir.as_deref())
                .map(|dir| resolve_under(paths.root(), dir))
                .unwrap_or_else(|| paths.service_dir(name));

            let mut env = overrides
                .and_then(|o| o.env.as_ref())
                .map(|env| env.resolve(&working_dir, name))
                .unwrap_or_default();
            env.entry("PORT".to_string())
                .or_insert_with(|| port.to_string());
            if service == ServiceName::Console {
                env.entry("ENGINE_URL".to_string()).or_insert_with(|| {
                    format!(
                        "http://127.0.0.1:{}",
                        config.ports.port_for(ServiceName::Engine)
                    )
                });
            }

            ServiceDescriptor {
                name: name.to_string(),
                command,
                args: overrides.map(|o| o.args.clone()).unwrap_or_default(),
                working_dir,
                pid_file: paths.pid_file(name),
                log_file: paths.log_file(name),
                env,
                port: Some(port),
            }
        })
        .collect()
}

fn resolve_under(root: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() || !raw.contains(['/', '\\']) {
        // Bare names are left for PATH lookup.
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Facade over the native supervisor and the container backend.
pub struct LifecycleController {
    paths: RuntimePaths,
    config: StackConfig,
    mode: RunMode,
    native: NativeSupervisor,
    containers: ContainerBackend,
    ports: PortProber,
    release_index: Option<Box<dyn ReleaseIndex>>,
}

impl LifecycleController {
    /// Loads `config.yaml` under `paths` and wires the real collaborators.
    pub fn load(paths: RuntimePaths) -> Result<Self, StackError> {
        let config = StackConfig::load(&paths.config_file())?;
        Ok(Self::new(paths, config))
    }

    pub fn new(paths: RuntimePaths, config: StackConfig) -> Self {
        let release_index = config
            .release_index_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .and_then(|url| match HttpReleaseIndex::new(url) {
                Ok(index) => Some(Box::new(index) as Box<dyn ReleaseIndex>),
                Err(err) => {
                    warn!("Release index disabled: {err}");
                    None
                }
            });
        Self::with_parts(paths, config, Arc::new(SystemRunner), release_index)
    }

    /// Builds a controller around the given command runner and release index.
    pub fn with_parts(
        paths: RuntimePaths,
        config: StackConfig,
        runner: Arc<dyn CommandRunner>,
        release_index: Option<Box<dyn ReleaseIndex>>,
    ) -> Self {
        let mode = config.run_mode();
        debug!("Run mode: {mode}");
        let native = NativeSupervisor::new(
            native_descriptors(&paths, &config),
            system_probe(),
            config.native.stop_timeout(),
        );
        let containers = ContainerBackend::new(paths.clone(), &config, Arc::clone(&runner));
        let ports = PortProber::new(runner, system_probe());

        Self {
            paths,
            config,
            mode,
            native,
            containers,
            ports,
            release_index,
        }
    }

    /// Overrides the native start settle delay.
    pub fn with_settle_delay(mut self, delay: std::time::Duration) -> Self {
        self.native = self.native.with_settle_delay(delay);
        self
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn paths(&self) -> &RuntimePaths {
        &self.paths
    }

    fn save_config(&self) -> Result<(), StackError> {
        self.config.save(&self.paths.config_file())?;
        Ok(())
    }

    /// Starts one service; a running service is left alone.
    pub fn start_managed_service(&mut self, service: ServiceName) -> Result<(), StackError> {
        match self.mode {
            RunMode::Manual => {
                let name = service.as_ref();
                if let Some(pid) = self.native.running_pid(name)? {
                    info!("Service '{name}' is already running (PID {pid})");
                    return Ok(());
                }
                self.free_service_port(service);
                match self.native.start(name)? {
                    StartOutcome::Started { pid } => info!("Started '{name}' (PID {pid})"),
                    StartOutcome::AlreadyRunning { pid } => {
                        info!("Service '{name}' is already running (PID {pid})")
                    }
                }
                Ok(())
            }
            RunMode::Docker => self.start_container_service(service),
        }
    }

    /// Native-mode port preflight; problems only warn.
    fn free_service_port(&self, service: ServiceName) {
        let port = self.config.ports.port_for(service);
        if check_port(port) {
            return;
        }
        warn!("Port {port} needed by '{service}' is in use");
        match self.ports.resolve_conflict(port) {
            ConflictResolution::AlreadyFree => {}
            ConflictResolution::Freed { pids } => info!("Freed port {port} (terminated {pids:?})"),
            ConflictResolution::StillBusy { pids } => {
                warn!("Port {port} is still busy after terminating {pids:?}; starting anyway")
            }
            ConflictResolution::Undetermined => {
                warn!("Could not free port {port}; starting '{service}' anyway")
            }
        }
    }

    fn start_container_service(&mut self, service: ServiceName) -> Result<(), StackError> {
        self.containers.ensure_environment()?;
        let versions = self.effective_versions()?;
        let document = self.containers.apply_main_services(&versions)?;
        let container = service.container_name();

        if let Some(drift) = self.detect_drift_in(service, &document)? {
            info!(
                "Recreating '{service}': running {} but manifest wants {}",
                drift.running, drift.wanted
            );
            return self.up_main(&[service.as_ref()]);
        }

        if self.containers.running_image(&container)?.is_none() {
            return self.up_main(&[service.as_ref()]);
        }
        if self.containers.is_running(&container)? {
            info!("Container '{container}' is already running");
        } else {
            info!("Starting existing container '{container}'");
            self.containers.start_container(&container)?;
        }
        Ok(())
    }

    fn up_main(&self, services: &[&str]) -> Result<(), StackError> {
        let (manifest, project) = self.containers.main_target();
        self.containers.up(&manifest, project, services)
    }

    /// Versions to deploy. Floating tags are pinned through the release index when
    /// one is configured, and the pin is persisted.
    fn effective_versions(&mut self) -> Result<ImageVersions, StackError> {
        let Some(index) = self.release_index.as_deref() else {
            return Ok(self.config.versions.clone());
        };
        let pinned = self.containers.pin_versions(&self.config.versions, index);
        if pinned != self.config.versions {
            self.config.versions = pinned.clone();
            self.save_config()?;
        }
        Ok(pinned)
    }

    /// Stops one service; a stopped service is left alone.
    pub fn stop_managed_service(&mut self, service: ServiceName) -> Result<(), StackError> {
        match self.mode {
            RunMode::Manual => {
                let name = service.as_ref();
                match self.native.stop(name)? {
                    StopOutcome::AlreadyStopped => info!("Service '{name}' is not running"),
                    StopOutcome::Graceful { pid } => info!("Stopped '{name}' (PID {pid})"),
                    StopOutcome::Forced { pid } => info!("Killed '{name}' (PID {pid})"),
                }
                Ok(())
            }
            RunMode::Docker => {
                if !self.paths.main_manifest().exists() {
                    debug!("No main manifest; '{service}' was never started");
                    return Ok(());
                }
                let container = service.container_name();
                if self.containers.is_running(&container)? {
                    self.containers.stop_container(&container)?;
                    info!("Stopped container '{container}'");
                } else {
                    info!("Container '{container}' is not running");
                }
                Ok(())
            }
        }
    }

    /// Stop then start, sequentially. An existing container whose image matches the
    /// manifest is restarted in place.
    pub fn restart_managed_service(&mut self, service: ServiceName) -> Result<(), StackError> {
        if self.mode == RunMode::Docker && self.paths.main_manifest().exists() {
            self.containers.ensure_environment()?;
            let container = service.container_name();
            if self.containers.running_image(&container)?.is_some()
                && self.detect_drift(service)?.is_none()
            {
                info!("Restarting container '{container}'");
                self.containers.restart_container(&container)?;
                return Ok(());
            }
        }
        self.stop_managed_service(service)?;
        self.start_managed_service(service)
    }

    /// `(running, pid, log path)`. PID and log path exist only in manual mode.
    pub fn service_running(
        &self,
        service: ServiceName,
    ) -> Result<(bool, Option<u32>, Option<PathBuf>), StackError> {
        match self.mode {
            RunMode::Manual => {
                let name = service.as_ref();
                let pid = self.native.running_pid(name)?;
                Ok((pid.is_some(), pid, Some(self.paths.log_file(name))))
            }
            RunMode::Docker => {
                if !self.paths.main_manifest().exists() {
                    return Ok((false, None, None));
                }
                let running = self.containers.is_running(&service.container_name())?;
                Ok((running, None, None))
            }
        }
    }

    /// Engine first, then console.
    pub fn start_all(&mut self) -> Result<(), StackError> {
        for service in ServiceName::START_ORDER {
            self.start_managed_service(service)?;
        }
        Ok(())
    }

    /// Console first, then engine.
    pub fn stop_all(&mut self) -> Result<(), StackError> {
        for service in ServiceName::STOP_ORDER {
            self.stop_managed_service(service)?;
        }
        Ok(())
    }

    /// Stops everything and, in docker mode, removes the core containers through the
    /// compose project. Database containers are left alone.
    pub fn down_all(&mut self) -> Result<(), StackError> {
        match self.mode {
            RunMode::Manual => self.stop_all(),
            RunMode::Docker => {
                let (manifest, project) = self.containers.main_target();
                self.containers.down(&manifest, project)
            }
        }
    }

    pub fn restart_all(&mut self) -> Result<(), StackError> {
        self.stop_all()?;
        self.start_all()
    }

    /// Image drift of `service` against the main manifest, if the container exists.
    pub fn detect_drift(&self, service: ServiceName) -> Result<Option<Drift>, StackError> {
        let document = ComposeDocument::load_or_discard(&self.paths.main_manifest())?;
        self.detect_drift_in(service, &document)
    }

    fn detect_drift_in(
        &self,
        service: ServiceName,
        document: &ComposeDocument,
    ) -> Result<Option<Drift>, StackError> {
        let Some((_, spec)) = document.find(&service.container_name()) else {
            return Ok(None);
        };
        let Some(running) = self.containers.running_image(&spec.container_name)? else {
            return Ok(None);
        };
        if running == spec.image {
            return Ok(None);
        }
        Ok(Some(Drift {
            service,
            running,
            wanted: spec.image.clone(),
        }))
    }

    /// Status of `services` plus every configured database.
    pub fn status(&self, services: &[ServiceName]) -> Result<StatusReport, StackError> {
        let mut report = StatusReport {
            mode: self.mode,
            services: Vec::with_capacity(services.len()),
            databases: Vec::new(),
        };

        let containers = match self.mode {
            RunMode::Docker => Some(self.containers.status(&self.paths.main_manifest())?),
            RunMode::Manual => None,
        };

        for &service in services {
            let port = self.config.ports.port_for(service);
            let status = match &containers {
                None => {
                    let name = service.as_ref();
                    let pid = self.native.running_pid(name)?;
                    let (uptime_secs, memory_mb) = pid.map(process_metrics).unwrap_or_default();
                    ServiceStatus {
                        name: service,
                        running: pid.is_some(),
                        pid,
                        port,
                        uptime_secs,
                        memory_mb,
                        log_path: Some(self.paths.log_file(name)),
                        container: None,
                        image: None,
                    }
                }
                Some(entries) => {
                    let container = service.container_name();
                    let entry = entries.iter().find(|e| e.container_name == container);
                    ServiceStatus {
                        name: service,
                        running: entry.is_some_and(|e| e.running),
                        pid: None,
                        port,
                        uptime_secs: None,
                        memory_mb: None,
                        log_path: None,
                        image: entry.map(|e| e.image.clone()),
                        container: Some(container),
                    }
                }
            };
            report.services.push(status);
        }

        report.databases = self.database_status()?;
        Ok(report)
    }

    /// Status of every configured database container.
    pub fn database_status(&self) -> Result<Vec<DatabaseStatus>, StackError> {
        let configured: Vec<&DatabaseInstanceConfig> = [DatabaseRole::System, DatabaseRole::Project]
            .into_iter()
            .filter_map(|role| self.config.databases.get(role))
            .collect();
        if configured.is_empty() {
            return Ok(Vec::new());
        }

        let listed = match self.containers.database_status() {
            Ok(listed) => listed,
            Err(err) if self.mode == RunMode::Manual => {
                warn!("Database status unavailable: {err}");
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        Ok(configured
            .into_iter()
            .map(|db| {
                let container = db.container_name();
                DatabaseStatus {
                    role: db.role,
                    engine: db.engine,
                    running: listed
                        .iter()
                        .any(|entry| entry.container_name == container && entry.running),
                    port: db.host_port(),
                    container,
                }
            })
            .collect())
    }

    /// Prints the last `lines` log lines of `service`; follows until `stop` when asked.
    pub fn logs(
        &self,
        service: ServiceName,
        lines: usize,
        follow: bool,
        stop: &AtomicBool,
        out: &mut dyn Write,
    ) -> Result<(), StackError> {
        match self.mode {
            RunMode::Manual => {
                let path = self.paths.log_file(service.as_ref());
                let log_err = |source| StackError::LogRead {
                    path: path.clone(),
                    source,
                };
                if follow {
                    logs::follow(&path, lines, stop, out).map_err(log_err)
                } else {
                    for line in self.native.read_recent_logs(service.as_ref(), lines)? {
                        writeln!(out, "{line}").map_err(log_err)?;
                    }
                    Ok(())
                }
            }
            RunMode::Docker => {
                self.containers.ensure_environment()?;
                self.containers
                    .logs(&service.container_name(), follow, lines)?;
                Ok(())
            }
        }
    }

    /// Runs `service` attached to this terminal until it exits or `cancel` is raised.
    pub fn run_foreground<W>(
        &self,
        service: ServiceName,
        cancel: Arc<AtomicBool>,
        out: W,
    ) -> Result<ForegroundExit, StackError>
    where
        W: Write + Send + 'static,
    {
        if self.mode != RunMode::Manual {
            return Err(StackError::NativeOnly {
                operation: format!("run {service}"),
            });
        }
        let name = service.as_ref();
        if let Some(pid) = self.native.running_pid(name)? {
            return Err(StackError::AlreadyRunning {
                service: name.to_string(),
                pid,
            });
        }
        self.free_service_port(service);
        run_foreground(
            self.native.descriptor(name)?,
            self.native.probe(),
            cancel,
            self.native.stop_timeout(),
            out,
        )
    }

    /// Creates or replaces the database for `db.role` and records it in the config.
    pub fn provision_database(&mut self, db: DatabaseInstanceConfig) -> Result<(), StackError> {
        if let Some(previous) = self.config.databases.get(db.role).cloned()
            && previous.engine != db.engine
        {
            info!(
                "Replacing {} database {} with {}",
                db.role, previous.engine, db.engine
            );
            self.containers.deprovision_database(&previous)?;
        }

        self.containers.provision_database(&db)?;
        info!(
            "Database '{}' available on port {}",
            db.container_name(),
            db.host_port()
        );
        self.config.databases.set(db.role, Some(db));
        self.save_config()
    }

    /// Removes the database configured for `role`.
    pub fn deprovision_database(&mut self, role: DatabaseRole) -> Result<(), StackError> {
        let db = self
            .config
            .databases
            .get(role)
            .cloned()
            .ok_or_else(|| StackError::DatabaseNotConfigured {
                role: role.to_string(),
            })?;

        if !self.containers.deprovision_database(&db)? {
            debug!("'{}' was not in the database manifest", db.container_name());
        }
        self.config.databases.set(role, None);
        self.save_config()
    }

    /// True when `port` can be bound.
    pub fn check_port(&self, port: u16) -> bool {
        self.ports.is_available(port)
    }

    /// Terminates whatever holds `port`. Manual mode only.
    pub fn free_port(&self, port: u16) -> Result<ConflictResolution, StackError> {
        if self.mode != RunMode::Manual {
            return Err(StackError::NativeOnly {
                operation: format!("port free {port}"),
            });
        }
        Ok(self.ports.resolve_conflict(port))
    }
}
