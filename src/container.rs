//! Container backend: manifests applied through the external container tool's CLI.
//!
//! The tool is reached only through [`CommandRunner`]: arguments go in, exit code and
//! captured output come back. Compose operations try the v2 plugin form
//! (`<tool> compose ...`) first and the legacy standalone binary (`<tool>-compose ...`)
//! second.
use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{Arc, OnceLock},
};

use tracing::{debug, info, warn};

use crate::{
    compose::{ComposeDocument, ServiceSpec, update_manifest},
    config::{ImageRepositories, ImageVersions, PortConfig, ServiceName, StackConfig},
    constants::{
        CONSOLE_CONTAINER_PORT, DATABASE_PROJECT_NAME, DEFAULT_ENGINE_PORT, MAIN_PROJECT_NAME,
        RESTART_POLICY,
    },
    database::DatabaseInstanceConfig,
    error::{ContainerError, StackError},
    progress::Ticker,
    runtime::RuntimePaths,
    versions::ReleaseIndex,
};

/// Captured result of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Narrow command-execution seam in front of every external tool.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` to completion and captures its output.
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput>;

    /// Runs `program` with the caller's stdio attached, returning its exit code.
    fn run_attached(&self, program: &str, args: &[&str]) -> io::Result<Option<i32>>;
}

/// Runs real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        debug!("Executing: {}", render(program, args));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_attached(&self, program: &str, args: &[&str]) -> io::Result<Option<i32>> {
        debug!("Executing attached: {}", render(program, args));
        Ok(Command::new(program).args(args).status()?.code())
    }
}

fn render(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Running state of one manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub service: String,
    pub container_name: String,
    pub image: String,
    pub running: bool,
}

/// Drives the container tool for the core services and the database containers.
pub struct ContainerBackend {
    tool: String,
    paths: RuntimePaths,
    images: ImageRepositories,
    ports: PortConfig,
    runner: Arc<dyn CommandRunner>,
    ready: OnceLock<()>,
}

impl ContainerBackend {
    pub fn new(paths: RuntimePaths, config: &StackConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            tool: config.container_tool().to_string(),
            paths,
            images: config.images.clone(),
            ports: config.ports.clone(),
            runner,
            ready: OnceLock::new(),
        }
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    fn legacy_compose(&self) -> String {
        format!("{}-compose", self.tool)
    }

    /// Verifies the tool, its daemon and a compose implementation are usable.
    ///
    /// Runs once per backend; later calls return immediately.
    pub fn ensure_environment(&self) -> Result<(), ContainerError> {
        if self.ready.get().is_some() {
            return Ok(());
        }

        let tool = self.tool.as_str();
        match self.runner.run(tool, &["--version"]) {
            Ok(out) if out.success() => debug!("{tool} version: {}", first_line(&out.stdout)),
            Ok(_) => {
                return Err(ContainerError::EngineMissing {
                    tool: tool.to_string(),
                });
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(ContainerError::EngineMissing {
                    tool: tool.to_string(),
                });
            }
            Err(source) => {
                return Err(ContainerError::Exec {
                    command: render(tool, &["--version"]),
                    source,
                });
            }
        }

        let info_args = ["info", "--format", "{{.ServerVersion}}"];
        let info = self
            .runner
            .run(tool, &info_args)
            .map_err(|source| ContainerError::Exec {
                command: render(tool, &info_args),
                source,
            })?;
        if !info.success() {
            return Err(ContainerError::DaemonUnavailable {
                tool: tool.to_string(),
                detail: first_line(&info.stderr),
            });
        }

        let v2 = self
            .runner
            .run(tool, &["compose", "version"])
            .is_ok_and(|out| out.success());
        if !v2 {
            let legacy = self.legacy_compose();
            let v1 = self
                .runner
                .run(&legacy, &["--version"])
                .is_ok_and(|out| out.success());
            if !v1 {
                return Err(ContainerError::ComposeMissing {
                    tool: tool.to_string(),
                });
            }
            debug!("Using legacy {legacy}");
        }

        let _ = self.ready.set(());
        Ok(())
    }

    /// Runs a compose subcommand against `manifest` under `project`.
    ///
    /// The v1 binary is tried whenever the v2 form fails. When v1 is not installed the
    /// v2 failure is reported, so a genuine error from a v2-only host is not replaced by
    /// a misleading "not found".
    pub fn compose(
        &self,
        manifest: &Path,
        project: &str,
        args: &[&str],
    ) -> Result<CommandOutput, ContainerError> {
        let file = manifest.to_string_lossy();
        let mut base = vec!["-p", project, "-f", file.as_ref()];
        base.extend_from_slice(args);

        let mut v2_args = vec!["compose"];
        v2_args.extend_from_slice(&base);
        let v2_command = render(&self.tool, &v2_args);

        let v2_failure = match self.runner.run(&self.tool, &v2_args) {
            Ok(out) if out.success() => return Ok(out),
            Ok(out) => {
                debug!("`{v2_command}` failed; retrying with legacy compose");
                Some(ContainerError::CommandFailed {
                    command: v2_command,
                    exit_code: out.code,
                    stderr: out.stderr.trim().to_string(),
                })
            }
            Err(err) => {
                debug!("`{v2_command}` could not run ({err}); retrying with legacy compose");
                None
            }
        };

        let legacy = self.legacy_compose();
        let v1_command = render(&legacy, &base);
        match self.runner.run(&legacy, &base) {
            Ok(out) if out.success() => Ok(out),
            Ok(out) => Err(ContainerError::CommandFailed {
                command: v1_command,
                exit_code: out.code,
                stderr: out.stderr.trim().to_string(),
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(v2_failure.unwrap_or_else(|| ContainerError::ComposeMissing {
                    tool: self.tool.clone(),
                }))
            }
            Err(source) => Err(ContainerError::Exec {
                command: v1_command,
                source,
            }),
        }
    }

    /// Runs a plain tool subcommand that must succeed.
    fn tool_command(&self, args: &[&str]) -> Result<CommandOutput, ContainerError> {
        let command = render(&self.tool, args);
        let out = self
            .runner
            .run(&self.tool, args)
            .map_err(|source| ContainerError::Exec {
                command: command.clone(),
                source,
            })?;
        if out.success() {
            Ok(out)
        } else {
            Err(ContainerError::CommandFailed {
                command,
                exit_code: out.code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    /// Fills unset or floating tags from the release index.
    ///
    /// Lookup failures keep `latest` and are only logged.
    pub fn pin_versions(&self, versions: &ImageVersions, index: &dyn ReleaseIndex) -> ImageVersions {
        let mut pinned = versions.clone();
        for service in ServiceName::START_ORDER {
            if !versions.is_floating(service) {
                continue;
            }
            match index.latest_tag(service.as_ref()) {
                Ok(tag) if !tag.trim().is_empty() => {
                    info!("Pinned {service} image to {tag}");
                    pinned.set(service, tag);
                }
                Ok(_) => warn!("Release index returned an empty tag for {service}"),
                Err(err) => warn!("Version lookup for {service} failed; using latest: {err}"),
            }
        }
        pinned
    }

    /// Manifest entry for one core service.
    pub fn main_service_spec(&self, service: ServiceName, versions: &ImageVersions) -> ServiceSpec {
        let image = format!(
            "{}:{}",
            self.images.repository(service),
            versions.tag_for(service)
        );
        let host_port = self.ports.port_for(service);

        match service {
            ServiceName::Engine => {
                let dir = self.paths.service_dir(ServiceName::Engine.as_ref());
                ServiceSpec {
                    image,
                    container_name: service.container_name(),
                    environment: vec![format!("PORT={DEFAULT_ENGINE_PORT}")],
                    ports: vec![format!("{host_port}:{DEFAULT_ENGINE_PORT}")],
                    volumes: vec![
                        format!("{}:/app/.env", dir.join(".env").display()),
                        format!("{}:/app/data", dir.join("data").display()),
                    ],
                    restart: RESTART_POLICY.to_string(),
                    command: None,
                }
            }
            ServiceName::Console => ServiceSpec {
                image,
                container_name: service.container_name(),
                environment: vec![format!(
                    "ENGINE_URL=http://{}:{DEFAULT_ENGINE_PORT}",
                    ServiceName::Engine.container_name()
                )],
                ports: vec![format!("{host_port}:{CONSOLE_CONTAINER_PORT}")],
                volumes: Vec::new(),
                restart: RESTART_POLICY.to_string(),
                command: None,
            },
        }
    }

    /// Writes the engine and console entries into the main manifest.
    ///
    /// Other entries in the manifest are left alone. The engine's bind-mount sources
    /// are created so the container tool does not turn a missing `.env` into a
    /// directory.
    pub fn apply_main_services(&self, versions: &ImageVersions) -> Result<ComposeDocument, StackError> {
        let engine_dir = self.paths.service_dir(ServiceName::Engine.as_ref());
        prepare_bind_mounts(&engine_dir).map_err(|source| StackError::ServiceStartError {
            service: ServiceName::Engine.to_string(),
            source,
        })?;

        let specs: Vec<_> = ServiceName::START_ORDER
            .into_iter()
            .map(|service| (service, self.main_service_spec(service, versions)))
            .collect();

        let (document, ()) = update_manifest(&self.paths.main_manifest(), |doc| {
            for (service, spec) in specs {
                doc.upsert_service(service.as_ref(), spec);
            }
        })?;
        Ok(document)
    }

    /// Pulls images, then brings `manifest` up.
    ///
    /// A failed pull only warns; the start then relies on locally cached images.
    pub fn up(&self, manifest: &Path, project: &str, services: &[&str]) -> Result<(), StackError> {
        if !manifest.exists() {
            debug!("No manifest at {}; nothing to start", manifest.display());
            return Ok(());
        }
        self.ensure_environment()?;

        let mut pull = vec!["pull"];
        pull.extend_from_slice(services);
        {
            let _ticker = Ticker::start(format!("Pulling images for {project}"));
            if let Err(err) = self.compose(manifest, project, &pull) {
                warn!("Image pull failed; starting from cached images: {err}");
            }
        }

        let mut up = vec!["up", "-d", "--remove-orphans"];
        up.extend_from_slice(services);
        self.compose(manifest, project, &up)?;
        info!("Applied {}", manifest.display());
        Ok(())
    }

    /// Stops and removes everything in `manifest`, including containers the project no
    /// longer declares. A missing manifest is a no-op.
    pub fn down(&self, manifest: &Path, project: &str) -> Result<(), StackError> {
        if !manifest.exists() {
            debug!("No manifest at {}; nothing to stop", manifest.display());
            return Ok(());
        }
        self.ensure_environment()?;
        self.compose(manifest, project, &["down", "--remove-orphans"])?;
        info!("Tore down project '{project}'");
        Ok(())
    }

    /// Names of running containers as listed by the tool.
    pub fn running_containers(&self) -> Result<Vec<String>, ContainerError> {
        let out = self.tool_command(&["ps", "--format", "{{.Names}}"])?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Running state of every entry in `manifest`.
    pub fn status(&self, manifest: &Path) -> Result<Vec<ContainerStatus>, StackError> {
        let document = ComposeDocument::load_or_discard(manifest)?;
        if document.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_environment()?;
        let running = self.running_containers()?;

        Ok(document
            .services
            .iter()
            .map(|(key, spec)| ContainerStatus {
                service: key.clone(),
                container_name: spec.container_name.clone(),
                image: spec.image.clone(),
                running: running.iter().any(|name| name.contains(&spec.container_name)),
            })
            .collect())
    }

    /// True when a container whose name contains `container_name` is running.
    pub fn is_running(&self, container_name: &str) -> Result<bool, ContainerError> {
        self.ensure_environment()?;
        Ok(self
            .running_containers()?
            .iter()
            .any(|name| name.contains(container_name)))
    }

    /// Upserts `db` into the database manifest and applies only that manifest.
    pub fn provision_database(&self, db: &DatabaseInstanceConfig) -> Result<(), StackError> {
        self.ensure_environment()?;
        let manifest = self.paths.database_manifest();
        let spec = db.service_spec();
        info!(
            "Provisioning {} database '{}' on port {}",
            db.role,
            spec.container_name,
            db.host_port()
        );

        update_manifest(&manifest, |doc| doc.upsert_service(db.role.as_ref(), spec))?;
        self.up(&manifest, DATABASE_PROJECT_NAME, &[])
    }

    /// Removes `db`'s container and manifest entry. Its data volume is kept.
    ///
    /// Returns whether the manifest had an entry for it.
    pub fn deprovision_database(&self, db: &DatabaseInstanceConfig) -> Result<bool, StackError> {
        self.ensure_environment()?;
        let container = db.container_name();

        let args = ["rm", "-f", container.as_str()];
        match self.runner.run(&self.tool, &args) {
            Ok(out) if out.success() => info!("Removed container {container}"),
            Ok(out) => debug!("`{}` failed: {}", render(&self.tool, &args), out.stderr.trim()),
            Err(source) => {
                return Err(ContainerError::Exec {
                    command: render(&self.tool, &args),
                    source,
                }
                .into());
            }
        }

        let (document, removed) =
            update_manifest(&self.paths.database_manifest(), |doc| doc.remove_service(&container))?;
        if document.is_empty() {
            debug!("Database manifest is empty and was removed");
        }
        Ok(removed.is_some())
    }

    /// Status of every database container.
    pub fn database_status(&self) -> Result<Vec<ContainerStatus>, StackError> {
        self.status(&self.paths.database_manifest())
    }

    /// Streams or prints the tool's logs for `container_name`.
    pub fn logs(&self, container_name: &str, follow: bool, tail: usize) -> Result<(), ContainerError> {
        let tail = tail.to_string();
        let mut args = vec!["logs", "--tail", tail.as_str()];
        if follow {
            args.push("--follow");
        }
        args.push(container_name);

        let command = render(&self.tool, &args);
        let code = self
            .runner
            .run_attached(&self.tool, &args)
            .map_err(|source| ContainerError::Exec {
                command: command.clone(),
                source,
            })?;
        match code {
            Some(0) => Ok(()),
            // Ctrl-C while following.
            None if follow => Ok(()),
            exit_code => Err(ContainerError::CommandFailed {
                command,
                exit_code,
                stderr: String::new(),
            }),
        }
    }

    pub fn start_container(&self, container_name: &str) -> Result<(), ContainerError> {
        self.tool_command(&["start", container_name]).map(|_| ())
    }

    pub fn stop_container(&self, container_name: &str) -> Result<(), ContainerError> {
        self.tool_command(&["stop", container_name]).map(|_| ())
    }

    pub fn restart_container(&self, container_name: &str) -> Result<(), ContainerError> {
        self.tool_command(&["restart", container_name]).map(|_| ())
    }

    /// Image the existing container was created from, if the container exists.
    pub fn running_image(&self, container_name: &str) -> Result<Option<String>, ContainerError> {
        let args = ["inspect", "-f", "{{.Config.Image}}", container_name];
        let out = self
            .runner
            .run(&self.tool, &args)
            .map_err(|source| ContainerError::Exec {
                command: render(&self.tool, &args),
                source,
            })?;
        if !out.success() {
            return Ok(None);
        }
        let image = out.stdout.trim();
        Ok((!image.is_empty()).then(|| image.to_string()))
    }

    /// Manifest path and compose project for the core services.
    pub fn main_target(&self) -> (PathBuf, &'static str) {
        (self.paths.main_manifest(), MAIN_PROJECT_NAME)
    }
}

fn prepare_bind_mounts(engine_dir: &Path) -> io::Result<()> {
    fs::create_dir_all(engine_dir.join("data"))?;
    let env_file = engine_dir.join(".env");
    if !env_file.exists() {
        fs::write(&env_file, "")?;
    }
    Ok(())
}
