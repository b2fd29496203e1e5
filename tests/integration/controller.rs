//! Lifecycle controller driven against an in-memory container tool.
use std::{
    collections::BTreeMap,
    io::{self, ErrorKind},
    path::Path,
    sync::{Arc, Mutex, atomic::AtomicBool},
};

use stackctl::{
    compose::ComposeDocument,
    config::{RunMode, ServiceName, StackConfig},
    container::{CommandOutput, CommandRunner},
    controller::LifecycleController,
    database::{DatabaseEngine, DatabaseInstanceConfig, DatabaseRole},
    error::{ContainerError, StackError, VersionLookupError},
    runtime::RuntimePaths,
    versions::ReleaseIndex,
};
use tempfile::tempdir;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Container {
    image: String,
    running: bool,
    project: String,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, Container>,
    calls: Vec<String>,
}

/// Emulates enough of a container tool to apply manifests and track containers.
struct FakeDocker {
    installed: bool,
    plugin: bool,
    legacy: bool,
    state: Mutex<State>,
}

impl FakeDocker {
    fn new() -> Self {
        Self {
            installed: true,
            plugin: true,
            legacy: false,
            state: Mutex::default(),
        }
    }

    fn legacy_only() -> Self {
        Self {
            plugin: false,
            legacy: true,
            ..Self::new()
        }
    }

    fn absent() -> Self {
        Self {
            installed: false,
            plugin: false,
            legacy: false,
            ..Self::new()
        }
    }

    fn with_container(self, name: &str, image: &str, running: bool) -> Self {
        self.state.lock().unwrap().containers.insert(
            name.to_string(),
            Container {
                image: image.to_string(),
                running,
                project: "stackctl".to_string(),
            },
        );
        self
    }

    fn container(&self, name: &str) -> Option<Container> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    fn calls_matching(&self, needle: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| call.contains(needle))
            .cloned()
            .collect()
    }

    fn compose(&self, args: &[&str]) -> CommandOutput {
        let [flag_p, project, flag_f, file, command, rest @ ..] = args else {
            return failed("usage: compose -p P -f F COMMAND");
        };
        assert_eq!((*flag_p, *flag_f), ("-p", "-f"));
        let document = match ComposeDocument::load(Path::new(file)) {
            Ok(document) => document,
            Err(err) => return failed(&err.to_string()),
        };

        match *command {
            "pull" => succeeded(""),
            "up" => {
                let wanted: Vec<&str> = rest.iter().copied().filter(|a| !a.starts_with('-')).collect();
                let mut state = self.state.lock().unwrap();
                if rest.contains(&"--remove-orphans") {
                    let declared: Vec<&str> = document
                        .services
                        .values()
                        .map(|spec| spec.container_name.as_str())
                        .collect();
                    state.containers.retain(|name, container| {
                        container.project != *project || declared.contains(&name.as_str())
                    });
                }
                for (key, spec) in &document.services {
                    if !wanted.is_empty() && !wanted.contains(&key.as_str()) {
                        continue;
                    }
                    state.containers.insert(
                        spec.container_name.clone(),
                        Container {
                            image: spec.image.clone(),
                            running: true,
                            project: project.to_string(),
                        },
                    );
                }
                succeeded("")
            }
            "down" => {
                self.state
                    .lock()
                    .unwrap()
                    .containers
                    .retain(|_, container| container.project != *project);
                succeeded("")
            }
            other => failed(&format!("unsupported compose command {other}")),
        }
    }

    fn tool(&self, args: &[&str]) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        match args {
            ["--version"] => succeeded("Docker version 27.0.0"),
            ["info", ..] => succeeded("27.0.0"),
            ["compose", "version"] if self.plugin => succeeded("v2.29.0"),
            ["compose", ..] => failed("'compose' is not a docker command"),
            ["ps", ..] => succeeded(
                &state
                    .containers
                    .iter()
                    .filter(|(_, c)| c.running)
                    .map(|(name, _)| format!("{name}\n"))
                    .collect::<String>(),
            ),
            ["inspect", _, _, name] => match state.containers.get(*name) {
                Some(container) => succeeded(&format!("{}\n", container.image)),
                None => failed(&format!("No such object: {name}")),
            },
            ["start", name] | ["stop", name] | ["restart", name] => match state.containers.get_mut(*name) {
                Some(container) => {
                    container.running = args[0] != "stop";
                    succeeded(name)
                }
                None => failed(&format!("No such container: {name}")),
            },
            ["rm", "-f", name] => {
                state.containers.remove(*name);
                succeeded(name)
            }
            _ => failed("unsupported"),
        }
    }
}

fn succeeded(stdout: &str) -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(stderr: &str) -> CommandOutput {
    CommandOutput {
        code: Some(1),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

impl CommandRunner for FakeDocker {
    fn run(&self, program: &str, args: &[&str]) -> io::Result<CommandOutput> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(format!("{program} {}", args.join(" ")));

        match program {
            "docker" if self.installed => {
                if self.plugin && args.first() == Some(&"compose") && args.get(1) != Some(&"version") {
                    return Ok(self.compose(&args[1..]));
                }
                Ok(self.tool(args))
            }
            "docker-compose" if self.legacy => match args {
                ["--version"] => Ok(succeeded("docker-compose version 1.29.2")),
                _ => Ok(self.compose(args)),
            },
            _ => Err(io::Error::from(ErrorKind::NotFound)),
        }
    }

    fn run_attached(&self, program: &str, args: &[&str]) -> io::Result<Option<i32>> {
        self.run(program, args).map(|out| out.code)
    }
}

struct PinnedIndex;

impl ReleaseIndex for PinnedIndex {
    fn latest_tag(&self, component: &str) -> Result<String, VersionLookupError> {
        match component {
            "engine" => Ok("3.1.4".to_string()),
            _ => Err(VersionLookupError::Status(503)),
        }
    }
}

fn docker_controller(
    root: &Path,
    config: StackConfig,
    docker: &Arc<FakeDocker>,
    index: Option<Box<dyn ReleaseIndex>>,
) -> LifecycleController {
    let runner: Arc<dyn CommandRunner> = docker.clone();
    LifecycleController::with_parts(RuntimePaths::from_root(root), config, runner, index)
}

#[test]
fn containers_are_created_stopped_and_restarted_in_place() {
    let temp = tempdir().unwrap();
    let docker = Arc::new(FakeDocker::new());
    let mut controller = docker_controller(temp.path(), StackConfig::default(), &docker, None);
    assert_eq!(controller.mode(), RunMode::Docker);

    controller.start_all().unwrap();
    let engine = docker.container("stackctl-engine").unwrap();
    assert_eq!(engine.image, "stackctl/engine:latest");
    assert!(engine.running);
    assert!(docker.container("stackctl-console").unwrap().running);

    let manifest = ComposeDocument::load(&temp.path().join("docker/compose.yaml")).unwrap();
    assert_eq!(manifest.services.len(), 2);
    assert!(temp.path().join("engine/.env").is_file());
    assert!(temp.path().join("engine/data").is_dir());

    controller.stop_all().unwrap();
    assert!(!docker.container("stackctl-engine").unwrap().running);
    assert!(docker.container("stackctl-console").is_some(), "stop must not remove");

    let ups_before = docker.calls_matching(" up -d").len();
    controller.start_managed_service(ServiceName::Engine).unwrap();
    assert!(docker.container("stackctl-engine").unwrap().running);
    assert_eq!(docker.calls_matching(" up -d").len(), ups_before);
    assert_eq!(docker.calls_matching("start stackctl-engine").len(), 1);

    controller.restart_managed_service(ServiceName::Console).unwrap();
    assert!(docker.container("stackctl-console").unwrap().running);
    assert_eq!(docker.calls_matching("restart stackctl-console").len(), 1);
    assert_eq!(docker.calls_matching(" up -d").len(), ups_before);
    controller.stop_managed_service(ServiceName::Console).unwrap();

    let report = controller.status(&ServiceName::START_ORDER).unwrap();
    assert!(report.services[0].running);
    assert!(!report.services[1].running);
    assert_eq!(report.services[0].container.as_deref(), Some("stackctl-engine"));
}

#[test]
fn drifted_container_is_recreated_with_pinned_tag() {
    let temp = tempdir().unwrap();
    let docker = Arc::new(
        FakeDocker::new()
            .with_container("stackctl-engine", "stackctl/engine:1.0.0", true)
            .with_container("stackctl-console", "stackctl/console:latest", true),
    );
    let paths = RuntimePaths::from_root(temp.path());
    let mut controller =
        docker_controller(temp.path(), StackConfig::default(), &docker, Some(Box::new(PinnedIndex)));

    controller.start_managed_service(ServiceName::Engine).unwrap();

    assert_eq!(docker.container("stackctl-engine").unwrap().image, "stackctl/engine:3.1.4");
    let saved = StackConfig::load(&paths.config_file()).unwrap();
    assert_eq!(saved.versions.engine.as_deref(), Some("3.1.4"));
    assert_eq!(saved.versions.console, None);
    assert!(controller.detect_drift(ServiceName::Engine).unwrap().is_none());

    // Console already matches its manifest entry; nothing is recreated.
    let ups_before = docker.calls_matching(" up -d").len();
    controller.start_managed_service(ServiceName::Console).unwrap();
    assert_eq!(docker.calls_matching(" up -d").len(), ups_before);
}

#[test]
fn legacy_compose_is_used_without_the_plugin() {
    let temp = tempdir().unwrap();
    let docker = Arc::new(FakeDocker::legacy_only());
    let mut controller = docker_controller(temp.path(), StackConfig::default(), &docker, None);

    controller.start_managed_service(ServiceName::Console).unwrap();

    assert!(docker.container("stackctl-console").unwrap().running);
    assert!(docker.container("stackctl-engine").is_none());
    assert!(!docker.calls_matching("docker-compose -p stackctl").is_empty());
}

#[test]
fn missing_tool_is_reported_before_anything_is_written() {
    let temp = tempdir().unwrap();
    let docker = Arc::new(FakeDocker::absent());
    let mut controller = docker_controller(temp.path(), StackConfig::default(), &docker, None);

    let err = controller.start_all().unwrap_err();
    assert!(matches!(
        err,
        StackError::Container(ContainerError::EngineMissing { .. })
    ));
    assert!(err.to_string().contains("manual mode"));
    assert!(!temp.path().join("docker/compose.yaml").exists());
}

#[test]
fn database_roles_are_provisioned_independently() {
    let temp = tempdir().unwrap();
    let paths = RuntimePaths::from_root(temp.path());
    let docker = Arc::new(FakeDocker::new());
    let mut controller = docker_controller(temp.path(), StackConfig::default(), &docker, None);

    controller
        .provision_database(DatabaseInstanceConfig::new(DatabaseEngine::Postgres, DatabaseRole::System))
        .unwrap();
    controller
        .provision_database(DatabaseInstanceConfig::new(DatabaseEngine::Postgres, DatabaseRole::Project))
        .unwrap();
    assert!(docker.container("stackctl-system-postgres").unwrap().running);
    assert!(docker.container("stackctl-project-postgres").unwrap().running);

    // Switching the project engine replaces only the project container.
    controller
        .provision_database(DatabaseInstanceConfig::new(DatabaseEngine::Mysql, DatabaseRole::Project))
        .unwrap();
    assert!(docker.container("stackctl-project-postgres").is_none());
    assert!(docker.container("stackctl-project-mysql").unwrap().running);
    assert!(docker.container("stackctl-system-postgres").unwrap().running);

    let manifest = ComposeDocument::load(&paths.database_manifest()).unwrap();
    assert_eq!(manifest.services.len(), 2);
    assert_eq!(manifest.services["project"].container_name, "stackctl-project-mysql");
    assert_eq!(manifest.services["project"].ports, vec!["4306:3306".to_string()]);

    let statuses = controller.database_status().unwrap();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|db| db.running));

    controller.deprovision_database(DatabaseRole::System).unwrap();
    controller.deprovision_database(DatabaseRole::Project).unwrap();
    assert!(!paths.database_manifest().exists());
    assert!(docker.container("stackctl-project-mysql").is_none());

    let saved = StackConfig::load(&paths.config_file()).unwrap();
    assert!(saved.databases.get(DatabaseRole::System).is_none());
    assert!(matches!(
        controller.deprovision_database(DatabaseRole::System),
        Err(StackError::DatabaseNotConfigured { .. })
    ));

    // The core services' manifest is never touched by database operations.
    assert!(!paths.main_manifest().exists());
}

#[test]
fn database_changes_leave_the_core_manifest_untouched() {
    let temp = tempdir().unwrap();
    let paths = RuntimePaths::from_root(temp.path());
    let docker = Arc::new(FakeDocker::new());
    let mut controller = docker_controller(temp.path(), StackConfig::default(), &docker, None);

    controller.start_all().unwrap();
    let core_before = std::fs::read(paths.main_manifest()).unwrap();

    controller
        .provision_database(DatabaseInstanceConfig::new(DatabaseEngine::Postgres, DatabaseRole::Project))
        .unwrap();
    let databases = ComposeDocument::load(&paths.database_manifest()).unwrap();
    assert_eq!(databases.services.keys().collect::<Vec<_>>(), vec!["project"]);
    assert_eq!(
        databases.services["project"].container_name,
        "stackctl-project-postgres"
    );
    assert_eq!(std::fs::read(paths.main_manifest()).unwrap(), core_before);

    controller.deprovision_database(DatabaseRole::Project).unwrap();
    assert!(!paths.database_manifest().exists());
    assert_eq!(std::fs::read(paths.main_manifest()).unwrap(), core_before);
    assert!(docker.container("stackctl-engine").unwrap().running);
    assert!(docker.container("stackctl-console").unwrap().running);
}

#[test]
fn down_removes_core_containers_but_keeps_databases() {
    let temp = tempdir().unwrap();
    let docker = Arc::new(FakeDocker::new());
    let mut controller = docker_controller(temp.path(), StackConfig::default(), &docker, None);

    controller.start_all().unwrap();
    controller
        .provision_database(DatabaseInstanceConfig::new(DatabaseEngine::Postgres, DatabaseRole::System))
        .unwrap();

    controller.down_all().unwrap();

    assert!(docker.container("stackctl-engine").is_none());
    assert!(docker.container("stackctl-console").is_none());
    assert!(docker.container("stackctl-system-postgres").unwrap().running);
    assert_eq!(
        docker.calls_matching("down --remove-orphans"),
        vec![format!(
            "docker compose -p stackctl -f {} down --remove-orphans",
            temp.path().join("docker/compose.yaml").display()
        )]
    );

    // The manifest survives, so the next start recreates the containers.
    controller.start_all().unwrap();
    assert!(docker.container("stackctl-engine").unwrap().running);
}

#[test]
fn manual_only_operations_are_refused_in_docker_mode() {
    let temp = tempdir().unwrap();
    let docker = Arc::new(FakeDocker::new());
    let controller = docker_controller(temp.path(), StackConfig::default(), &docker, None);

    let cancel = Arc::new(AtomicBool::new(false));
    assert!(matches!(
        controller.run_foreground(ServiceName::Engine, cancel, io::sink()),
        Err(StackError::NativeOnly { .. })
    ));
    assert!(matches!(
        controller.free_port(1),
        Err(StackError::NativeOnly { .. })
    ));
}

#[cfg(unix)]
#[test]
fn manual_mode_never_calls_the_container_tool() {
    use stackctl::config::{NativeCommand, NativeConfig, PortConfig};

    let temp = tempdir().unwrap();
    let script = |text: &str| NativeCommand {
        command: Some("sh".to_string()),
        args: vec!["-c".to_string(), text.to_string()],
        ..NativeCommand::default()
    };
    let config = StackConfig {
        mode: Some(RunMode::Manual),
        native: NativeConfig {
            engine: Some(script("echo engine on $PORT; exec sleep 30")),
            console: Some(script("echo console via $ENGINE_URL; exec sleep 30")),
            stop_timeout_secs: Some(2),
        },
        ports: PortConfig {
            engine: 18431,
            console: 18432,
        },
        ..StackConfig::default()
    };
    let docker = Arc::new(FakeDocker::new());
    let mut controller = docker_controller(temp.path(), config, &docker, None)
        .with_settle_delay(std::time::Duration::from_millis(200));

    controller.start_all().unwrap();
    let (running, pid, log) = controller.service_running(ServiceName::Console).unwrap();
    assert!(running);
    assert!(pid.is_some());
    assert_eq!(log, Some(temp.path().join("logs/console.log")));

    controller.stop_all().unwrap();
    assert!(!controller.service_running(ServiceName::Engine).unwrap().0);

    let mut out = Vec::new();
    controller
        .logs(ServiceName::Console, 5, false, &AtomicBool::new(false), &mut out)
        .unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("starting console"));

    assert!(docker.calls_matching("docker").is_empty());
}
