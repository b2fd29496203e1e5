//! Native process supervision backed by one PID file per service.
//!
//! Every CLI invocation builds a fresh [`NativeSupervisor`]; the PID files and log
//! files under the root directory are the only state shared between invocations.
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant, SystemTime},
};

use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::{
    atomic::write_atomic,
    constants::{
        KILL_CONFIRM_TIMEOUT, PID_REUSE_TOLERANCE, PROCESS_CHECK_INTERVAL, START_SETTLE_DELAY,
    },
    error::{PidFileError, StackError},
    logs::read_recent_lines,
    probe::ProcessProbe,
};

/// Identity and launch recipe of a natively-run service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Port the service binds, used for conflict checks.
    pub port: Option<u16>,
}

/// The PID file of one service: a single integer.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recorded PID. Missing files and garbage contents both read as `None`.
    pub fn read(&self) -> Result<Option<u32>, PidFileError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PidFileError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        match contents.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => {
                warn!(
                    "Ignoring malformed PID file {} ({:?})",
                    self.path.display(),
                    contents.trim()
                );
                Ok(None)
            }
        }
    }

    /// When the PID was recorded.
    pub fn recorded_at(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    pub fn write(&self, pid: u32) -> Result<(), PidFileError> {
        write_atomic(&self.path, pid.to_string().as_bytes()).map_err(|source| {
            PidFileError::Write {
                path: self.path.clone(),
                source,
            }
        })
    }

    /// Deletes the file; a missing file is fine.
    pub fn remove(&self) -> Result<(), PidFileError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PidFileError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running.
    AlreadyStopped,
    /// Exited within the grace window.
    Graceful { pid: u32 },
    /// Needed SIGKILL.
    Forced { pid: u32 },
}

/// A service's persisted PID plus the probe that validates it.
pub struct ProcessHandle<'a> {
    descriptor: &'a ServiceDescriptor,
    pid_file: PidFile,
    probe: &'a dyn ProcessProbe,
}

impl<'a> ProcessHandle<'a> {
    pub fn new(descriptor: &'a ServiceDescriptor, probe: &'a dyn ProcessProbe) -> Self {
        Self {
            descriptor,
            pid_file: PidFile::new(&descriptor.pid_file),
            probe,
        }
    }

    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    /// The recorded PID if it still names the process we started.
    ///
    /// A PID file surviving a crash or reboot may point at nothing, or at an unrelated
    /// process that reused the number.
    pub fn live_pid(&self) -> Result<Option<u32>, PidFileError> {
        let Some(pid) = self.pid_file.read()? else {
            return Ok(None);
        };

        if !self.probe.is_alive(pid) {
            debug!(
                "PID {pid} recorded for '{}' is not alive",
                self.descriptor.name
            );
            return Ok(None);
        }

        if let (Some(started), Some(recorded)) =
            (self.probe.started_at(pid), self.pid_file.recorded_at())
            && started > recorded + PID_REUSE_TOLERANCE
        {
            debug!(
                "PID {pid} for '{}' was reused by a newer process",
                self.descriptor.name
            );
            return Ok(None);
        }

        Ok(Some(pid))
    }

    pub fn is_running(&self) -> Result<bool, PidFileError> {
        Ok(self.live_pid()?.is_some())
    }

    /// Graceful-then-forceful termination of the recorded process.
    pub fn terminate(&self, timeout: Duration) -> Result<StopOutcome, StackError> {
        let name = &self.descriptor.name;
        let Some(pid) = self.live_pid()? else {
            if self.pid_file.exists() {
                debug!("Clearing stale PID file for '{name}'");
            }
            self.pid_file.remove()?;
            return Ok(StopOutcome::AlreadyStopped);
        };

        info!("Stopping service '{name}' (PID {pid})");
        self.probe
            .terminate(pid)
            .map_err(|source| StackError::ServiceStopError {
                service: name.clone(),
                source,
            })?;

        let outcome = if wait_for_exit(self.probe, pid, timeout) {
            StopOutcome::Graceful { pid }
        } else {
            warn!("Service '{name}' did not exit after SIGTERM; sending SIGKILL");
            self.probe
                .kill(pid)
                .map_err(|source| StackError::ServiceStopError {
                    service: name.clone(),
                    source,
                })?;

            if !wait_for_exit(self.probe, pid, KILL_CONFIRM_TIMEOUT) {
                error!("Service '{name}' (PID {pid}) survived SIGKILL");
                return Err(StackError::ServiceStillAlive {
                    service: name.clone(),
                    pid,
                });
            }
            StopOutcome::Forced { pid }
        };

        self.pid_file.remove()?;
        debug!("Service '{name}' stopped successfully.");
        Ok(outcome)
    }
}

fn wait_for_exit(probe: &dyn ProcessProbe, pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !probe.is_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(PROCESS_CHECK_INTERVAL);
    }
}

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning { pid: u32 },
    Started { pid: u32 },
}

impl StartOutcome {
    pub fn pid(&self) -> u32 {
        match self {
            Self::AlreadyRunning { pid } | Self::Started { pid } => *pid,
        }
    }
}

/// Starts, stops and inspects detached native services.
pub struct NativeSupervisor {
    services: BTreeMap<String, ServiceDescriptor>,
    probe: Box<dyn ProcessProbe>,
    settle_delay: Duration,
    stop_timeout: Duration,
}

impl NativeSupervisor {
    pub fn new(
        descriptors: impl IntoIterator<Item = ServiceDescriptor>,
        probe: Box<dyn ProcessProbe>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            services: descriptors
                .into_iter()
                .map(|d| (d.name.clone(), d))
                .collect(),
            probe,
            settle_delay: START_SETTLE_DELAY,
            stop_timeout,
        }
    }

    /// Overrides the post-spawn settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    pub fn probe(&self) -> &dyn ProcessProbe {
        self.probe.as_ref()
    }

    pub fn descriptor(&self, name: &str) -> Result<&ServiceDescriptor, StackError> {
        self.services
            .get(name)
            .ok_or_else(|| StackError::UnknownService(name.to_string()))
    }

    pub fn handle(&self, name: &str) -> Result<ProcessHandle<'_>, StackError> {
        Ok(ProcessHandle::new(self.descriptor(name)?, self.probe.as_ref()))
    }

    /// Live PID of `name`, if running.
    pub fn running_pid(&self, name: &str) -> Result<Option<u32>, StackError> {
        Ok(self.handle(name)?.live_pid()?)
    }

    pub fn is_running(&self, name: &str) -> Result<bool, StackError> {
        Ok(self.running_pid(name)?.is_some())
    }

    /// Launches `name` detached from this process group unless it already runs.
    pub fn start(&self, name: &str) -> Result<StartOutcome, StackError> {
        let descriptor = self.descriptor(name)?;
        let handle = ProcessHandle::new(descriptor, self.probe.as_ref());

        if let Some(pid) = handle.live_pid()? {
            info!("Service '{name}' is already running (PID {pid})");
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        info!("Starting service: {name}");
        let start_err = |source| StackError::ServiceStartError {
            service: name.to_string(),
            source,
        };

        let log = open_log(&descriptor.log_file, name).map_err(start_err)?;
        let mut child = spawn_detached(descriptor, log).map_err(|source| {
            error!("Failed to start service '{name}': {source}");
            start_err(source)
        })?;
        let pid = child.id();
        debug!("Service '{name}' started with PID: {pid}");

        if let Err(err) = handle.pid_file().write(pid) {
            error!("Failed to record PID {pid} for '{name}': {err}");
            match self.probe.kill(pid) {
                Ok(()) => {
                    let _ = child.wait();
                }
                Err(kill_err) => {
                    warn!("Failed to kill untracked service '{name}' (PID {pid}): {kill_err}");
                }
            }
            return Err(err.into());
        }

        thread::sleep(self.settle_delay);

        match child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                handle.pid_file().remove()?;
                error!("Service '{name}' exited during startup ({status})");
                Err(StackError::ServiceExitedEarly {
                    service: name.to_string(),
                    status: status.to_string(),
                    log_path: descriptor.log_file.clone(),
                })
            }
            Ok(Some(status)) => {
                handle.pid_file().remove()?;
                warn!("Service '{name}' exited immediately ({status})");
                Ok(StartOutcome::Started { pid })
            }
            Ok(None) => Ok(StartOutcome::Started { pid }),
            Err(err) => {
                debug!("Unable to poll '{name}' after spawn: {err}");
                Ok(StartOutcome::Started { pid })
            }
        }
    }

    /// Stops `name` using the configured grace window.
    pub fn stop(&self, name: &str) -> Result<StopOutcome, StackError> {
        self.stop_with_timeout(name, self.stop_timeout)
    }

    pub fn stop_with_timeout(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<StopOutcome, StackError> {
        self.handle(name)?.terminate(timeout)
    }

    /// Stop then start, strictly in sequence.
    pub fn restart(&self, name: &str) -> Result<StartOutcome, StackError> {
        self.stop(name)?;
        self.start(name)
    }

    /// Last `lines` lines of the service log; empty when never started.
    pub fn read_recent_logs(&self, name: &str, lines: usize) -> Result<Vec<String>, StackError> {
        let descriptor = self.descriptor(name)?;
        read_recent_lines(&descriptor.log_file, lines).map_err(|source| StackError::LogRead {
            path: descriptor.log_file.clone(),
            source,
        })
    }
}

fn open_log(path: &Path, service: &str) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(
        file,
        "==> {} starting {service}",
        Local::now().format("%Y-%m-%d %H:%M:%S%.3f %z")
    )?;
    Ok(file)
}

/// Builds the OS command for `descriptor` with its environment and working directory.
pub fn build_command(descriptor: &ServiceDescriptor) -> Command {
    let mut cmd = Command::new(&descriptor.command);
    cmd.args(&descriptor.args);
    if descriptor.working_dir.is_dir() {
        cmd.current_dir(&descriptor.working_dir);
    } else {
        debug!(
            "Working directory {} for '{}' missing; inheriting",
            descriptor.working_dir.display(),
            descriptor.name
        );
    }
    if !descriptor.env.is_empty() {
        let keys: Vec<_> = descriptor.env.keys().collect();
        debug!("Setting environment variables: {:?}", keys);
        cmd.envs(&descriptor.env);
    }
    cmd
}

fn spawn_detached(descriptor: &ServiceDescriptor, log: File) -> std::io::Result<Child> {
    let mut cmd = build_command(descriptor);
    let stderr = log.try_clone()?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(stderr));

    debug!("Executing command: {cmd:?}");

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;

        // A new session keeps the service alive when the CLI's terminal or process
        // group goes away (including Ctrl-C).
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;

        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    cmd.spawn()
}
