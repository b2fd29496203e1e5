//! Liveness probing and termination of processes by PID.
//!
//! POSIX hosts answer "is this PID alive" with signal 0. Windows has no such signal, so
//! the process-list probe asks the OS process table instead. Both implement
//! [`ProcessProbe`] and the supervisor never branches on the platform itself.
use std::{
    io,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use sysinfo::{ProcessStatus, ProcessesToUpdate, System};
#[cfg(unix)]
use tracing::warn;
use tracing::debug;

/// Capability interface for inspecting and signalling processes.
pub trait ProcessProbe: Send + Sync {
    /// True if `pid` refers to a live (non-zombie) process.
    fn is_alive(&self, pid: u32) -> bool;

    /// Asks the process (and its group, where supported) to exit.
    /// A process that is already gone is not an error.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Forcefully kills the process. A process that is already gone is not an error.
    fn kill(&self, pid: u32) -> io::Result<()>;

    /// Wall-clock start time of the process, when the platform reports one.
    fn started_at(&self, pid: u32) -> Option<SystemTime> {
        process_start_time(pid)
    }
}

/// Probe matching the host platform.
pub fn system_probe() -> Box<dyn ProcessProbe> {
    #[cfg(unix)]
    {
        Box::new(SignalProbe)
    }

    #[cfg(not(unix))]
    {
        Box::new(ProcessListProbe)
    }
}

/// Start time reported by the process table.
pub fn process_start_time(pid: u32) -> Option<SystemTime> {
    let target = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    let process = system.process(target)?;
    Some(UNIX_EPOCH + Duration::from_secs(process.start_time()))
}

/// Signal-based probe for Linux and macOS.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProbe;

#[cfg(unix)]
impl SignalProbe {
    fn target(pid: u32) -> Option<nix::unistd::Pid> {
        i32::try_from(pid)
            .ok()
            .filter(|raw| *raw > 0)
            .map(nix::unistd::Pid::from_raw)
    }

    fn send(pid: u32, signal: nix::sys::signal::Signal) -> io::Result<()> {
        use nix::{errno::Errno, sys::signal, unistd::getpgid};

        let Some(target) = Self::target(pid) else {
            return Ok(());
        };

        // Detached services lead their own process group; signal the whole tree so
        // shell wrappers do not orphan their children.
        let own_pgid = getpgid(None).ok();
        if let Ok(pgid) = getpgid(Some(target))
            && pgid == target
            && Some(pgid) != own_pgid
        {
            match signal::killpg(pgid, signal) {
                Ok(()) => debug!("Sent {signal} to process group {pgid}"),
                Err(Errno::ESRCH) => {}
                Err(Errno::EPERM) => {
                    warn!(
                        "Insufficient permissions to signal process group {pgid}. Falling back to direct signal"
                    );
                }
                Err(err) => return Err(io::Error::from_raw_os_error(err as i32)),
            }
        }

        match signal::kill(target, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(io::Error::from_raw_os_error(err as i32)),
        }
    }
}

#[cfg(unix)]
impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::{
            errno::Errno,
            sys::{
                signal,
                wait::{WaitPidFlag, WaitStatus, waitpid},
            },
        };

        let Some(target) = Self::target(pid) else {
            return false;
        };

        match signal::kill(target, None) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return false,
            // Exists but belongs to another user.
            Err(Errno::EPERM) => return true,
            Err(err) => {
                debug!("Signal probe for PID {pid} failed: {err}");
                return false;
            }
        }

        // Our own exited children linger as zombies until reaped.
        if let Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) =
            waitpid(target, Some(WaitPidFlag::WNOHANG))
        {
            return false;
        }

        !is_zombie(pid)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        Self::send(pid, nix::sys::signal::Signal::SIGTERM)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        Self::send(pid, nix::sys::signal::Signal::SIGKILL)
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(contents) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The command name is parenthesised and may contain spaces; the state follows it.
    contents
        .rfind(')')
        .and_then(|idx| contents[idx + 1..].trim_start().chars().next())
        .is_some_and(|state| matches!(state, 'Z' | 'X'))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(pid: u32) -> bool {
    let target = sysinfo::Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    system
        .process(target)
        .is_some_and(|p| matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

/// Process-table probe; the only option on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessListProbe;

impl ProcessListProbe {
    fn refreshed(pid: u32) -> (System, sysinfo::Pid) {
        let target = sysinfo::Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        (system, target)
    }
}

impl ProcessProbe for ProcessListProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let (system, target) = Self::refreshed(pid);
        system
            .process(target)
            .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    #[cfg(windows)]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        taskkill(pid, false, self)
    }

    #[cfg(not(windows))]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        let (system, target) = Self::refreshed(pid);
        if let Some(process) = system.process(target)
            && process.kill_with(sysinfo::Signal::Term) == Some(false)
        {
            return Err(io::Error::other(format!("failed to send SIGTERM to {pid}")));
        }
        Ok(())
    }

    #[cfg(windows)]
    fn kill(&self, pid: u32) -> io::Result<()> {
        taskkill(pid, true, self)
    }

    #[cfg(not(windows))]
    fn kill(&self, pid: u32) -> io::Result<()> {
        let (system, target) = Self::refreshed(pid);
        if let Some(process) = system.process(target)
            && !process.kill()
        {
            return Err(io::Error::other(format!("failed to kill {pid}")));
        }
        Ok(())
    }
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool, probe: &ProcessListProbe) -> io::Result<()> {
    let mut command = std::process::Command::new("taskkill");
    command.args(["/PID", &pid.to_string(), "/T"]);
    if force {
        command.arg("/F");
    }
    let output = command.output()?;
    if output.status.success() || !probe.is_alive(pid) {
        return Ok(());
    }
    Err(io::Error::other(
        String::from_utf8_lossy(&output.stderr).trim().to_string(),
    ))
}
