//! TCP port availability checks and best-effort removal of port holders.
use std::{
    collections::BTreeSet,
    net::TcpListener,
    sync::{Arc, LazyLock},
    thread,
    time::Instant,
};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::{
    constants::{KILL_CONFIRM_TIMEOUT, PORT_RELEASE_WAIT, PROCESS_CHECK_INTERVAL},
    container::CommandRunner,
    probe::ProcessProbe,
};

static SS_PID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"pid=(\d+)").expect("valid ss pid pattern"));

static NETSTAT_LISTEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*TCP\s+\S+:(\d+)\s+\S+\s+LISTENING\s+(\d+)\s*$")
        .expect("valid netstat pattern")
});

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+)\b").expect("valid number pattern"));

type HolderParser = fn(&str, u16) -> Vec<u32>;

/// Outcome of [`PortProber::resolve_conflict`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Nothing held the port.
    AlreadyFree,
    /// The listed holders were terminated and the port is bindable again.
    Freed { pids: Vec<u32> },
    /// Holders were signalled but the port is still taken.
    StillBusy { pids: Vec<u32> },
    /// No diagnostic tool could name the holder.
    Undetermined,
}

/// Attempts to bind `port` on loopback and on all interfaces.
///
/// Both must succeed: on some hosts a loopback bind succeeds while a wildcard listener
/// already owns the port. The listeners are dropped immediately.
pub fn check_port(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok() && TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Identifies and removes processes listening on a port.
pub struct PortProber {
    runner: Arc<dyn CommandRunner>,
    probe: Box<dyn ProcessProbe>,
}

impl PortProber {
    pub fn new(runner: Arc<dyn CommandRunner>, probe: Box<dyn ProcessProbe>) -> Self {
        Self { runner, probe }
    }

    pub fn is_available(&self, port: u16) -> bool {
        check_port(port)
    }

    /// PIDs listening on `port`, or `None` when no diagnostic tool produced an answer.
    pub fn find_holders(&self, port: u16) -> Option<Vec<u32>> {
        let lsof_target = format!("-iTCP:{port}");
        let ss_filter = format!("sport = :{port}");
        let fuser_target = format!("{port}/tcp");

        let attempts: Vec<(&str, Vec<&str>, HolderParser)> = if cfg!(windows) {
            vec![("netstat", vec!["-ano", "-p", "tcp"], parse_netstat as HolderParser)]
        } else {
            vec![
                (
                    "lsof",
                    vec!["-nP", lsof_target.as_str(), "-sTCP:LISTEN", "-t"],
                    parse_pid_lines as HolderParser,
                ),
                ("ss", vec!["-Htlnp", ss_filter.as_str()], parse_ss as HolderParser),
                ("fuser", vec![fuser_target.as_str()], parse_fuser as HolderParser),
            ]
        };

        let mut answered = false;
        for (tool, args, parse) in attempts {
            match self.runner.run(tool, &args) {
                Ok(out) => {
                    answered = true;
                    let pids = parse(&out.stdout, port);
                    if !pids.is_empty() {
                        debug!("{tool} reports {pids:?} on port {port}");
                        return Some(pids);
                    }
                    debug!("{tool} found no listener on port {port}");
                }
                Err(err) => debug!("{tool} unavailable: {err}"),
            }
        }

        answered.then(Vec::new)
    }

    /// Frees `port` by terminating its holders, gracefully first.
    pub fn resolve_conflict(&self, port: u16) -> ConflictResolution {
        if self.is_available(port) {
            return ConflictResolution::AlreadyFree;
        }

        let own_pid = std::process::id();
        let pids: Vec<u32> = match self.find_holders(port) {
            Some(pids) => pids.into_iter().filter(|pid| *pid != own_pid).collect(),
            None => {
                warn!("Could not determine which process holds port {port}");
                return ConflictResolution::Undetermined;
            }
        };
        if pids.is_empty() {
            warn!("Port {port} is busy but no owning process could be identified");
            return ConflictResolution::Undetermined;
        }

        info!("Terminating {pids:?} holding port {port}");
        for pid in &pids {
            if let Err(err) = self.probe.terminate(*pid) {
                warn!("Failed to signal PID {pid}: {err}");
            }
        }
        self.wait_for_exit(&pids, PORT_RELEASE_WAIT);

        let survivors: Vec<u32> = pids
            .iter()
            .copied()
            .filter(|pid| self.probe.is_alive(*pid))
            .collect();
        if !survivors.is_empty() {
            warn!("Force killing {survivors:?} on port {port}");
            for pid in &survivors {
                if let Err(err) = self.probe.kill(*pid) {
                    warn!("Failed to kill PID {pid}: {err}");
                }
            }
            self.wait_for_exit(&survivors, KILL_CONFIRM_TIMEOUT);
        }

        // The kernel may need a moment to release the socket after the owner exits.
        let deadline = Instant::now() + PORT_RELEASE_WAIT;
        loop {
            if self.is_available(port) {
                return ConflictResolution::Freed { pids };
            }
            if Instant::now() >= deadline {
                return ConflictResolution::StillBusy { pids };
            }
            thread::sleep(PROCESS_CHECK_INTERVAL);
        }
    }

    fn wait_for_exit(&self, pids: &[u32], timeout: std::time::Duration) {
        let deadline = Instant::now() + timeout;
        while pids.iter().any(|pid| self.probe.is_alive(*pid)) && Instant::now() < deadline {
            thread::sleep(PROCESS_CHECK_INTERVAL);
        }
    }
}

fn dedup(pids: impl IntoIterator<Item = u32>) -> Vec<u32> {
    pids.into_iter()
        .filter(|pid| *pid > 0)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn parse_pid_lines(stdout: &str, _port: u16) -> Vec<u32> {
    dedup(stdout.lines().filter_map(|line| line.trim().parse().ok()))
}

fn parse_ss(stdout: &str, _port: u16) -> Vec<u32> {
    dedup(
        SS_PID
            .captures_iter(stdout)
            .filter_map(|caps| caps[1].parse().ok()),
    )
}

fn parse_fuser(stdout: &str, _port: u16) -> Vec<u32> {
    // fuser writes the "<port>/tcp:" label to stderr; stdout holds only PIDs.
    dedup(
        NUMBER
            .captures_iter(stdout)
            .filter_map(|caps| caps[1].parse().ok()),
    )
}

fn parse_netstat(stdout: &str, port: u16) -> Vec<u32> {
    dedup(NETSTAT_LISTEN.captures_iter(stdout).filter_map(|caps| {
        let local: u16 = caps[1].parse().ok()?;
        (local == port).then(|| caps[2].parse().ok()).flatten()
    }))
}
