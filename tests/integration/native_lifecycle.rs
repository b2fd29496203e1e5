#![cfg(unix)]

#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    process::{Command, Stdio},
    time::{Duration, SystemTime},
};

use common::{is_process_alive, shell_service, wait_for_log_line, wait_for_process_exit};
use stackctl::{
    daemon::{NativeSupervisor, StartOutcome, StopOutcome},
    probe::SignalProbe,
};
use tempfile::tempdir;

fn supervisor(root: &std::path::Path, scripts: &[(&str, &str)]) -> NativeSupervisor {
    NativeSupervisor::new(
        scripts
            .iter()
            .map(|(name, script)| shell_service(root, name, script)),
        Box::new(SignalProbe),
        Duration::from_secs(2),
    )
    .with_settle_delay(Duration::from_millis(200))
}

#[test]
fn start_and_stop_are_idempotent() {
    let temp = tempdir().unwrap();
    let sup = supervisor(temp.path(), &[("engine", "echo up; exec sleep 30")]);

    let first = sup.start("engine").unwrap();
    let pid = match first {
        StartOutcome::Started { pid } => pid,
        other => panic!("expected a fresh start, got {other:?}"),
    };
    assert_eq!(
        sup.start("engine").unwrap(),
        StartOutcome::AlreadyRunning { pid }
    );
    assert_eq!(
        fs::read_to_string(temp.path().join("run/engine.pid"))
            .unwrap()
            .trim(),
        pid.to_string()
    );

    assert_eq!(sup.stop("engine").unwrap(), StopOutcome::Graceful { pid });
    assert_eq!(sup.stop("engine").unwrap(), StopOutcome::AlreadyStopped);
    assert!(!temp.path().join("run/engine.pid").exists());
    assert!(!is_process_alive(pid));
}

#[test]
fn stale_pid_file_is_replaced_on_start() {
    let temp = tempdir().unwrap();
    let sup = supervisor(temp.path(), &[("engine", "exec sleep 30")]);

    let mut gone = Command::new("true").spawn().unwrap();
    let dead_pid = gone.id();
    gone.wait().unwrap();

    fs::create_dir_all(temp.path().join("run")).unwrap();
    fs::write(temp.path().join("run/engine.pid"), dead_pid.to_string()).unwrap();

    assert_eq!(sup.running_pid("engine").unwrap(), None);
    let pid = sup.start("engine").unwrap().pid();
    assert_ne!(pid, dead_pid);
    assert_eq!(sup.running_pid("engine").unwrap(), Some(pid));

    sup.stop("engine").unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn reused_pid_is_not_mistaken_for_the_service() {
    let temp = tempdir().unwrap();
    let sup = supervisor(temp.path(), &[("engine", "exec sleep 30")]);

    let mut stranger = Command::new("sleep")
        .arg("30")
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    let stranger_pid = stranger.id();

    let pid_path = temp.path().join("run/engine.pid");
    fs::create_dir_all(pid_path.parent().unwrap()).unwrap();
    fs::write(&pid_path, stranger_pid.to_string()).unwrap();
    let recorded_long_ago = SystemTime::now() - Duration::from_secs(3_600);
    fs::File::options()
        .write(true)
        .open(&pid_path)
        .unwrap()
        .set_modified(recorded_long_ago)
        .unwrap();

    assert_eq!(sup.running_pid("engine").unwrap(), None);
    assert_eq!(sup.stop("engine").unwrap(), StopOutcome::AlreadyStopped);
    assert!(is_process_alive(stranger_pid), "unrelated process was signalled");

    let _ = stranger.kill();
    let _ = stranger.wait();
}

#[test]
fn stubborn_process_is_killed_after_grace_window() {
    let temp = tempdir().unwrap();
    let sup = supervisor(
        temp.path(),
        &[("engine", "trap '' TERM; echo armed; while :; do sleep 1; done")],
    );

    let pid = sup.start("engine").unwrap().pid();
    wait_for_log_line(&temp.path().join("logs/engine.log"), "armed");

    let outcome = sup
        .stop_with_timeout("engine", Duration::from_millis(500))
        .unwrap();
    assert_eq!(outcome, StopOutcome::Forced { pid });
    wait_for_process_exit(pid);
    assert!(!temp.path().join("run/engine.pid").exists());
}

#[test]
fn engine_then_console_with_appended_logs() {
    let temp = tempdir().unwrap();
    let sup = supervisor(
        temp.path(),
        &[
            ("engine", "echo engine ready; exec sleep 30"),
            ("console", "echo console ready; exec sleep 30"),
        ],
    );

    let engine = sup.start("engine").unwrap().pid();
    let console = sup.start("console").unwrap().pid();
    assert!(sup.is_running("engine").unwrap());
    assert!(sup.is_running("console").unwrap());

    let log = temp.path().join("logs/engine.log");
    wait_for_log_line(&log, "engine ready");

    sup.stop("console").unwrap();
    sup.stop("engine").unwrap();
    assert!(!is_process_alive(engine));
    assert!(!is_process_alive(console));

    sup.restart("engine").unwrap();
    let content = wait_for_log_line(&log, "engine ready\n==>");
    assert_eq!(content.matches("starting engine").count(), 2);
    assert!(content.starts_with("==>"), "earlier output was truncated");

    let recent = sup.read_recent_logs("engine", 1).unwrap();
    assert_eq!(recent.len(), 1);

    sup.stop("engine").unwrap();
}
