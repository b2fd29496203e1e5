use std::{fs, net::TcpListener, path::Path};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn stackctl(root: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("stackctl"));
    cmd.env("STACKCTL_HOME", root).env_remove("RUST_LOG");
    cmd
}

fn manual_root(root: &Path) {
    fs::write(
        root.join("config.yaml"),
        "mode: manual\nports:\n  engine: 18531\n  console: 18532\n",
    )
    .unwrap();
}

#[test]
fn help_lists_commands() {
    let temp = tempdir().unwrap();
    stackctl(temp.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("db"))
        .stdout(predicate::str::contains("port"));
}

#[test]
fn unknown_service_is_a_usage_error() {
    let temp = tempdir().unwrap();
    stackctl(temp.path())
        .args(["start", "scheduler"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn status_json_in_manual_mode_on_a_fresh_root() {
    let temp = tempdir().unwrap();
    manual_root(temp.path());

    let output = stackctl(temp.path())
        .args(["status", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["mode"], "manual");
    assert_eq!(report["services"][0]["name"], "engine");
    assert_eq!(report["services"][0]["running"], false);
    assert_eq!(report["services"][1]["port"], 18532);
    assert!(temp.path().join("run").is_dir());
    assert!(temp.path().join("logs").is_dir());
}

#[test]
fn root_flag_overrides_environment() {
    let env_root = tempdir().unwrap();
    let flag_root = tempdir().unwrap();
    manual_root(flag_root.path());

    stackctl(env_root.path())
        .arg("--root")
        .arg(flag_root.path())
        .args(["status", "engine", "--no-color"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Mode: manual"))
        .stdout(predicate::str::contains("● engine - Not running"));
    assert!(!env_root.path().join("run").exists());
}

#[test]
fn logs_prints_the_requested_tail() {
    let temp = tempdir().unwrap();
    manual_root(temp.path());
    fs::create_dir_all(temp.path().join("logs")).unwrap();
    fs::write(temp.path().join("logs/engine.log"), "one\ntwo\nthree\n").unwrap();

    stackctl(temp.path())
        .args(["logs", "engine", "-n", "2"])
        .assert()
        .success()
        .stdout("two\nthree\n");
}

#[test]
fn port_check_reports_busy_and_free_ports() {
    let temp = tempdir().unwrap();
    let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
    let busy = listener.local_addr().unwrap().port();

    stackctl(temp.path())
        .args(["port", "check", &busy.to_string()])
        .assert()
        .failure()
        .stdout(predicate::str::contains(format!("Port {busy} is in use")));

    drop(listener);
    stackctl(temp.path())
        .args(["port", "check", &busy.to_string()])
        .assert()
        .success()
        .stdout(predicate::str::contains("is available"));
}

#[test]
fn db_down_without_a_database_fails() {
    let temp = tempdir().unwrap();
    manual_root(temp.path());

    stackctl(temp.path())
        .args(["db", "down", "--role", "system"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "No database is configured for role 'system'",
        ));
}

#[test]
fn run_is_refused_in_docker_mode() {
    let temp = tempdir().unwrap();
    stackctl(temp.path())
        .args(["run", "engine"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("only available in manual mode"));
}

#[test]
fn docker_stop_without_manifest_needs_no_container_tool() {
    let temp = tempdir().unwrap();
    fs::write(
        temp.path().join("config.yaml"),
        "mode: docker\ncontainer_tool: definitely-not-installed\n",
    )
    .unwrap();

    stackctl(temp.path())
        .arg("stop")
        .assert()
        .success()
        .stdout(predicate::str::contains("All services stopped"));

    stackctl(temp.path())
        .arg("down")
        .assert()
        .success()
        .stdout(predicate::str::contains("All services down"));
}

#[cfg(unix)]
#[test]
fn manual_start_status_stop_round_trip() {
    let temp = tempdir().unwrap();
    fs::write(
        temp.path().join("config.yaml"),
        r#"mode: manual
ports:
  engine: 18541
  console: 18542
native:
  stop_timeout_secs: 2
  engine:
    command: sh
    args: ["-c", "echo engine up; exec sleep 30"]
  console:
    command: sh
    args: ["-c", "echo console up; exec sleep 30"]
"#,
    )
    .unwrap();

    stackctl(temp.path())
        .arg("start")
        .assert()
        .success()
        .stdout(predicate::str::contains("engine running (PID"))
        .stdout(predicate::str::contains("console running (PID"));

    let pid: u32 = fs::read_to_string(temp.path().join("run/engine.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();

    stackctl(temp.path())
        .args(["start", "engine"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("engine running (PID {pid}")));

    stackctl(temp.path())
        .args(["status", "--no-color"])
        .assert()
        .success()
        .stdout(predicate::str::contains("● engine Running"))
        .stdout(predicate::str::contains(format!(" Main PID: {pid}")));

    stackctl(temp.path())
        .arg("stop")
        .assert()
        .success();
    assert!(!temp.path().join("run/engine.pid").exists());
    assert!(!temp.path().join("run/console.pid").exists());

    let log = fs::read_to_string(temp.path().join("logs/engine.log")).unwrap();
    assert!(log.contains("starting engine"));
}
