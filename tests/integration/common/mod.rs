#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use stackctl::{config::StackConfig, daemon::ServiceDescriptor, runtime::RuntimePaths};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// A native descriptor that runs `script` under `sh -c` inside `root`.
pub fn shell_service(root: &Path, name: &str, script: &str) -> ServiceDescriptor {
    ServiceDescriptor {
        name: name.to_string(),
        command: PathBuf::from("sh"),
        args: vec!["-c".to_string(), script.to_string()],
        working_dir: root.to_path_buf(),
        pid_file: root.join("run").join(format!("{name}.pid")),
        log_file: root.join("logs").join(format!("{name}.log")),
        env: BTreeMap::new(),
        port: None,
    }
}

/// Writes `config` to the root's `config.yaml`.
pub fn write_config(paths: &RuntimePaths, config: &StackConfig) {
    paths.ensure_layout().expect("failed to create root layout");
    config
        .save(&paths.config_file())
        .expect("failed to write config");
}

pub fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("Timed out waiting for {:?} to exist", path);
}

pub fn wait_for_log_line(path: &Path, needle: &str) -> String {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(content) = fs::read_to_string(path)
            && content.contains(needle)
        {
            return content;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for '{needle}' in {:?}", path);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("Process {pid} did not exit in time");
}

pub fn is_process_alive(pid: u32) -> bool {
    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    system.process(target).is_some_and(|process| {
        !matches!(
            process.status(),
            sysinfo::ProcessStatus::Zombie | sysinfo::ProcessStatus::Dead
        )
    })
}
