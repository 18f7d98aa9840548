#![allow(dead_code)]

use std::{
    fs,
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use corral::{
    config::SupervisorSettings,
    supervisor::{ServiceReport, Supervisor},
};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Supervisor on an ephemeral port that logs into `logs_dir`.
pub fn test_supervisor(logs_dir: &Path) -> Arc<Supervisor> {
    let settings = SupervisorSettings {
        port: 0,
        health_check_interval: Duration::from_millis(100),
        stagger: Duration::from_millis(10),
        logs_dir: logs_dir.to_path_buf(),
        ..SupervisorSettings::default()
    };
    Arc::new(Supervisor::from_settings(settings))
}

pub fn wait_for(timeout: Duration, what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for {what}");
        }

        thread::sleep(Duration::from_millis(50));
    }
}

pub fn report(supervisor: &Supervisor, service: &str) -> ServiceReport {
    supervisor
        .status()
        .expect("status")
        .remove(service)
        .unwrap_or_else(|| panic!("service '{service}' missing from status"))
}

pub fn wait_for_pid(supervisor: &Supervisor, service: &str) -> u32 {
    let mut pid = None;
    wait_for(Duration::from_secs(5), &format!("PID of '{service}'"), || {
        pid = report(supervisor, service).status.pid;
        pid.is_some()
    });
    pid.unwrap()
}

pub fn wait_for_file_contains(path: &Path, needle: &str) -> String {
    let mut contents = String::new();
    wait_for(
        Duration::from_secs(5),
        &format!("'{needle}' in {path:?}"),
        || {
            contents = fs::read_to_string(path).unwrap_or_default();
            contents.contains(needle)
        },
    );
    contents
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system
        .process(Pid::from_u32(pid))
        .is_some_and(|process| process.status() != sysinfo::ProcessStatus::Zombie)
}

pub fn has_bash() -> bool {
    Path::new("/bin/bash").exists()
}
