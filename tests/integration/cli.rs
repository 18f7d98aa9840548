#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    process::{Command as StdCommand, Stdio},
    thread,
    time::{Duration, Instant},
};

use assert_cmd::Command;
use common::wait_for_file_contains;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn help_describes_options() {
    Command::new(assert_cmd::cargo::cargo_bin!("corral"))
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--shutdown-timeout-ms"));
}

#[test]
fn missing_config_fails() {
    let temp = tempdir().expect("failed to create tempdir");
    Command::new(assert_cmd::cargo::cargo_bin!("corral"))
        .arg("--config")
        .arg(temp.path().join("absent.yaml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("absent.yaml"));
}

#[test]
fn invalid_service_is_rejected_before_anything_starts() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_path = temp.path().join("corral.yaml");
    fs::write(
        &config_path,
        r#"version: "1"
port: 0
services:
  - name: master
    command: ["sleep", "30"]
"#,
    )
    .expect("failed to write config");

    Command::new(assert_cmd::cargo::cargo_bin!("corral"))
        .arg("--config")
        .arg(&config_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("reserved"));
}

#[test]
fn sigterm_shuts_supervisor_down_cleanly() {
    let temp = tempdir().expect("failed to create tempdir");
    let config_path = temp.path().join("corral.yaml");
    fs::write(
        &config_path,
        r#"version: "1"
port: 0
stagger_ms: 10
services:
  - name: Sleeper
    command: ["sleep", "30"]
"#,
    )
    .expect("failed to write config");

    let mut child = StdCommand::new(assert_cmd::cargo::cargo_bin!("corral"))
        .arg("--config")
        .arg(&config_path)
        .arg("--log-level")
        .arg("info")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn corral");

    let supervisor_log = temp.path().join("logs/supervisor.log");
    wait_for_file_contains(&supervisor_log, "Service 'Sleeper' running with PID");

    signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).expect("send SIGTERM");

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().expect("try_wait") {
            break status;
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("corral did not exit after SIGTERM");
        }
        thread::sleep(Duration::from_millis(50));
    };
    assert!(status.success());

    let log = fs::read_to_string(&supervisor_log).expect("supervisor log");
    assert!(log.contains("corral is shutting down"));
    assert!(log.contains("Stopping service 'Sleeper'"));
}
