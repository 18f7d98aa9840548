#[path = "common/mod.rs"]
mod common;

use std::{fs, thread, time::Duration};

use common::{is_process_alive, report, test_supervisor, wait_for, wait_for_pid};
use corral::{
    process::{ExitOutcome, SPAWN_FAILURE_CODE},
    service::ServiceState,
    spec::{RestartPolicy, ServiceSpec},
};
use tempfile::tempdir;

#[test]
fn failing_service_restarts_until_budget_is_spent() {
    let temp = tempdir().expect("failed to create tempdir");
    let logs_dir = temp.path().join("logs");
    let supervisor = test_supervisor(&logs_dir);
    supervisor
        .register_service(
            ServiceSpec::new("Crasher", ["sh", "-c", "echo run; exit 1"])
                .with_restart_policy(RestartPolicy::OnFailure)
                .with_max_restarts(1),
        )
        .expect("register");
    supervisor.start_all().expect("start_all");

    wait_for(Duration::from_secs(5), "crasher to fail", || {
        report(&supervisor, "Crasher").status.state == ServiceState::Failed
    });

    let status = report(&supervisor, "Crasher").status;
    assert_eq!(status.restart_count, 1);
    assert_eq!(status.last_exit, Some(ExitOutcome::code(1)));
    assert!(!status.healthy);

    let log = fs::read_to_string(logs_dir.join("Crasher.log")).expect("service log");
    assert_eq!(log.lines().filter(|line| *line == "run").count(), 2);
}

#[test]
fn clean_exit_is_not_restarted_under_on_failure() {
    let temp = tempdir().expect("failed to create tempdir");
    let supervisor = test_supervisor(&temp.path().join("logs"));
    supervisor
        .register_service(ServiceSpec::new("OneShot", ["sh", "-c", "exit 0"]))
        .expect("register");
    supervisor.start_all().expect("start_all");

    wait_for(Duration::from_secs(5), "one-shot to exit", || {
        report(&supervisor, "OneShot").status.last_exit.is_some()
    });
    thread::sleep(Duration::from_millis(1_200));

    let status = report(&supervisor, "OneShot").status;
    assert_eq!(status.state, ServiceState::Failed);
    assert_eq!(status.restart_count, 0);
    assert_eq!(status.last_exit, Some(ExitOutcome::code(0)));
}

#[test]
fn missing_binary_counts_as_spawn_failure() {
    let temp = tempdir().expect("failed to create tempdir");
    let supervisor = test_supervisor(&temp.path().join("logs"));
    supervisor
        .register_service(
            ServiceSpec::new("Ghost", ["/definitely/not/a/real/binary"])
                .with_restart_policy(RestartPolicy::Never),
        )
        .expect("register");
    supervisor.start_all().expect("start_all");

    let status = report(&supervisor, "Ghost").status;
    assert_eq!(status.state, ServiceState::Failed);
    assert_eq!(status.last_exit, Some(ExitOutcome::code(SPAWN_FAILURE_CODE)));
}

#[test]
fn stop_kills_process_and_prevents_restart() {
    let temp = tempdir().expect("failed to create tempdir");
    let supervisor = test_supervisor(&temp.path().join("logs"));
    supervisor
        .register_service(
            ServiceSpec::new("Sleeper", ["sleep", "30"]).with_restart_policy(RestartPolicy::Always),
        )
        .expect("register");
    supervisor.start_all().expect("start_all");

    let pid = wait_for_pid(&supervisor, "Sleeper");
    assert!(is_process_alive(pid));

    supervisor.stop_all();
    assert!(supervisor.wait_for_exit(Duration::from_secs(5)));
    wait_for(Duration::from_secs(5), "sleeper to die", || {
        !is_process_alive(pid)
    });

    thread::sleep(Duration::from_millis(1_500));
    let status = report(&supervisor, "Sleeper").status;
    assert_eq!(status.state, ServiceState::Stopped);
    assert!(status.pid.is_none());
    assert_eq!(status.last_exit, Some(ExitOutcome::signal(libc::SIGTERM)));
}
