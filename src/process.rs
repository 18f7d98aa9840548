//! Process launching and signalling.
//!
//! [`Launcher`] is the seam between the supervisor's state machine and the
//! operating system. [`OsLauncher`] spawns real processes; tests plug in a
//! scripted launcher instead.
use std::{
    fmt,
    fs::{self, OpenOptions},
    io,
    os::unix::process::{CommandExt, ExitStatusExt},
    path::PathBuf,
    process::{Command, ExitStatus, Stdio},
    sync::mpsc,
    thread,
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde::Serialize;
use tracing::{debug, error};

use crate::{logs::service_log_path, spec::ServiceSpec};

/// Environment variable carrying the host of the control listener.
pub const ENV_HOST: &str = "CORRAL_HOST";
/// Environment variable carrying the port of the control listener.
pub const ENV_PORT: &str = "CORRAL_PORT";
/// Environment variable carrying the name the process must handshake with.
pub const ENV_SERVICE_NAME: &str = "CORRAL_SERVICE_NAME";

/// Synthetic exit code reported when a process could not be spawned.
pub const SPAWN_FAILURE_CODE: i32 = 127;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Outcome recorded when the launch itself failed.
    pub fn spawn_failure() -> Self {
        Self::code(SPAWN_FAILURE_CODE)
    }

    /// Outcome recorded when the exit status could not be observed.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }

    /// Only a plain exit with code 0 counts as success.
    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Values every launched process receives in its environment.
#[derive(Debug, Clone)]
pub struct LaunchContext {
    /// Host the control listener is reachable on.
    pub host: String,
    /// Port the control listener is bound to.
    pub port: u16,
    /// Directory where per-service log files are written.
    pub logs_dir: PathBuf,
}

/// Handle to a running process, owned by its managed service.
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    /// OS process id, if the process has one.
    fn pid(&self) -> Option<u32>;

    /// Requests a graceful shutdown (SIGTERM).
    fn terminate(&self) -> io::Result<()>;

    /// Forcefully ends the process (SIGKILL).
    fn kill(&self) -> io::Result<()>;
}

/// A freshly launched process: its handle plus the channel its exit arrives on.
pub struct Spawned {
    pub handle: Box<dyn ProcessHandle>,
    pub exit: mpsc::Receiver<ExitOutcome>,
}

/// Starts processes for service specs.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &ServiceSpec, context: &LaunchContext) -> io::Result<Spawned>;
}

/// Launches services as real child processes.
///
/// Each child runs in its own process group with stdout and stderr appended
/// to `<logs_dir>/<name>.log`. A dedicated thread owns the [`std::process::Child`],
/// reaps it and reports the exit on the returned channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl Launcher for OsLauncher {
    fn launch(&self, spec: &ServiceSpec, context: &LaunchContext) -> io::Result<Spawned> {
        let name = spec.name().to_string();
        let (program, args) = spec.command().split_first().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "empty command")
        })?;

        fs::create_dir_all(&context.logs_dir)?;
        let log_path = service_log_path(&context.logs_dir, &name);
        let log_file = OpenOptions::new().create(true).append(true).open(&log_path)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file))
            .env(ENV_HOST, &context.host)
            .env(ENV_PORT, context.port.to_string())
            .env(ENV_SERVICE_NAME, &name)
            .envs(spec.env());

        unsafe {
            cmd.pre_exec(|| {
                // Own process group so a stop reaches the whole tree without
                // touching the supervisor's group.
                if libc::setpgid(0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }

                #[cfg(target_os = "linux")]
                {
                    use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
                    if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }

        // PR_SET_PDEATHSIG fires when the spawning thread exits, so the thread
        // that spawns the child is the one that waits on it.
        let (started_tx, started_rx) = mpsc::channel();
        let (tx, rx) = mpsc::channel();
        let waiter_name = name.clone();
        thread::Builder::new()
            .name(format!("corral-{name}"))
            .spawn(move || {
                debug!("Executing command for '{waiter_name}': {cmd:?}");
                let mut child = match cmd.spawn() {
                    Ok(child) => child,
                    Err(err) => {
                        let _ = started_tx.send(Err(err));
                        return;
                    }
                };
                let pid = child.id();
                let _ = started_tx.send(Ok(pid));

                let outcome = match child.wait() {
                    Ok(status) => ExitOutcome::from_status(status),
                    Err(err) => {
                        error!("Failed to wait on service '{waiter_name}' (PID {pid}): {err}");
                        ExitOutcome::unknown()
                    }
                };
                let _ = tx.send(outcome);
            })?;

        let pid = started_rx.recv().map_err(|_| {
            io::Error::other(format!("launcher thread for '{name}' exited before spawning"))
        })??;
        debug!("Service '{name}' started with PID {pid}, logging to {log_path:?}");

        Ok(Spawned {
            handle: Box::new(OsProcess { pid, name }),
            exit: rx,
        })
    }
}

/// A child process started by [`OsLauncher`].
#[derive(Debug)]
pub struct OsProcess {
    pid: u32,
    name: String,
}

impl OsProcess {
    fn signal(&self, sig: Signal) -> io::Result<()> {
        let pid = Pid::from_raw(self.pid as i32);
        let supervisor_pgid = unsafe { libc::getpgid(0) };
        let child_pgid = unsafe { libc::getpgid(pid.as_raw()) };

        if child_pgid >= 0 && child_pgid != supervisor_pgid {
            match signal::killpg(Pid::from_raw(child_pgid), sig) {
                Ok(()) => debug!(
                    "Sent {sig} to process group {child_pgid} for service '{}'",
                    self.name
                ),
                Err(Errno::ESRCH) => debug!(
                    "Process group for service '{}' missing; falling back to direct signal",
                    self.name
                ),
                Err(err) => debug!(
                    "Failed to signal process group {child_pgid} of '{}': {err}",
                    self.name
                ),
            }
        }

        match signal::kill(pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(io::Error::from_raw_os_error(err as i32)),
        }
    }
}

impl ProcessHandle for OsProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn terminate(&self) -> io::Result<()> {
        self.signal(Signal::SIGTERM)
    }

    fn kill(&self) -> io::Result<()> {
        self.signal(Signal::SIGKILL)
    }
}
