//! Runtime state of each supervised service.
//!
//! [`ManagedService`] is the synchronous state machine: it decides what an
//! exit means, tracks backoff and health, and owns the process handle.
//! [`ServiceRunner`] wraps it in a mutex and does the threaded work around it:
//! launching, waiting for exits and scheduling delayed restarts.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock, mpsc},
    thread,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use strum_macros::{AsRefStr, Display};
use tracing::{debug, error, info, warn};

use crate::{
    error::CorralError,
    process::{ExitOutcome, LaunchContext, Launcher, ProcessHandle},
    spec::ServiceSpec,
};

/// Delay before the first restart, and the value backoff resets to.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(1_000);

/// Upper bound for the restart delay.
pub const MAX_BACKOFF: Duration = Duration::from_millis(60_000);

/// Lifecycle position of a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ServiceState {
    Idle,
    Starting,
    Running,
    Exited,
    Restarting,
    Stopped,
    Failed,
}

/// Last health observation for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

/// What the state machine decided after a process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// The service was stopped on purpose; nothing else happens.
    Stopped,
    /// The restart policy does not ask for a restart.
    NotRestarted,
    /// The policy wanted a restart but the budget is spent.
    BudgetExhausted,
    /// Start again after `delay`. `attempt` is the new restart count.
    Restart { delay: Duration, attempt: u32 },
}

/// Point-in-time view of one service, as reported by the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub healthy: bool,
    pub restart_count: u32,
    pub last_start_time: Option<DateTime<Utc>>,
    pub state: ServiceState,
    pub health_state: HealthState,
    pub consecutive_failures: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_exit: Option<ExitOutcome>,
    pub pid: Option<u32>,
    pub backoff_ms: u64,
}

/// Mutable runtime record for one [`ServiceSpec`].
#[derive(Debug)]
pub struct ManagedService {
    spec: Arc<ServiceSpec>,
    process: Option<Box<dyn ProcessHandle>>,
    state: ServiceState,
    restart_count: u32,
    backoff: Duration,
    healthy: bool,
    health_state: HealthState,
    consecutive_failures: u32,
    last_health_check: Option<DateTime<Utc>>,
    stopped: bool,
    last_start: Option<DateTime<Utc>>,
    last_exit: Option<ExitOutcome>,
}

impl ManagedService {
    pub fn new(spec: Arc<ServiceSpec>) -> Self {
        Self {
            spec,
            process: None,
            state: ServiceState::Idle,
            restart_count: 0,
            backoff: INITIAL_BACKOFF,
            healthy: false,
            health_state: HealthState::Unknown,
            consecutive_failures: 0,
            last_health_check: None,
            stopped: false,
            last_start: None,
            last_exit: None,
        }
    }

    pub fn spec(&self) -> &Arc<ServiceSpec> {
        &self.spec
    }

    pub fn name(&self) -> &str {
        self.spec.name()
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn healthy(&self) -> bool {
        self.healthy
    }

    pub fn health_state(&self) -> HealthState {
        self.health_state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }

    pub fn last_start(&self) -> Option<DateTime<Utc>> {
        self.last_start
    }

    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|handle| handle.pid())
    }

    pub fn should_restart(&self, exit: &ExitOutcome) -> bool {
        self.spec.restart_policy().should_restart(exit)
    }

    /// Moves to `Starting` and stamps the start time.
    ///
    /// Returns `false` without touching anything once the service is stopped.
    pub fn begin_start(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        self.state = ServiceState::Starting;
        self.last_start = Some(Utc::now());
        true
    }

    /// Takes ownership of a launched process.
    pub fn attach_process(&mut self, handle: Box<dyn ProcessHandle>) {
        self.process = Some(handle);
        self.state = ServiceState::Running;
    }

    /// Applies an exit to the state machine and returns what should happen next.
    ///
    /// On a restart decision the restart count has already been incremented
    /// and the backoff doubled for the attempt after this one.
    pub fn on_exit(&mut self, exit: ExitOutcome) -> ExitDecision {
        self.process = None;
        self.healthy = false;
        self.last_exit = Some(exit);
        self.state = ServiceState::Exited;

        if self.stopped {
            self.state = ServiceState::Stopped;
            return ExitDecision::Stopped;
        }

        if !self.should_restart(&exit) {
            self.state = ServiceState::Failed;
            return ExitDecision::NotRestarted;
        }

        if self.restart_count >= self.spec.max_restarts() {
            self.state = ServiceState::Failed;
            return ExitDecision::BudgetExhausted;
        }

        self.restart_count += 1;
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
        self.state = ServiceState::Restarting;
        ExitDecision::Restart {
            delay,
            attempt: self.restart_count,
        }
    }

    /// Marks the service stopped and asks a running process to terminate.
    ///
    /// Idempotent. Returns whether a signal was sent.
    pub fn stop(&mut self) -> std::io::Result<bool> {
        self.stopped = true;
        match &self.process {
            Some(handle) => {
                handle.terminate()?;
                Ok(true)
            }
            None => {
                if self.state != ServiceState::Failed {
                    self.state = ServiceState::Stopped;
                }
                Ok(false)
            }
        }
    }

    /// Sends SIGKILL to a process that is still attached.
    pub fn force_kill(&mut self) -> std::io::Result<bool> {
        match &self.process {
            Some(handle) => {
                handle.kill()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn reset_backoff(&mut self) {
        self.backoff = INITIAL_BACKOFF;
        self.restart_count = 0;
    }

    /// Records a healthy observation and forgives past restarts.
    pub fn mark_healthy(&mut self) {
        self.healthy = true;
        self.health_state = HealthState::Healthy;
        self.consecutive_failures = 0;
        self.last_health_check = Some(Utc::now());
        self.reset_backoff();
    }

    /// Records an unhealthy observation.
    pub fn mark_unhealthy(&mut self, reason: &str) {
        debug!("Service '{}' marked unhealthy: {reason}", self.spec.name());
        self.healthy = false;
        self.health_state = HealthState::Unhealthy;
        self.consecutive_failures += 1;
        self.last_health_check = Some(Utc::now());
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            healthy: self.healthy,
            restart_count: self.restart_count,
            last_start_time: self.last_start,
            state: self.state,
            health_state: self.health_state,
            consecutive_failures: self.consecutive_failures,
            last_health_check: self.last_health_check,
            last_exit: self.last_exit,
            pid: self.pid(),
            backoff_ms: self.backoff.as_millis() as u64,
        }
    }
}

/// Shared handle that drives a [`ManagedService`] through real launches.
#[derive(Clone)]
pub struct ServiceRunner {
    spec: Arc<ServiceSpec>,
    inner: Arc<Mutex<ManagedService>>,
    launcher: Arc<dyn Launcher>,
    context: Arc<LaunchContext>,
}

impl ServiceRunner {
    pub fn new(
        spec: Arc<ServiceSpec>,
        launcher: Arc<dyn Launcher>,
        context: Arc<LaunchContext>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManagedService::new(Arc::clone(&spec)))),
            spec,
            launcher,
            context,
        }
    }

    pub fn name(&self) -> &str {
        self.spec.name()
    }

    pub fn spec(&self) -> &Arc<ServiceSpec> {
        &self.spec
    }

    /// Runs `f` with the service locked.
    pub fn with<R>(&self, f: impl FnOnce(&mut ManagedService) -> R) -> Result<R, CorralError> {
        let mut guard = self.inner.lock()?;
        Ok(f(&mut guard))
    }

    /// Launches the process unless the service has been stopped.
    ///
    /// A launch failure is handled as an immediate exit with
    /// [`crate::process::SPAWN_FAILURE_CODE`], so the restart policy applies.
    pub fn start(&self) -> Result<(), CorralError> {
        let name = self.name();
        let exit_rx = {
            let mut managed = self.inner.lock()?;
            if !managed.begin_start() {
                debug!("Service '{name}' is stopped; skipping start");
                return Ok(());
            }

            info!("Starting service '{name}': `{}`", self.spec.command().join(" "));
            match self.launcher.launch(&self.spec, &self.context) {
                Ok(spawned) => {
                    if let Some(pid) = spawned.handle.pid() {
                        info!("Service '{name}' running with PID {pid}");
                    }
                    managed.attach_process(spawned.handle);
                    Some(spawned.exit)
                }
                Err(err) => {
                    let err = CorralError::ServiceStart {
                        service: name.to_string(),
                        source: err,
                    };
                    error!("{err}");
                    None
                }
            }
        };

        match exit_rx {
            Some(rx) => self.watch_exit(rx),
            None => self.handle_exit(ExitOutcome::spawn_failure()),
        }
        Ok(())
    }

    /// Marks the service stopped and signals its process. Idempotent.
    pub fn stop(&self) -> Result<(), CorralError> {
        let name = self.name();
        let signalled = self
            .inner
            .lock()?
            .stop()
            .map_err(|source| CorralError::ServiceStop {
                service: name.to_string(),
                source,
            })?;
        if signalled {
            info!("Stopping service '{name}'");
        } else {
            debug!("Service '{name}' has no running process to stop");
        }
        Ok(())
    }

    /// SIGKILLs a process that is still attached. Returns whether one was.
    pub fn force_kill(&self) -> Result<bool, CorralError> {
        let name = self.name();
        let killed = self
            .inner
            .lock()?
            .force_kill()
            .map_err(|source| CorralError::ServiceStop {
                service: name.to_string(),
                source,
            })?;
        if killed {
            warn!("Service '{name}' did not exit in time; sent SIGKILL");
        }
        Ok(killed)
    }

    pub fn mark_healthy(&self) -> Result<(), CorralError> {
        self.with(|managed| managed.mark_healthy())
    }

    pub fn mark_unhealthy(&self, reason: &str) -> Result<(), CorralError> {
        self.with(|managed| managed.mark_unhealthy(reason))
    }

    pub fn has_process(&self) -> bool {
        self.inner
            .lock()
            .map(|managed| managed.has_process())
            .unwrap_or(false)
    }

    pub fn healthy(&self) -> bool {
        self.inner
            .lock()
            .map(|managed| managed.healthy())
            .unwrap_or(false)
    }

    pub fn status(&self) -> Result<ServiceStatus, CorralError> {
        self.with(|managed| managed.status())
    }

    fn watch_exit(&self, rx: mpsc::Receiver<ExitOutcome>) {
        let runner = self.clone();
        thread::spawn(move || {
            let exit = rx.recv().unwrap_or_else(|_| {
                warn!("Lost exit notification for service '{}'", runner.name());
                ExitOutcome::unknown()
            });
            runner.handle_exit(exit);
        });
    }

    fn handle_exit(&self, exit: ExitOutcome) {
        let name = self.name();
        let decision = match self.inner.lock() {
            Ok(mut managed) => managed.on_exit(exit),
            Err(err) => {
                error!("Cannot record exit of service '{name}': {err}");
                return;
            }
        };

        match decision {
            ExitDecision::Stopped => {
                info!("Service '{name}' exited with {exit} after stop request");
            }
            ExitDecision::NotRestarted => {
                if exit.success() {
                    info!("Service '{name}' exited normally; restart policy does not restart it");
                } else {
                    error!(
                        "Service '{name}' exited with {exit}; restart policy '{}' does not restart it",
                        self.spec.restart_policy()
                    );
                }
            }
            ExitDecision::BudgetExhausted => {
                error!(
                    "Service '{name}' exited with {exit} and has reached maximum restart attempts ({}). Giving up.",
                    self.spec.max_restarts()
                );
            }
            ExitDecision::Restart { delay, attempt } => {
                warn!(
                    "Service '{name}' exited with {exit}. Restarting in {delay:?} (attempt {attempt}/{})",
                    self.spec.max_restarts()
                );
                self.schedule_restart(delay);
            }
        }
    }

    fn schedule_restart(&self, delay: Duration) {
        let runner = self.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            // `start` re-checks the stopped flag under the lock, so a stop
            // issued while we slept wins.
            if let Err(err) = runner.start() {
                error!("Failed to restart service '{}': {err}", runner.name());
            }
        });
    }
}

/// Name-indexed table of every service the supervisor has started.
#[derive(Clone, Default)]
pub struct ServiceTable {
    inner: Arc<RwLock<HashMap<String, ServiceRunner>>>,
}

impl ServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, runner: ServiceRunner) {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(runner.name().to_string(), runner);
    }

    pub fn get(&self, name: &str) -> Option<ServiceRunner> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    /// All runners, sorted by name.
    pub fn runners(&self) -> Vec<ServiceRunner> {
        let mut runners: Vec<_> = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        runners.sort_by(|a, b| a.name().cmp(b.name()));
        runners
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
