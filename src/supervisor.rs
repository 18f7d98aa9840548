//! The supervisor: owns every managed service, the connection registry, the
//! router and the control listener.
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, SupervisorSettings},
    error::CorralError,
    health::{HealthCheck, HealthCheckResult},
    process::{LaunchContext, Launcher, OsLauncher},
    registry::ConnectionRegistry,
    router::MessageRouter,
    server::ControlServer,
    service::{ServiceRunner, ServiceStatus, ServiceTable},
    spec::ServiceSpec,
};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const HEALTH_SLEEP_SLICE: Duration = Duration::from_millis(100);

/// One entry of [`Supervisor::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceReport {
    #[serde(flatten)]
    pub status: ServiceStatus,
    /// Whether the service's node is currently connected.
    pub connected: bool,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    specs: Mutex<Vec<Arc<ServiceSpec>>>,
    services: ServiceTable,
    registry: Arc<ConnectionRegistry>,
    router: Arc<MessageRouter>,
    health: HealthCheck,
    launcher: Arc<dyn Launcher>,
    started: AtomicBool,
    health_active: Arc<AtomicBool>,
    health_handle: Mutex<Option<JoinHandle<()>>>,
    server: Mutex<Option<ControlServer>>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings, launcher: Arc<dyn Launcher>) -> Self {
        let services = ServiceTable::new();
        let registry = Arc::new(ConnectionRegistry::new(services.clone()));
        let router = Arc::new(MessageRouter::new(Arc::clone(&registry)));
        let health = HealthCheck::new(Arc::clone(&registry));
        Self {
            settings,
            specs: Mutex::new(Vec::new()),
            services,
            registry,
            router,
            health,
            launcher,
            started: AtomicBool::new(false),
            health_active: Arc::new(AtomicBool::new(false)),
            health_handle: Mutex::new(None),
            server: Mutex::new(None),
        }
    }

    /// Supervisor that launches real processes.
    pub fn from_settings(settings: SupervisorSettings) -> Self {
        Self::new(settings, Arc::new(OsLauncher))
    }

    /// Builds a supervisor from a loaded config and registers its services.
    pub fn from_config(config: &Config) -> Result<Self, CorralError> {
        let supervisor = Self::from_settings(config.settings());
        for spec in &config.services {
            supervisor.register_service(spec.clone())?;
        }
        Ok(supervisor)
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn service(&self, name: &str) -> Option<ServiceRunner> {
        self.services.get(name)
    }

    /// Adds a service to start with [`Supervisor::start_all`].
    ///
    /// Registration after `start_all` is ignored with a warning.
    pub fn register_service(&self, spec: ServiceSpec) -> Result<(), CorralError> {
        if self.started.load(Ordering::SeqCst) {
            warn!(
                "Ignoring registration of service '{}': services already started",
                spec.name()
            );
            return Ok(());
        }

        spec.validate()?;
        let mut specs = self.specs.lock()?;
        if specs.iter().any(|existing| existing.name() == spec.name()) {
            return Err(CorralError::DuplicateService(spec.name().to_string()));
        }
        debug!("Registered service '{}'", spec.name());
        specs.push(Arc::new(spec));
        Ok(())
    }

    /// Binds the control listener and returns its address.
    ///
    /// Calling it again returns the address already bound.
    pub fn serve(&self) -> Result<SocketAddr, CorralError> {
        let mut server = self.server.lock()?;
        if let Some(existing) = server.as_ref() {
            return Ok(existing.local_addr());
        }

        let host: std::net::IpAddr = self.settings.host.parse().map_err(|_| {
            CorralError::Protocol(format!("invalid listen host '{}'", self.settings.host))
        })?;
        let bound = ControlServer::bind((host, self.settings.port), Arc::clone(&self.router))?;
        let addr = bound.local_addr();
        *server = Some(bound);
        Ok(addr)
    }

    /// Address of the control listener, once [`Supervisor::serve`] has run.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server
            .lock()
            .ok()
            .and_then(|server| server.as_ref().map(ControlServer::local_addr))
    }

    /// Starts every registered service in registration order, pausing for the
    /// configured stagger between launches. Runs once.
    pub fn start_all(&self) -> Result<(), CorralError> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Services already started");
            return Ok(());
        }

        let context = Arc::new(self.launch_context());
        let specs = self.specs.lock()?.clone();
        info!(
            "Starting {} service(s); control channel at {}:{}",
            specs.len(),
            context.host,
            context.port
        );

        for (index, spec) in specs.iter().enumerate() {
            if index > 0 && !self.settings.stagger.is_zero() {
                thread::sleep(self.settings.stagger);
            }
            let runner = ServiceRunner::new(
                Arc::clone(spec),
                Arc::clone(&self.launcher),
                Arc::clone(&context),
            );
            self.services.insert(runner.clone());
            if let Err(err) = runner.start() {
                error!("Failed to start service '{}': {err}", spec.name());
            }
        }
        Ok(())
    }

    /// Stops the health loop and every service. Restarts already scheduled
    /// will not fire.
    pub fn stop_all(&self) {
        self.stop_health_check_loop();
        for runner in self.services.runners() {
            if let Err(err) = runner.stop() {
                error!("{err}");
            }
        }
    }

    /// Waits until no service has a live process.
    ///
    /// On timeout, remaining processes are killed and `false` is returned.
    pub fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let running: Vec<_> = self
                .services
                .runners()
                .into_iter()
                .filter(ServiceRunner::has_process)
                .collect();
            if running.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                for runner in running {
                    if let Err(err) = runner.force_kill() {
                        error!("{err}");
                    }
                }
                return false;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Starts the background health reconciliation loop.
    pub fn health_check_loop(&self) -> Result<(), CorralError> {
        let mut handle = self.health_handle.lock()?;
        if handle.is_some() {
            return Ok(());
        }

        self.health_active.store(true, Ordering::SeqCst);
        let active = Arc::clone(&self.health_active);
        let services = self.services.clone();
        let health = self.health.clone();
        let interval = self.settings.health_check_interval;

        *handle = Some(thread::spawn(move || {
            debug!("Health check loop running every {interval:?}");
            while active.load(Ordering::SeqCst) {
                let wake_at = Instant::now() + interval;
                while active.load(Ordering::SeqCst) && Instant::now() < wake_at {
                    thread::sleep(
                        HEALTH_SLEEP_SLICE.min(wake_at.saturating_duration_since(Instant::now())),
                    );
                }
                if !active.load(Ordering::SeqCst) {
                    break;
                }
                reconcile_health(&services, &health);
            }
            debug!("Health check loop stopped");
        }));
        Ok(())
    }

    /// Runs one health reconciliation pass and returns what it observed.
    pub fn run_health_check(&self) -> Vec<(String, HealthCheckResult)> {
        reconcile_health(&self.services, &self.health)
    }

    /// Snapshot of every started service, keyed by name.
    pub fn status(&self) -> Result<BTreeMap<String, ServiceReport>, CorralError> {
        let mut report = BTreeMap::new();
        for runner in self.services.runners() {
            let status = runner.status()?;
            report.insert(
                runner.name().to_string(),
                ServiceReport {
                    status,
                    connected: self.registry.is_connected(runner.name()),
                },
            );
        }
        Ok(report)
    }

    /// Blocks until `name` has a connected node.
    pub fn wait_for_service(
        &self,
        name: &str,
        timeout: Duration,
        poll: Duration,
    ) -> Result<(), CorralError> {
        self.wait_for_names(&[name.to_string()], timeout, poll)
    }

    /// Blocks until every registered service has a connected node.
    pub fn wait_for_all_services(&self, timeout: Duration, poll: Duration) -> Result<(), CorralError> {
        let names: Vec<String> = self
            .specs
            .lock()?
            .iter()
            .map(|spec| spec.name().to_string())
            .collect();
        self.wait_for_names(&names, timeout, poll)
    }

    /// Stops everything, waits for exits, closes the listener.
    ///
    /// Returns whether every process exited without being killed.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        info!("Shutting down supervisor");
        self.stop_all();
        let clean = self.wait_for_exit(timeout);
        if !clean {
            warn!("Some services had to be killed after {timeout:?}");
        }
        match self.server.lock() {
            Ok(mut server) => {
                if let Some(mut server) = server.take() {
                    server.shutdown();
                }
            }
            Err(err) => error!("Failed to close control listener: {err}"),
        }
        clean
    }

    fn wait_for_names(
        &self,
        names: &[String],
        timeout: Duration,
        poll: Duration,
    ) -> Result<(), CorralError> {
        let deadline = Instant::now() + timeout;
        loop {
            let pending: Vec<String> = names
                .iter()
                .filter(|name| !self.registry.is_connected(name))
                .cloned()
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(CorralError::ServiceUnavailable {
                    services: pending,
                    timeout,
                });
            }
            thread::sleep(poll);
        }
    }

    fn launch_context(&self) -> LaunchContext {
        let port = self
            .local_addr()
            .map_or(self.settings.port, |addr| addr.port());
        LaunchContext {
            host: self.settings.host.clone(),
            port,
            logs_dir: self.settings.logs_dir.clone(),
        }
    }

    fn stop_health_check_loop(&self) {
        self.health_active.store(false, Ordering::SeqCst);
        let handle = self
            .health_handle
            .lock()
            .map(|mut handle| handle.take())
            .unwrap_or_default();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!("Health check thread panicked");
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.health_active.store(false, Ordering::SeqCst);
    }
}

fn reconcile_health(services: &ServiceTable, health: &HealthCheck) -> Vec<(String, HealthCheckResult)> {
    let mut results = Vec::new();
    for runner in services.runners() {
        let name = runner.name().to_string();
        let was_healthy = runner.healthy();
        let result = health.check(&runner);
        if result.skipped {
            results.push((name, result));
            continue;
        }

        let update = if result.healthy {
            if !was_healthy {
                info!("Service '{name}' is now healthy");
                runner.mark_healthy()
            } else {
                Ok(())
            }
        } else {
            if was_healthy {
                warn!("Service '{name}' became unhealthy ({})", result.reason);
            }
            runner.mark_unhealthy(result.reason)
        };
        if let Err(err) = update {
            error!("Failed to record health of service '{name}': {err}");
        }
        results.push((name, result));
    }
    results
}
