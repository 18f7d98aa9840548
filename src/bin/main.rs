use std::{
    error::Error,
    fmt,
    sync::{Mutex, mpsc},
    time::Duration,
};

use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter,
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

use corral::{
    cli::{Cli, parse_args},
    config::load_config,
    logs::{open_supervisor_log, supervisor_log_path},
    supervisor::Supervisor,
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    let mut config = load_config(Some(args.config.as_str()))?;
    if let Some(port) = args.port {
        config.port = port;
    }
    init_logging(&args, &config.settings().logs_dir);

    let supervisor = Supervisor::from_config(&config)?;
    let addr = supervisor.serve()?;
    info!("corral listening on {addr}");

    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })?;

    supervisor.start_all()?;
    supervisor.health_check_loop()?;

    if shutdown_rx.recv().is_err() {
        warn!("Signal handler went away; shutting down");
    }
    info!("corral is shutting down");

    let clean = supervisor.shutdown(Duration::from_millis(args.shutdown_timeout_ms));
    if !clean {
        error!("Not every service exited within {}ms", args.shutdown_timeout_ms);
    }
    Ok(())
}

struct UtcTimer;

impl FormatTime for UtcTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"))
    }
}

fn env_filter(args: &Cli) -> EnvFilter {
    if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn init_logging(args: &Cli, logs_dir: &std::path::Path) {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTimer)
        .with_writer(std::io::stderr);

    match open_supervisor_log(logs_dir) {
        Ok(file) => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_timer(UtcTimer)
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            let _ = tracing_subscriber::registry()
                .with(env_filter(args))
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
        }
        Err(err) => {
            let _ = tracing_subscriber::registry()
                .with(env_filter(args))
                .with(stderr_layer)
                .try_init();
            warn!(
                "Cannot write supervisor log {:?}: {err}",
                supervisor_log_path(logs_dir)
            );
        }
    }
}
