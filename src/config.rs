//! Configuration management for corral.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::HashSet,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{error::CorralError, spec::ServiceSpec};

/// Config file used when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "corral.yaml";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3030;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_STAGGER_MS: u64 = 100;
pub const DEFAULT_LOGS_DIR: &str = "logs";

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// Control listener port. `0` picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Delay between consecutive service starts.
    #[serde(default = "default_stagger_ms")]
    pub stagger_ms: u64,
    /// Where service and supervisor logs go. Relative paths are resolved
    /// against the config file's directory.
    pub logs_dir: Option<PathBuf>,
    /// Services in start order.
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    /// Directory containing the config file.
    #[serde(skip)]
    pub project_dir: PathBuf,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_health_check_interval_ms() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL_MS
}

fn default_stagger_ms() -> u64 {
    DEFAULT_STAGGER_MS
}

impl Config {
    /// Runtime settings derived from this file.
    pub fn settings(&self) -> SupervisorSettings {
        let logs_dir = match &self.logs_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.project_dir.join(dir),
            None => self.project_dir.join(DEFAULT_LOGS_DIR),
        };
        SupervisorSettings {
            host: DEFAULT_HOST.to_string(),
            port: self.port,
            health_check_interval: Duration::from_millis(self.health_check_interval_ms),
            stagger: Duration::from_millis(self.stagger_ms),
            logs_dir,
        }
    }
}

/// Knobs the supervisor runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorSettings {
    pub host: String,
    pub port: u16,
    pub health_check_interval: Duration,
    pub stagger: Duration,
    pub logs_dir: PathBuf,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            health_check_interval: Duration::from_millis(DEFAULT_HEALTH_CHECK_INTERVAL_MS),
            stagger: Duration::from_millis(DEFAULT_STAGGER_MS),
            logs_dir: PathBuf::from(DEFAULT_LOGS_DIR),
        }
    }
}

/// Expands `$VAR` and `${VAR}` references within a string.
fn expand_env_vars(input: &str) -> Result<String, CorralError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")?;
    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(var_name) => Err(CorralError::MissingEnvVar(var_name)),
        None => Ok(result.into_owned()),
    }
}

/// Loads and parses the configuration file, expanding environment variables
/// and validating every service.
pub fn load_config(config_path: Option<&str>) -> Result<Config, CorralError> {
    let config_path = Path::new(config_path.unwrap_or(DEFAULT_CONFIG_FILE));

    let content = fs::read_to_string(config_path).map_err(|e| {
        CorralError::ConfigRead(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded_content = expand_env_vars(&content)?;
    let mut config: Config = serde_yaml::from_str(&expanded_content)?;

    config.project_dir = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let mut seen = HashSet::new();
    for spec in &config.services {
        spec.validate()?;
        if !seen.insert(spec.name()) {
            return Err(CorralError::DuplicateService(spec.name().to_string()));
        }
    }

    Ok(config)
}
