//! Immutable service definitions.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::{error::CorralError, process::ExitOutcome};

/// Default number of automatic restarts before a service is marked failed.
pub const DEFAULT_MAX_RESTARTS: u32 = 10;

/// Default health-check method name advertised by managed services.
pub const DEFAULT_HEALTH_CHECK: &str = "health";

/// Decides whether a service comes back after its process exits.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumString,
    AsRefStr,
    Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RestartPolicy {
    /// Restart after every exit, clean or not.
    Always,
    /// Restart only when the process failed.
    #[default]
    #[serde(alias = "on-failure")]
    #[strum(to_string = "on_failure", serialize = "on-failure")]
    OnFailure,
    /// Never restart.
    Never,
}

impl RestartPolicy {
    /// Returns whether an exit with the given outcome warrants a restart.
    ///
    /// Signal termination counts as a failure.
    pub fn should_restart(&self, exit: &ExitOutcome) -> bool {
        match self {
            RestartPolicy::Never => false,
            RestartPolicy::Always => true,
            RestartPolicy::OnFailure => !exit.success(),
        }
    }
}

/// Static description of one managed service.
///
/// Built once, validated at registration and never mutated afterwards. Every
/// runtime record shares the same instance behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    name: String,
    command: Vec<String>,
    #[serde(default)]
    restart_policy: RestartPolicy,
    #[serde(default = "default_max_restarts")]
    max_restarts: u32,
    #[serde(default = "default_health_check", rename = "health_check")]
    health_check_name: String,
    #[serde(default = "default_true")]
    health_check_enabled: bool,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

fn default_max_restarts() -> u32 {
    DEFAULT_MAX_RESTARTS
}

fn default_health_check() -> String {
    DEFAULT_HEALTH_CHECK.to_string()
}

fn default_true() -> bool {
    true
}

impl ServiceSpec {
    /// Creates a spec with the default policy (`on_failure`, 10 restarts).
    pub fn new<I, S>(name: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            command: command.into_iter().map(Into::into).collect(),
            restart_policy: RestartPolicy::default(),
            max_restarts: DEFAULT_MAX_RESTARTS,
            health_check_name: default_health_check(),
            health_check_enabled: true,
            env: BTreeMap::new(),
        }
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_health_check(mut self, name: impl Into<String>) -> Self {
        self.health_check_name = name.into();
        self
    }

    pub fn with_health_check_enabled(mut self, enabled: bool) -> Self {
        self.health_check_enabled = enabled;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Unique service name; also the node name used on the control channel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Program followed by its arguments.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }

    /// Name of the health method the service exposes to external callers.
    pub fn health_check_name(&self) -> &str {
        &self.health_check_name
    }

    pub fn health_check_enabled(&self) -> bool {
        self.health_check_enabled
    }

    /// Extra environment variables injected at launch.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Checks the invariants every registered spec must hold.
    pub fn validate(&self) -> Result<(), CorralError> {
        if self.name.trim().is_empty() {
            return Err(CorralError::invalid_spec(&self.name, "name must not be empty"));
        }
        if self.name == crate::message::MASTER {
            return Err(CorralError::invalid_spec(
                &self.name,
                "name is reserved for the supervisor",
            ));
        }
        match self.command.first() {
            None => Err(CorralError::invalid_spec(
                &self.name,
                "command must not be empty",
            )),
            Some(program) if program.trim().is_empty() => Err(CorralError::invalid_spec(
                &self.name,
                "command program must not be blank",
            )),
            Some(_) => Ok(()),
        }
    }
}
