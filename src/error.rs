//! Error handling for corral.
use std::time::Duration;

use thiserror::Error;

/// Defines all possible errors raised by the supervisor and its components.
#[derive(Debug, Error)]
pub enum CorralError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigRead(#[source] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// A referenced environment variable is not set.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// A service definition failed validation.
    #[error("Invalid service '{service}': {reason}")]
    InvalidSpec {
        /// Name of the offending service (may be empty).
        service: String,
        /// Human-readable reason.
        reason: String,
    },

    /// Two services were registered under the same name.
    #[error("Service '{0}' is already registered")]
    DuplicateService(String),

    /// Error spawning a service process.
    #[error("Failed to start service '{service}': {source}")]
    ServiceStart {
        /// The service name that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error signalling a service process.
    #[error("Failed to stop service '{service}': {source}")]
    ServiceStop {
        /// The service name that failed to stop.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error encoding or decoding a control message.
    #[error("Failed to encode or decode control message: {0}")]
    Codec(#[from] serde_json::Error),

    /// Control connection or listener I/O failed.
    #[error("Control channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Attempted to send to a node that is unknown or disconnected.
    #[error("Node '{0}' is not connected")]
    NodeNotConnected(String),

    /// One or more services did not connect before the deadline.
    #[error("Service(s) {services:?} did not connect within {timeout:?}")]
    ServiceUnavailable {
        /// Services that were still not connected.
        services: Vec<String>,
        /// How long we waited.
        timeout: Duration,
    },

    /// A peer sent a message that breaks the control protocol.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// An environment substitution pattern failed to compile.
    #[error("Invalid substitution pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoison(String),
}

impl<T> From<std::sync::PoisonError<T>> for CorralError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        CorralError::MutexPoison(err.to_string())
    }
}

impl CorralError {
    pub(crate) fn invalid_spec(service: &str, reason: impl Into<String>) -> Self {
        CorralError::InvalidSpec {
            service: service.to_string(),
            reason: reason.into(),
        }
    }
}
