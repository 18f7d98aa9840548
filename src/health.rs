//! Connection-based liveness.
//!
//! A service counts as healthy while its node is connected. The configured
//! health-check name is only a convention for external callers.
use std::sync::Arc;

use serde::Serialize;

use crate::{registry::ConnectionRegistry, service::ServiceRunner};

/// Outcome of checking one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthCheckResult {
    pub healthy: bool,
    /// The service opted out of health checks; `healthy` is its last known value.
    pub skipped: bool,
    pub reason: &'static str,
}

#[derive(Clone)]
pub struct HealthCheck {
    registry: Arc<ConnectionRegistry>,
}

impl HealthCheck {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn check(&self, runner: &ServiceRunner) -> HealthCheckResult {
        if !runner.spec().health_check_enabled() {
            return HealthCheckResult {
                healthy: runner.healthy(),
                skipped: true,
                reason: "disabled",
            };
        }

        if self.registry.is_connected(runner.name()) {
            HealthCheckResult {
                healthy: true,
                skipped: false,
                reason: "connected",
            }
        } else {
            HealthCheckResult {
                healthy: false,
                skipped: false,
                reason: "disconnected",
            }
        }
    }
}
