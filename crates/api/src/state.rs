//! Application state for the API server.

use relay_coordinator::{Coordinator, CoordinatorConfig};
use std::sync::Arc;

/// Deployment name the relay answers to by default.
pub const DEFAULT_DEPLOYMENT: &str = "mas-coordinator";

/// Shared application state for the API server.
pub struct AppState {
    /// The coordinator that answers every turn
    pub coordinator: Arc<Coordinator>,

    /// Deployment name served under `/openai/deployments/{deployment}`
    pub deployment: String,

    /// Server start time (for health checks)
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Create new application state with the given coordinator configuration.
    pub fn new(config: CoordinatorConfig) -> relay_common::Result<Self> {
        Ok(Self::with_coordinator(Coordinator::new(config)?))
    }

    pub fn with_coordinator(coordinator: Coordinator) -> Self {
        Self {
            coordinator: Arc::new(coordinator),
            deployment: DEFAULT_DEPLOYMENT.to_string(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_deployment(mut self, deployment: impl Into<String>) -> Self {
        self.deployment = deployment.into();
        self
    }

    /// Get the uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
