//! Shared state for the monitoring handlers.

use std::sync::Arc;
use std::time::Duration;

use questvault_db::Runtime;

/// Default deadline for a monitoring request to reach the backend.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// State handed to every handler.
pub struct AppState {
    /// The persistence stack being monitored.
    pub runtime: Arc<Runtime>,
    /// Deadline for backend calls made by a handler.
    pub request_timeout: Duration,
}

impl AppState {
    /// State over `runtime` with the default request deadline.
    pub const fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the request deadline.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
