//! Application state shared across handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::session::SessionService;

#[derive(Clone, Debug)]
pub struct AppState {
    pub service: Arc<SessionService>,
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
    /// Cancelled on server shutdown; ends long-lived feeds.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(service: Arc<SessionService>) -> Self {
        Self {
            service,
            cors_origins: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = origins;
        self
    }
}
