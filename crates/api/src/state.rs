//! Shared application state for the Axum API server.

use std::sync::Arc;

use courier_engine::manager::RunManager;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub broadcasts: Arc<RunManager>,
}

impl AppState {
    pub fn new(broadcasts: RunManager) -> Self {
        Self {
            broadcasts: Arc::new(broadcasts),
        }
    }
}
