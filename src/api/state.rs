//! Application state shared across handlers.

use std::sync::Arc;

use crate::session::SessionManager;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session manager owning the live agent fleet.
    pub sessions: Arc<SessionManager>,
}

impl AppState {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}
