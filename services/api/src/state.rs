//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the shared,
//! clonable resources every WebSocket session needs.

use crate::config::Config;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Pooled client for backend calls, built with the configured request timeout.
    pub http: reqwest::Client,
}
