//! Axum Router Configuration
//!
//! This module defines the HTTP routing for the service: the WebSocket
//! endpoint that hosts call sessions and a health check.

use crate::{handlers, state::AppState, ws::ws_handler};

use axum::{Router, routing::get};
use std::sync::Arc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let session_router = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .route("/health", get(handlers::health))
        .merge(session_router)
}
