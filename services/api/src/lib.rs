//! Voice Session API Library Crate
//!
//! Bridges browser clients to call sessions over WebSockets. The browser runs
//! the voice provider SDK; this service owns the session state, talks to the
//! application backend and tells the browser what to do next. The `api`
//! binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;
