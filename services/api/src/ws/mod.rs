//! WebSocket Session Bridge
//!
//! Each browser connection gets its own call session. The browser hosts the
//! voice provider SDK, so provider commands travel out over the socket and
//! provider events travel back in:
//!
//! - `protocol`: Defines the JSON-based message format for client-server communication.
//! - `session`: Manages the WebSocket connection lifecycle, from handshake to termination.
//! - `provider`: A `VoiceProvider` that forwards commands to the connected browser.

pub mod protocol;
mod provider;
pub mod session;

pub use session::ws_handler;
