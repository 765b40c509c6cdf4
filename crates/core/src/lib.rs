//! Voice call session management for the farm assistant.
//!
//! A [`session::CallSession`] mediates between a UI, a third-party real-time
//! voice provider and the application backend. Lifecycle rules live in the
//! pure [`machine::transition`] reducer; the session task only executes the
//! effects it returns.

pub mod backend;
pub mod context;
pub mod error;
pub mod machine;
pub mod provider;
pub mod session;
pub mod timeout;
pub mod transcript;

pub use backend::{BackendClient, SessionBackend, StaticToken, TokenProvider};
pub use context::{SessionConfig, SessionProfile, UserContext};
pub use error::{ErrorKind, RawProviderError, SessionClosed, SessionError};
pub use machine::CallState;
pub use provider::{ProviderEvent, VoiceProvider};
pub use session::{CallSession, SessionHandle, SessionIntent, SessionSettings, SessionSnapshot};
