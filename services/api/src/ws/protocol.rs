//! Defines the WebSocket message protocol between the browser client and the API server.

use agrivoice_core::session::SessionSnapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from the client (browser) to the server.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens the session. This must be the first message.
    Init {
        /// The signed-in user's backend token, if any.
        #[serde(default)]
        token: Option<String>,
    },
    StartCall,
    EndCall,
    ClearTranscript,
    SetMuted {
        muted: bool,
    },
    /// A typed question, answered without a voice call.
    SendText {
        text: String,
    },
    /// Retries loading credentials after a failed initialization.
    RetryInit,
    /// A notification raised by the provider SDK running in the browser.
    ProviderEvent {
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

impl ClientMessage {
    /// Message name for logs. Never includes the payload.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Init { .. } => "init",
            ClientMessage::StartCall => "start_call",
            ClientMessage::EndCall => "end_call",
            ClientMessage::ClearTranscript => "clear_transcript",
            ClientMessage::SetMuted { .. } => "set_muted",
            ClientMessage::SendText { .. } => "send_text",
            ClientMessage::RetryInit => "retry_init",
            ClientMessage::ProviderEvent { .. } => "provider_event",
        }
    }
}

/// Messages sent from the server to the client (browser).
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The full session state after a change.
    Snapshot { snapshot: SessionSnapshot },
    /// An instruction for the provider SDK running in the browser.
    ProviderCommand { command: ProviderCommand },
    /// Reports a protocol error to the client.
    Error { message: String },
}

/// Provider operations the browser performs on the session's behalf.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderCommand {
    Start {
        #[serde(rename = "providerKey")]
        provider_key: String,
        #[serde(rename = "agentId")]
        agent_id: String,
    },
    Stop,
    SetMuted {
        muted: bool,
    },
    Send {
        message: Value,
    },
}
