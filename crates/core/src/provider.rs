//! Voice Provider Capability
//!
//! The session manager does not capture or play audio itself. It drives a
//! third-party provider through the [`VoiceProvider`] trait and consumes the
//! provider's lifecycle, speech and transcript notifications as a single
//! ordered stream of [`ProviderEvent`]s.

use crate::{
    context::SessionConfig,
    error::RawProviderError,
    transcript::TranscriptRole,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{future::Future, pin::Pin};
use tokio::sync::mpsc;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Capacity of the provider event channel created by [`event_channel`].
pub const PROVIDER_EVENT_BUFFER: usize = 128;

/// Completion of a provider `start` request. Success only means the request
/// was accepted; the call becomes active on [`ProviderEvent::CallStart`].
pub type StartFuture = Pin<Box<dyn Future<Output = Result<(), RawProviderError>> + Send>>;

/// A real-time voice session provider.
///
/// Only the session task holds the provider, so implementations need not be
/// shareable. `stop` must be idempotent.
#[cfg_attr(test, automock)]
pub trait VoiceProvider: Send {
    /// Asks the provider to dial the configured agent.
    fn start(&mut self, config: &SessionConfig) -> StartFuture;
    /// Hangs up. Fire-and-forget.
    fn stop(&mut self);
    /// Mutes or unmutes the local microphone.
    fn set_muted(&mut self, muted: bool);
    /// Sends an application message into the live call.
    fn send(&mut self, message: Value);
}

/// Creates the channel a provider uses to deliver its events to a session.
pub fn event_channel() -> (mpsc::Sender<ProviderEvent>, mpsc::Receiver<ProviderEvent>) {
    mpsc::channel(PROVIDER_EVENT_BUFFER)
}

/// Granularity of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    Partial,
    Final,
}

/// A tool invocation requested by the remote agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Typed view of a provider `message` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProviderMessage {
    Transcript {
        #[serde(rename = "transcriptType")]
        transcript_type: TranscriptKind,
        role: TranscriptRole,
        transcript: String,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: FunctionCall,
        #[serde(rename = "functionCallId", default)]
        function_call_id: Option<String>,
    },
    #[serde(other)]
    Other,
}

impl ProviderMessage {
    /// Parses a message payload. Payloads this crate does not understand
    /// become [`ProviderMessage::Other`].
    pub fn from_value(payload: Value) -> Self {
        match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Unrecognised provider message payload");
                ProviderMessage::Other
            }
        }
    }
}

/// One notification from the voice provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    CallStart,
    CallEnd,
    SpeechStart,
    SpeechEnd,
    VolumeLevel(f32),
    Message(ProviderMessage),
    Error(RawProviderError),
}

impl ProviderEvent {
    /// Builds an event from the provider SDK's event name and payload, e.g.
    /// `("volume-level", 0.4)` or `("message", {...})`.
    ///
    /// Returns `None` for event names the session does not consume.
    pub fn from_wire(event: &str, payload: Value) -> Option<Self> {
        let event = match event {
            "call-start" => ProviderEvent::CallStart,
            "call-end" => ProviderEvent::CallEnd,
            "speech-start" => ProviderEvent::SpeechStart,
            "speech-end" => ProviderEvent::SpeechEnd,
            "volume-level" => ProviderEvent::VolumeLevel(payload.as_f64().unwrap_or(0.0) as f32),
            "message" => ProviderEvent::Message(ProviderMessage::from_value(payload)),
            "error" => ProviderEvent::Error(RawProviderError::from_value(&payload)),
            other => {
                debug!(event = %other, "Ignoring unknown provider event");
                return None;
            }
        };
        Some(event)
    }
}
