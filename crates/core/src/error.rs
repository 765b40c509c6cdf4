//! Session Error Taxonomy
//!
//! Every failure the session manager can report is reduced to one of a fixed
//! set of [`ErrorKind`]s. Loader failures are produced directly by the
//! backend client; provider failures arrive as loosely structured JSON and are
//! mapped by [`classify`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Fallback text shown when a provider error carries no usable message.
const GENERIC_PROVIDER_MESSAGE: &str = "Voice assistant error occurred.";

/// The actionable categories a session failure can fall into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    ConfigurationInvalid,
    NetworkUnavailable,
    NotReady,
    ConnectionTimeout,
    AuthenticationFailed,
    AgentNotFound,
    MicrophonePermissionDenied,
    MicrophoneUnavailable,
    PlatformUnsupported,
    UnknownProviderError,
}

impl ErrorKind {
    /// Errors raised before any call attempt exists. They block `start`
    /// until initialization succeeds.
    pub fn is_preflight(self) -> bool {
        matches!(
            self,
            ErrorKind::Unauthenticated
                | ErrorKind::ConfigurationInvalid
                | ErrorKind::NetworkUnavailable
                | ErrorKind::NotReady
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::ConfigurationInvalid => "configuration_invalid",
            ErrorKind::NetworkUnavailable => "network_unavailable",
            ErrorKind::NotReady => "not_ready",
            ErrorKind::ConnectionTimeout => "connection_timeout",
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::AgentNotFound => "agent_not_found",
            ErrorKind::MicrophonePermissionDenied => "microphone_permission_denied",
            ErrorKind::MicrophoneUnavailable => "microphone_unavailable",
            ErrorKind::PlatformUnsupported => "platform_unsupported",
            ErrorKind::UnknownProviderError => "unknown_provider_error",
        };
        f.write_str(name)
    }
}

/// A classified failure, kept only long enough to drive one UI notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
    pub occurred_during_active_call: bool,
}

impl SessionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            occurred_during_active_call: false,
        }
    }

    /// Marks whether the failure interrupted an established call.
    pub fn during_call(mut self, active: bool) -> Self {
        self.occurred_during_active_call = active;
        self
    }
}

/// Returned by session handles once the session task has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("call session is no longer running")]
pub struct SessionClosed;

/// The fields of a provider error payload the classifier understands.
///
/// Providers report errors as free-form JSON; [`RawProviderError::from_value`]
/// picks these fields from the top level or from a nested `error` object.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawProviderError {
    pub code: Option<String>,
    pub status: Option<u16>,
    pub error_type: Option<String>,
    pub name: Option<String>,
    pub message: Option<String>,
}

impl RawProviderError {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn from_status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Extracts the known fields from an arbitrary provider payload.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(message) => Self::from_message(message.clone()),
            Value::Object(_) => {
                let nested = value.get("error");
                let field = |key: &str| {
                    value
                        .get(key)
                        .or_else(|| nested.and_then(|inner| inner.get(key)))
                };
                let message = field("message")
                    .or_else(|| field("errorMsg"))
                    .and_then(as_text)
                    .or_else(|| nested.and_then(Value::as_str).map(str::to_owned));
                Self {
                    code: field("code").and_then(as_text),
                    status: field("status")
                        .or_else(|| field("statusCode"))
                        .and_then(as_status),
                    error_type: value.get("type").and_then(as_text),
                    name: field("name").and_then(as_text),
                    message,
                }
            }
            _ => Self::default(),
        }
    }

    /// The text shown to the user for this failure.
    pub fn display_message(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.error_type.clone())
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| GENERIC_PROVIDER_MESSAGE.to_string())
    }

    /// Whether the error merely reports that the call has already ended.
    ///
    /// FIXME: substring match on provider free text; it can hide a genuine
    /// late failure whose message happens to contain "ended".
    pub fn is_benign_ended(&self) -> bool {
        self.display_message().to_lowercase().contains("ended")
    }

    fn has_network_marker(&self) -> bool {
        let tagged = [self.error_type.as_deref(), self.name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::to_lowercase)
            .any(|t| t.contains("cors") || t.contains("network"));
        let message = self.message.as_deref().unwrap_or_default();
        tagged
            || self.status == Some(0)
            || message.contains("CORS")
            || message.contains("Failed to fetch")
            || message.contains("NetworkError")
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_status(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn kind_for_code(code: &str) -> Option<ErrorKind> {
    let normalized = code.trim().to_ascii_lowercase().replace('-', "_");
    let kind = match normalized.as_str() {
        "unauthorized" | "authentication_failed" | "invalid_api_key" => {
            ErrorKind::AuthenticationFailed
        }
        "assistant_not_found" | "agent_not_found" => ErrorKind::AgentNotFound,
        "network_error" | "network_unavailable" | "cors_error" => ErrorKind::NetworkUnavailable,
        "permission_denied" | "not_allowed" | "microphone_permission_denied" => {
            ErrorKind::MicrophonePermissionDenied
        }
        "device_not_found" | "microphone_unavailable" => ErrorKind::MicrophoneUnavailable,
        "not_supported" | "platform_unsupported" => ErrorKind::PlatformUnsupported,
        _ => return None,
    };
    Some(kind)
}

fn kind_for_status(raw: &RawProviderError) -> Option<ErrorKind> {
    match raw.status {
        Some(401) => Some(ErrorKind::AuthenticationFailed),
        Some(404) => Some(ErrorKind::AgentNotFound),
        _ if raw.has_network_marker() => Some(ErrorKind::NetworkUnavailable),
        _ => None,
    }
}

fn kind_for_text(raw: &RawProviderError) -> Option<ErrorKind> {
    let text = [raw.name.as_deref(), raw.message.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    if text.to_lowercase().contains("permission") || text.contains("NotAllowed") {
        Some(ErrorKind::MicrophonePermissionDenied)
    } else if text.contains("NotFound") {
        Some(ErrorKind::MicrophoneUnavailable)
    } else if text.contains("NotSupported") {
        Some(ErrorKind::PlatformUnsupported)
    } else {
        None
    }
}

/// Maps a raw provider failure onto an [`ErrorKind`].
///
/// Tiers are tried in order: structured code, HTTP-like status (or a
/// CORS/network marker), message heuristics. Anything left over is an
/// `UnknownProviderError` carrying the provider's own message.
pub fn classify(raw: &RawProviderError) -> SessionError {
    let kind = raw
        .code
        .as_deref()
        .and_then(kind_for_code)
        .or_else(|| kind_for_status(raw))
        .or_else(|| kind_for_text(raw))
        .unwrap_or(ErrorKind::UnknownProviderError);
    SessionError::new(kind, raw.display_message())
}
