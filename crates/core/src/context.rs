//! Session credentials and user context issued by the backend.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fmt;

/// Placeholder values the backend ships with before voice is configured.
const PLACEHOLDER_PROVIDER_KEY: &str = "your_vapi_public_key";
const PLACEHOLDER_AGENT_ID: &str = "your_vapi_assistant_id";

/// Wire shape of `GET /session/config`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SessionConfigPayload {
    #[serde(alias = "publicKey")]
    provider_key: Option<String>,
    #[serde(alias = "assistantId")]
    agent_id: Option<String>,
}

/// Provider credentials and the agent to dial. Immutable once loaded.
pub struct SessionConfig {
    provider_key: SecretString,
    agent_id: String,
}

impl SessionConfig {
    pub fn new(provider_key: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            provider_key: SecretString::from(provider_key.into()),
            agent_id: agent_id.into(),
        }
    }

    pub fn provider_key(&self) -> &SecretString {
        &self.provider_key
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("provider_key", &"[REDACTED]")
            .field("agent_id", &self.agent_id)
            .finish()
    }
}

impl SessionConfigPayload {
    /// Rejects blank or placeholder credentials.
    pub(crate) fn validate(self) -> Result<SessionConfig, String> {
        let provider_key = self
            .provider_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty() && key != PLACEHOLDER_PROVIDER_KEY)
            .ok_or_else(|| "voice provider key is missing or not configured".to_string())?;
        let agent_id = self
            .agent_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty() && id != PLACEHOLDER_AGENT_ID)
            .ok_or_else(|| "voice agent id is missing or not configured".to_string())?;
        Ok(SessionConfig::new(provider_key, agent_id))
    }
}

impl Clone for SessionConfig {
    fn clone(&self) -> Self {
        Self::new(self.provider_key.expose_secret(), self.agent_id.clone())
    }
}

/// Who the session is for, used to personalise greetings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    #[serde(alias = "name")]
    pub user_name: String,
    #[serde(default)]
    pub location: Option<String>,
    /// Any further fields the backend sends along.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserContext {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            location: None,
            extra: Map::new(),
        }
    }
}

/// Everything a call needs that was fetched at initialization.
#[derive(Debug, Clone)]
pub struct SessionProfile {
    pub config: SessionConfig,
    pub context: UserContext,
}
