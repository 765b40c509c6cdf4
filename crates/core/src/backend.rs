//! Backend Client
//!
//! Talks to the application backend that issues voice credentials and user
//! context, answers text queries when voice is unavailable, and executes tool
//! calls requested by the remote agent. All requests carry a bearer token
//! obtained from an injected [`TokenProvider`].

use crate::{
    context::{SessionConfig, SessionConfigPayload, SessionProfile, UserContext},
    error::{ErrorKind, SessionError},
    provider::FunctionCall,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

const CONFIG_PATH: &str = "/session/config";
const CONTEXT_PATH: &str = "/session/context";
const QUERY_PATH: &str = "/session/query";
const FUNCTION_CALL_PATH: &str = "/session/function-call";

/// Supplies the caller's backend auth token, if the user is signed in.
#[cfg_attr(test, automock)]
pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Option<SecretString>;
}

/// A token fixed at construction, e.g. one handed over by a client at connect.
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.trim().is_empty()))
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<SecretString> {
        self.0.clone().map(SecretString::from)
    }
}

/// A follow-up the backend suggests after answering a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub label: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub route: Option<String>,
}

/// A reply to a free-text query.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReply {
    pub response: String,
    #[serde(default, alias = "suggested_actions")]
    pub suggested_actions: Vec<SuggestedAction>,
}

#[derive(Deserialize)]
struct FunctionCallReply {
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
}

/// The backend operations a call session depends on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Loads voice credentials and user context. Idempotent and safe to retry.
    async fn initialize(&self) -> Result<SessionProfile, SessionError>;
    /// Answers a typed question without a voice call.
    async fn ask(&self, query: &str) -> Result<QueryReply, SessionError>;
    /// Executes a tool call on behalf of the remote agent.
    async fn function_call(
        &self,
        call: FunctionCall,
        call_id: Option<String>,
    ) -> Result<Option<Value>, SessionError>;
}

/// Transport-level failures, before they are mapped to an [`ErrorKind`].
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("no backend auth token available")]
    MissingToken,
    #[error("backend rejected the credentials ({0})")]
    Unauthorized(StatusCode),
    #[error("backend returned {status} for {path}")]
    Status { path: &'static str, status: StatusCode },
    #[error("backend is unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed payload from {path}: {reason}")]
    Payload { path: &'static str, reason: String },
}

impl From<BackendError> for SessionError {
    fn from(err: BackendError) -> Self {
        let kind = match &err {
            BackendError::MissingToken | BackendError::Unauthorized(_) => {
                ErrorKind::Unauthenticated
            }
            BackendError::Status { .. } | BackendError::Payload { .. } => {
                ErrorKind::ConfigurationInvalid
            }
            BackendError::Transport(_) => ErrorKind::NetworkUnavailable,
        };
        SessionError::new(kind, err.to_string())
    }
}

/// `reqwest`-backed [`SessionBackend`].
#[derive(Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl BackendClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn bearer(&self) -> Result<SecretString, BackendError> {
        self.tokens.token().ok_or(BackendError::MissingToken)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &'static str,
        token: &SecretString,
    ) -> Result<T, BackendError> {
        let request = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(token.expose_secret());
        self.execute(path, request).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &'static str,
        body: &B,
    ) -> Result<T, BackendError> {
        let token = self.bearer()?;
        let request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token.expose_secret())
            .json(body);
        self.execute(path, request).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        path: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = request.send().await?;
        let status = response.status();
        debug!(path, %status, "Backend responded");
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BackendError::Unauthorized(status));
        }
        if !status.is_success() {
            return Err(BackendError::Status { path, status });
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| BackendError::Payload {
            path,
            reason: e.to_string(),
        })
    }

    async fn fetch_config(&self, token: &SecretString) -> Result<SessionConfig, BackendError> {
        let payload: SessionConfigPayload = self.get_json(CONFIG_PATH, token).await?;
        payload.validate().map_err(|reason| BackendError::Payload {
            path: CONFIG_PATH,
            reason,
        })
    }

    async fn fetch_context(&self, token: &SecretString) -> Result<UserContext, BackendError> {
        self.get_json(CONTEXT_PATH, token).await
    }
}

#[async_trait]
impl SessionBackend for BackendClient {
    #[instrument(name = "session_initialize", skip_all)]
    async fn initialize(&self) -> Result<SessionProfile, SessionError> {
        let token = self.bearer()?;
        let (config, context) =
            tokio::try_join!(self.fetch_config(&token), self.fetch_context(&token))?;
        info!(agent_id = %config.agent_id(), user = %context.user_name, "Session credentials loaded");
        Ok(SessionProfile { config, context })
    }

    async fn ask(&self, query: &str) -> Result<QueryReply, SessionError> {
        let reply: QueryReply = self.post_json(QUERY_PATH, &QueryRequest { query }).await?;
        debug!(suggestions = reply.suggested_actions.len(), "Text query answered");
        Ok(reply)
    }

    async fn function_call(
        &self,
        call: FunctionCall,
        call_id: Option<String>,
    ) -> Result<Option<Value>, SessionError> {
        let body = json!({
            "message": {
                "type": "function-call",
                "functionCall": call,
                "functionCallId": call_id,
            }
        });
        let reply: FunctionCallReply = self.post_json(FUNCTION_CALL_PATH, &body).await?;
        Ok(reply.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, header, method, path},
    };

    fn client(base_url: &str, token: Option<&str>) -> BackendClient {
        BackendClient::new(
            reqwest::Client::new(),
            base_url,
            Arc::new(StaticToken::new(token.map(str::to_string))),
        )
    }

    async fn mount_context(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path(CONTEXT_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "userName": "Lakshmi",
                "location": "Guntur"
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_initialize_loads_config_and_context() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CONFIG_PATH))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "providerKey": "pk-live",
                "agentId": "agent-42"
            })))
            .expect(1)
            .mount(&server)
            .await;
        mount_context(&server).await;

        let profile = client(&server.uri(), Some("tok-1")).initialize().await.unwrap();

        assert_eq!(profile.config.agent_id(), "agent-42");
        assert_eq!(profile.config.provider_key().expose_secret(), "pk-live");
        assert_eq!(profile.context.user_name, "Lakshmi");
        assert_eq!(profile.context.location.as_deref(), Some("Guntur"));
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthenticated_without_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = client(&server.uri(), None).initialize().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);

        let blank = client(&server.uri(), Some("  ")).initialize().await.unwrap_err();
        assert_eq!(blank.kind, ErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn test_rejected_token_is_unauthenticated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client(&server.uri(), Some("expired")).initialize().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn test_server_error_is_configuration_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CONFIG_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        mount_context(&server).await;

        let err = client(&server.uri(), Some("tok")).initialize().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationInvalid);
    }

    #[tokio::test]
    async fn test_payload_without_agent_id_is_configuration_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CONFIG_PATH))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "providerKey": "pk-live" })),
            )
            .mount(&server)
            .await;
        mount_context(&server).await;

        let err = client(&server.uri(), Some("tok")).initialize().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationInvalid);
        assert!(err.message.contains("agent id"));
    }

    #[tokio::test]
    async fn test_non_json_body_is_configuration_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(CONFIG_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;
        mount_context(&server).await;

        let err = client(&server.uri(), Some("tok")).initialize().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConfigurationInvalid);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_network_unavailable() {
        // Nothing listens on port 1.
        let err = client("http://127.0.0.1:1", Some("tok")).initialize().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NetworkUnavailable);
    }

    #[tokio::test]
    async fn test_ask_returns_reply_and_suggestions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(QUERY_PATH))
            .and(body_partial_json(json!({ "query": "What should I plant?" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": "Try groundnut this kharif season.",
                "suggested_actions": [
                    { "action": "seasonal_advice", "label": "Show seasonal calendar", "route": "/calendar" }
                ]
            })))
            .mount(&server)
            .await;

        let reply = client(&server.uri(), Some("tok"))
            .ask("What should I plant?")
            .await
            .unwrap();
        assert_eq!(reply.response, "Try groundnut this kharif season.");
        assert_eq!(reply.suggested_actions.len(), 1);
        assert_eq!(reply.suggested_actions[0].label, "Show seasonal calendar");
        assert_eq!(reply.suggested_actions[0].route.as_deref(), Some("/calendar"));
    }

    #[tokio::test]
    async fn test_function_call_forwards_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(FUNCTION_CALL_PATH))
            .and(body_partial_json(json!({
                "message": {
                    "type": "function-call",
                    "functionCallId": "fc_1",
                    "functionCall": { "name": "search_solutions" }
                }
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "result": "Use neem oil." })),
            )
            .mount(&server)
            .await;

        let call = FunctionCall {
            name: "search_solutions".to_string(),
            parameters: json!({ "query": "aphids" }),
        };
        let result = client(&server.uri(), Some("tok"))
            .function_call(call, Some("fc_1".to_string()))
            .await
            .unwrap();
        assert_eq!(result, Some(json!("Use neem oil.")));
    }

    #[tokio::test]
    async fn test_token_is_read_for_every_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(QUERY_PATH))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": "ok" })))
            .expect(2)
            .mount(&server)
            .await;

        let mut tokens = MockTokenProvider::new();
        tokens
            .expect_token()
            .times(2)
            .returning(|| Some(SecretString::from("fresh".to_string())));
        let backend = BackendClient::new(reqwest::Client::new(), server.uri(), Arc::new(tokens));

        for _ in 0..2 {
            let reply = backend.ask("hello").await.unwrap();
            assert!(reply.suggested_actions.is_empty());
        }
    }

    #[test]
    fn test_backend_error_mapping() {
        let missing: SessionError = BackendError::MissingToken.into();
        assert_eq!(missing.kind, ErrorKind::Unauthenticated);

        let status: SessionError = BackendError::Status {
            path: CONFIG_PATH,
            status: StatusCode::NOT_FOUND,
        }
        .into();
        assert_eq!(status.kind, ErrorKind::ConfigurationInvalid);
        assert!(status.message.contains("404"));
    }
}
