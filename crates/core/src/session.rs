//! Call Session Runtime
//!
//! Owns one call session and runs it on a single tokio task. UI intents,
//! provider events, the connect timeout, the pending provider start and the
//! results of backend calls are all consumed by one `select!` loop, so state
//! transitions never run concurrently. Every handled input publishes a fresh
//! [`SessionSnapshot`] on a `watch` channel.

use crate::{
    backend::{QueryReply, SessionBackend, SuggestedAction},
    context::SessionProfile,
    error::{ErrorKind, RawProviderError, SessionClosed, SessionError},
    machine::{
        CallState, CallStatus, DEFAULT_CONNECT_TIMEOUT, Effect, Env, SessionEvent, SpeakingState,
        Transition, VolumeLevel, transition,
    },
    provider::{FunctionCall, ProviderEvent, StartFuture, VoiceProvider},
    timeout::TimeoutGuard,
    transcript::{Transcript, TranscriptEntry, TranscriptRole},
};
use serde::Serialize;
use serde_json::{Value, json};
use std::{future, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::{JoinError, JoinHandle},
};
use tracing::{debug, info, instrument, warn};

const COMPLETION_BUFFER: usize = 32;

/// Tunables for a call session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// How long a call may stay `Connecting`.
    pub connect_timeout: Duration,
    /// Capacity of the intent channel behind a [`SessionHandle`].
    pub intent_buffer: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            intent_buffer: 32,
        }
    }
}

/// Requests a UI can make of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionIntent {
    /// Load (or reload) credentials and user context.
    Initialize,
    StartCall,
    EndCall,
    ClearTranscript,
    SetMuted(bool),
    /// Ask the backend a typed question, outside of any voice call.
    SendText(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "kind", rename_all = "snake_case")]
pub enum InitializationStatus {
    Pending,
    Loading,
    Ready,
    Failed(ErrorKind),
}

/// Read-only view of a session, as rendered by a UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub call_state: CallState,
    pub speaking: SpeakingState,
    pub volume: VolumeLevel,
    pub muted: bool,
    /// Shared with the session; cloning a snapshot does not copy entries.
    pub transcript: Arc<Vec<TranscriptEntry>>,
    pub error: Option<SessionError>,
    pub initialization: InitializationStatus,
    pub suggested_actions: Vec<SuggestedAction>,
    /// Whether a typed question is still waiting for its answer.
    pub awaiting_reply: bool,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            call_state: CallState::Idle,
            speaking: SpeakingState::Silent,
            volume: VolumeLevel::default(),
            muted: false,
            transcript: Arc::default(),
            error: None,
            initialization: InitializationStatus::Pending,
            suggested_actions: Vec::new(),
            awaiting_reply: false,
        }
    }
}

/// Results of backend work spawned off the session task.
enum Completion {
    Initialized(Result<SessionProfile, SessionError>),
    FunctionResult {
        name: String,
        call_id: Option<String>,
        result: Result<Option<Value>, SessionError>,
    },
    QueryAnswered(Result<QueryReply, SessionError>),
}

/// The state owned by a session task.
pub struct CallSession {
    status: CallStatus,
    transcript: Transcript,
    guard: TimeoutGuard<SessionEvent>,
    provider: Box<dyn VoiceProvider>,
    provider_events: mpsc::Receiver<ProviderEvent>,
    pending_start: Option<StartFuture>,
    backend: Arc<dyn SessionBackend>,
    profile: Option<SessionProfile>,
    initialization: InitializationStatus,
    suggested_actions: Vec<SuggestedAction>,
    queries_in_flight: usize,
    completions_tx: mpsc::Sender<Completion>,
    completions_rx: mpsc::Receiver<Completion>,
    snapshots: watch::Sender<SessionSnapshot>,
    settings: SessionSettings,
}

impl CallSession {
    /// Starts a session task and returns the handle that drives it.
    ///
    /// The session is not initialized yet; call [`SessionHandle::initialize`].
    pub fn spawn(
        provider: Box<dyn VoiceProvider>,
        provider_events: mpsc::Receiver<ProviderEvent>,
        backend: Arc<dyn SessionBackend>,
        settings: SessionSettings,
    ) -> SessionHandle {
        let (intents_tx, intents_rx) = mpsc::channel(settings.intent_buffer.max(1));
        let (completions_tx, completions_rx) = mpsc::channel(COMPLETION_BUFFER);
        let (snapshots, snapshots_rx) = watch::channel(SessionSnapshot::default());

        let session = CallSession {
            status: CallStatus::default(),
            transcript: Transcript::new(),
            guard: TimeoutGuard::new(),
            provider,
            provider_events,
            pending_start: None,
            backend,
            profile: None,
            initialization: InitializationStatus::Pending,
            suggested_actions: Vec::new(),
            queries_in_flight: 0,
            completions_tx,
            completions_rx,
            snapshots,
            settings,
        };
        let task = tokio::spawn(session.run(intents_rx));

        SessionHandle {
            intents: intents_tx,
            snapshots: snapshots_rx,
            task,
        }
    }

    #[instrument(name = "call_session", skip_all)]
    async fn run(mut self, mut intents: mpsc::Receiver<SessionIntent>) {
        info!(connect_timeout = ?self.settings.connect_timeout, "Call session started");
        self.publish();

        loop {
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(intent) => self.handle_intent(intent),
                    None => break,
                },
                Some(event) = self.provider_events.recv() => {
                    self.dispatch(SessionEvent::Provider(event));
                }
                event = self.guard.fired() => self.dispatch(event),
                outcome = poll_start(&mut self.pending_start) => match outcome {
                    Ok(()) => debug!("Provider accepted the start request"),
                    Err(raw) => {
                        warn!(message = %raw.display_message(), "Provider failed to start");
                        self.dispatch(SessionEvent::Provider(ProviderEvent::Error(raw)));
                    }
                },
                Some(done) = self.completions_rx.recv() => self.handle_completion(done),
            }
            self.publish();
        }

        if self.status.call.is_outstanding() {
            info!(state = ?self.status.call, "Session dropped with a call outstanding; stopping provider");
            self.pending_start = None;
            self.provider.stop();
        }
        info!("Call session closed");
    }

    fn handle_intent(&mut self, intent: SessionIntent) {
        debug!(?intent, "Handling session intent");
        match intent {
            SessionIntent::Initialize => self.initialize(),
            SessionIntent::StartCall => self.dispatch(SessionEvent::StartRequested),
            SessionIntent::EndCall => self.dispatch(SessionEvent::EndRequested),
            SessionIntent::SetMuted(muted) => self.dispatch(SessionEvent::MuteRequested(muted)),
            SessionIntent::ClearTranscript => {
                info!(entries = self.transcript.len(), "Clearing transcript");
                self.transcript.clear();
            }
            SessionIntent::SendText(text) => self.ask(text),
        }
    }

    fn initialize(&mut self) {
        if self.initialization == InitializationStatus::Loading {
            debug!("Initialization already in progress");
            return;
        }
        self.initialization = InitializationStatus::Loading;

        let backend = Arc::clone(&self.backend);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let outcome = backend.initialize().await;
            if completions.send(Completion::Initialized(outcome)).await.is_err() {
                debug!("Session closed before initialization finished");
            }
        });
    }

    fn ask(&mut self, text: String) {
        let query = text.trim().to_string();
        if query.is_empty() {
            debug!("Ignoring blank text query");
            return;
        }
        self.transcript.append(TranscriptRole::User, query.clone());
        self.queries_in_flight += 1;

        let backend = Arc::clone(&self.backend);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let outcome = backend.ask(&query).await;
            if completions.send(Completion::QueryAnswered(outcome)).await.is_err() {
                debug!("Session closed before the query was answered");
            }
        });
    }

    fn handle_completion(&mut self, done: Completion) {
        match done {
            Completion::Initialized(Ok(profile)) => {
                info!(user = %profile.context.user_name, "Session ready");
                self.profile = Some(profile);
                self.initialization = InitializationStatus::Ready;
                self.dispatch(SessionEvent::InitializationSucceeded);
            }
            Completion::Initialized(Err(error)) => {
                // A stale profile must not let `start` through after a failed reload.
                self.profile = None;
                self.initialization = InitializationStatus::Failed(error.kind);
                self.dispatch(SessionEvent::InitializationFailed(error));
            }
            Completion::FunctionResult {
                name,
                call_id,
                result,
            } => match result {
                Ok(Some(result)) if self.status.call == CallState::Active => {
                    debug!(function = %name, "Returning function result to the agent");
                    self.provider.send(json!({
                        "type": "function-call-result",
                        "functionCallId": call_id,
                        "result": result,
                    }));
                }
                Ok(Some(_)) => {
                    debug!(function = %name, state = ?self.status.call, "Call no longer active; dropping function result");
                }
                Ok(None) => debug!(function = %name, "Function call returned no result"),
                Err(error) => {
                    warn!(function = %name, kind = %error.kind, message = %error.message, "Function call failed");
                }
            },
            Completion::QueryAnswered(outcome) => {
                self.queries_in_flight = self.queries_in_flight.saturating_sub(1);
                match outcome {
                    Ok(reply) => {
                        self.transcript.append(TranscriptRole::Assistant, reply.response);
                        self.suggested_actions = reply.suggested_actions;
                    }
                    Err(error) => {
                        warn!(kind = %error.kind, message = %error.message, "Text query failed");
                        self.transcript.append(
                            TranscriptRole::System,
                            format!("Sorry, I could not get an answer: {}", error.message),
                        );
                    }
                }
            }
        }
    }

    /// Runs the reducer for `event` and carries out the resulting effects.
    fn dispatch(&mut self, event: SessionEvent) {
        let env = Env {
            profile: self.profile.as_ref(),
            connect_timeout: self.settings.connect_timeout,
        };
        let Transition { status, effects } = transition(&self.status, event, &env);
        self.status = status;
        for effect in effects {
            self.apply(effect);
        }
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::StartProvider => match &self.profile {
                Some(profile) => self.pending_start = Some(self.provider.start(&profile.config)),
                None => warn!("Provider start requested without a loaded profile"),
            },
            Effect::StopProvider => {
                self.pending_start = None;
                self.provider.stop();
            }
            Effect::ArmTimeout(after) => self.guard.arm(after, SessionEvent::ConnectTimedOut),
            Effect::DisarmTimeout => {
                self.guard.disarm();
            }
            Effect::SetProviderMuted(muted) => self.provider.set_muted(muted),
            Effect::Append(role, text) => {
                self.transcript.append(role, text);
            }
            Effect::InvokeFunction { call, call_id } => self.invoke_function(call, call_id),
        }
    }

    fn invoke_function(&self, call: FunctionCall, call_id: Option<String>) {
        let backend = Arc::clone(&self.backend);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let name = call.name.clone();
            let result = backend.function_call(call, call_id.clone()).await;
            let done = Completion::FunctionResult {
                name,
                call_id,
                result,
            };
            if completions.send(done).await.is_err() {
                debug!("Session closed before the function call finished");
            }
        });
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            call_state: self.status.call,
            speaking: self.status.speaking,
            volume: self.status.volume,
            muted: self.status.muted,
            transcript: self.transcript.view(),
            error: self.status.error.clone(),
            initialization: self.initialization,
            suggested_actions: self.suggested_actions.clone(),
            awaiting_reply: self.queries_in_flight > 0,
        }
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Resolves with the outcome of the in-flight provider start, if any.
/// Cancel-safe: the start future stays in place until it completes.
async fn poll_start(pending: &mut Option<StartFuture>) -> Result<(), RawProviderError> {
    match pending.as_mut() {
        Some(start) => {
            let outcome = start.await;
            *pending = None;
            outcome
        }
        None => future::pending().await,
    }
}

/// Drives a running [`CallSession`]. Dropping the handle ends the session.
pub struct SessionHandle {
    intents: mpsc::Sender<SessionIntent>,
    snapshots: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub async fn send(&self, intent: SessionIntent) -> Result<(), SessionClosed> {
        self.intents.send(intent).await.map_err(|_| SessionClosed)
    }

    /// Loads credentials and context; also the retry path after a failure.
    pub async fn initialize(&self) -> Result<(), SessionClosed> {
        self.send(SessionIntent::Initialize).await
    }

    pub async fn start_call(&self) -> Result<(), SessionClosed> {
        self.send(SessionIntent::StartCall).await
    }

    pub async fn end_call(&self) -> Result<(), SessionClosed> {
        self.send(SessionIntent::EndCall).await
    }

    pub async fn clear_transcript(&self) -> Result<(), SessionClosed> {
        self.send(SessionIntent::ClearTranscript).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), SessionClosed> {
        self.send(SessionIntent::SetMuted(muted)).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionClosed> {
        self.send(SessionIntent::SendText(text.into())).await
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// A receiver that is notified whenever the snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Waits until a published snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, SessionClosed> {
        let mut snapshots = self.snapshots.clone();
        let snapshot = snapshots.wait_for(predicate).await.map_err(|_| SessionClosed)?;
        Ok(snapshot.clone())
    }

    /// Closes the intent channel and waits for the session task to finish.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        let SessionHandle { intents, task, .. } = self;
        drop(intents);
        task.await
    }
}
