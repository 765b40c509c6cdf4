//! Call Lifecycle State Machine
//!
//! Transitions are a pure function of the current [`CallStatus`] and one
//! [`SessionEvent`]. The reducer never touches the provider, the transcript or
//! the clock; it returns the next status together with the [`Effect`]s the
//! session runtime must carry out, in order.

use crate::{
    context::SessionProfile,
    error::{ErrorKind, SessionError, classify},
    provider::{FunctionCall, ProviderEvent, ProviderMessage, TranscriptKind},
    transcript::TranscriptRole,
};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long a call may stay in `Connecting` before it is failed.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub const CONNECTING_TEXT: &str = "Connecting…";
pub const CALL_ENDED_TEXT: &str = "Call ended. Feel free to start a new conversation anytime!";
pub const CALL_CANCELLED_TEXT: &str = "Call cancelled before it connected.";
pub const NOT_READY_TEXT: &str =
    "Voice assistant is not ready yet. Please wait for it to load or retry initialization.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    #[default]
    Idle,
    Connecting,
    Active,
    Ended,
    Failed,
}

impl CallState {
    /// Whether a call attempt is in flight or established.
    pub fn is_outstanding(self) -> bool {
        matches!(self, CallState::Connecting | CallState::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeakingState {
    Speaking,
    #[default]
    Silent,
}

/// Normalised microphone/output level in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct VolumeLevel(f32);

impl VolumeLevel {
    pub fn new(level: f32) -> Self {
        if level.is_nan() {
            Self(0.0)
        } else {
            Self(level.clamp(0.0, 1.0))
        }
    }

    pub fn value(self) -> f32 {
        self.0
    }
}

/// The state owned by the state machine.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallStatus {
    pub call: CallState,
    pub speaking: SpeakingState,
    pub volume: VolumeLevel,
    pub muted: bool,
    pub error: Option<SessionError>,
}

impl CallStatus {
    /// Moves to a non-active state, dropping every Active-only substate.
    fn settle(&mut self, call: CallState) {
        self.call = call;
        self.speaking = SpeakingState::Silent;
        self.volume = VolumeLevel::default();
        self.muted = false;
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StartRequested,
    EndRequested,
    MuteRequested(bool),
    /// The timeout guard armed on entering `Connecting` has fired.
    ConnectTimedOut,
    InitializationSucceeded,
    InitializationFailed(SessionError),
    Provider(ProviderEvent),
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartProvider,
    StopProvider,
    ArmTimeout(Duration),
    DisarmTimeout,
    SetProviderMuted(bool),
    Append(TranscriptRole, String),
    InvokeFunction {
        call: FunctionCall,
        call_id: Option<String>,
    },
}

/// Read-only inputs a transition may consult.
#[derive(Debug, Clone, Copy)]
pub struct Env<'a> {
    pub profile: Option<&'a SessionProfile>,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub status: CallStatus,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(status: &CallStatus) -> Self {
        Self {
            status: status.clone(),
            effects: Vec::new(),
        }
    }
}

pub fn welcome_text(user_name: &str) -> String {
    let name = user_name.trim();
    if name.is_empty() {
        "Voice assistant connected! How can I help you today?".to_string()
    } else {
        format!("Voice assistant connected! Welcome, {name}. How can I help you today?")
    }
}

fn timeout_text(bound: Duration) -> String {
    let bound = if bound.subsec_millis() == 0 {
        format!("{} seconds", bound.as_secs())
    } else {
        format!("{} ms", bound.as_millis())
    };
    format!("Could not connect to the voice assistant within {bound}. Please try again.")
}

/// Computes the next status and the effects to run for `event`.
pub fn transition(status: &CallStatus, event: SessionEvent, env: &Env<'_>) -> Transition {
    let mut next = status.clone();
    let mut effects = Vec::new();

    match (status.call, event) {
        (CallState::Connecting | CallState::Active, SessionEvent::StartRequested) => {
            debug!(state = ?status.call, "Start requested while a call is outstanding; ignoring.");
        }
        (_, SessionEvent::StartRequested) => match env.profile {
            None => {
                warn!("Start requested before the session was initialized.");
                next.error = Some(SessionError::new(ErrorKind::NotReady, NOT_READY_TEXT));
            }
            Some(profile) => {
                info!(agent_id = %profile.config.agent_id(), "Starting voice call");
                next.settle(CallState::Connecting);
                next.error = None;
                effects.push(Effect::Append(TranscriptRole::System, CONNECTING_TEXT.into()));
                effects.push(Effect::ArmTimeout(env.connect_timeout));
                effects.push(Effect::StartProvider);
            }
        },

        (CallState::Connecting, SessionEvent::Provider(ProviderEvent::CallStart)) => {
            let name = env
                .profile
                .map(|p| p.context.user_name.as_str())
                .unwrap_or_default();
            info!("Voice call is active");
            next.call = CallState::Active;
            next.error = None;
            effects.push(Effect::DisarmTimeout);
            effects.push(Effect::Append(TranscriptRole::System, welcome_text(name)));
        }

        (CallState::Connecting, SessionEvent::ConnectTimedOut) => {
            warn!(timeout = ?env.connect_timeout, "Voice call did not connect in time");
            next.settle(CallState::Failed);
            next.error = Some(SessionError::new(
                ErrorKind::ConnectionTimeout,
                timeout_text(env.connect_timeout),
            ));
            effects.push(Effect::StopProvider);
            effects.push(Effect::Append(
                TranscriptRole::System,
                timeout_text(env.connect_timeout),
            ));
        }

        (state, SessionEvent::Provider(ProviderEvent::Error(raw))) => {
            if state != CallState::Active && raw.is_benign_ended() {
                debug!(state = ?state, message = %raw.display_message(), "Suppressing benign 'ended' error");
            } else {
                let during_call = state == CallState::Active;
                let error = classify(&raw).during_call(during_call);
                warn!(state = ?state, kind = %error.kind, message = %error.message, "Voice provider error");
                if state.is_outstanding() {
                    next.settle(CallState::Failed);
                    effects.push(Effect::DisarmTimeout);
                    effects.push(Effect::StopProvider);
                    effects.push(Effect::Append(
                        TranscriptRole::System,
                        format!("Call failed: {}", error.message),
                    ));
                }
                next.error = Some(error);
            }
        }

        (CallState::Active, SessionEvent::Provider(ProviderEvent::CallEnd)) => {
            info!("Voice call ended by provider");
            next.settle(CallState::Ended);
            effects.push(Effect::DisarmTimeout);
            effects.push(Effect::Append(TranscriptRole::System, CALL_ENDED_TEXT.into()));
        }
        (CallState::Connecting, SessionEvent::Provider(ProviderEvent::CallEnd)) => {
            info!("Voice call ended before it became active");
            next.settle(CallState::Ended);
            effects.push(Effect::DisarmTimeout);
            effects.push(Effect::Append(TranscriptRole::System, CALL_ENDED_TEXT.into()));
        }

        (CallState::Active, SessionEvent::EndRequested) => {
            info!("Ending voice call at user request");
            next.settle(CallState::Ended);
            effects.push(Effect::DisarmTimeout);
            effects.push(Effect::StopProvider);
            effects.push(Effect::Append(TranscriptRole::System, CALL_ENDED_TEXT.into()));
        }
        (CallState::Connecting, SessionEvent::EndRequested) => {
            info!("Cancelling voice call before it connected");
            next.settle(CallState::Ended);
            effects.push(Effect::DisarmTimeout);
            effects.push(Effect::StopProvider);
            effects.push(Effect::Append(TranscriptRole::System, CALL_CANCELLED_TEXT.into()));
        }

        (CallState::Active, SessionEvent::Provider(ProviderEvent::SpeechStart)) => {
            next.speaking = SpeakingState::Speaking;
        }
        (CallState::Active, SessionEvent::Provider(ProviderEvent::SpeechEnd)) => {
            next.speaking = SpeakingState::Silent;
        }
        (CallState::Active, SessionEvent::Provider(ProviderEvent::VolumeLevel(level))) => {
            next.volume = VolumeLevel::new(level);
        }
        (CallState::Active, SessionEvent::MuteRequested(muted)) => {
            if muted != status.muted {
                next.muted = muted;
                effects.push(Effect::SetProviderMuted(muted));
            }
        }

        (CallState::Active, SessionEvent::Provider(ProviderEvent::Message(message))) => {
            match message {
                ProviderMessage::Transcript {
                    transcript_type: TranscriptKind::Final,
                    role,
                    transcript,
                } => {
                    if transcript.trim().is_empty() {
                        debug!(%role, "Discarding blank transcript");
                    } else {
                        effects.push(Effect::Append(role, transcript));
                    }
                }
                ProviderMessage::FunctionCall {
                    function_call,
                    function_call_id,
                } => {
                    info!(function = %function_call.name, "Agent requested a function call");
                    effects.push(Effect::InvokeFunction {
                        call: function_call,
                        call_id: function_call_id,
                    });
                }
                ProviderMessage::Transcript { .. } | ProviderMessage::Other => {}
            }
        }

        (_, SessionEvent::InitializationSucceeded) => {
            if next.error.as_ref().is_some_and(|e| e.kind.is_preflight()) {
                next.error = None;
            }
        }
        (_, SessionEvent::InitializationFailed(error)) => {
            warn!(kind = %error.kind, message = %error.message, "Session initialization failed");
            next.error = Some(error);
        }

        (state, event) => {
            debug!(state = ?state, event = ?event, "Event has no effect in the current state");
            return Transition::unchanged(status);
        }
    }

    Transition {
        status: next,
        effects,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        context::{SessionConfig, UserContext},
        error::RawProviderError,
    };

    fn profile() -> SessionProfile {
        SessionProfile {
            config: SessionConfig::new("pk-test", "agent-1"),
            context: UserContext::new("Ravi"),
        }
    }

    fn env(profile: &SessionProfile) -> Env<'_> {
        Env {
            profile: Some(profile),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    fn status(call: CallState) -> CallStatus {
        CallStatus {
            call,
            ..Default::default()
        }
    }

    fn provider(event: ProviderEvent) -> SessionEvent {
        SessionEvent::Provider(event)
    }

    fn final_transcript(role: TranscriptRole, text: &str) -> SessionEvent {
        provider(ProviderEvent::Message(ProviderMessage::Transcript {
            transcript_type: TranscriptKind::Final,
            role,
            transcript: text.to_string(),
        }))
    }

    fn appended(effects: &[Effect]) -> Vec<(TranscriptRole, String)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Append(role, text) => Some((*role, text.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_from_idle_enters_connecting() {
        let p = profile();
        let mut prior = status(CallState::Idle);
        prior.error = Some(SessionError::new(ErrorKind::ConnectionTimeout, "old"));

        let t = transition(&prior, SessionEvent::StartRequested, &env(&p));

        assert_eq!(t.status.call, CallState::Connecting);
        assert_eq!(t.status.error, None);
        assert_eq!(
            t.effects,
            vec![
                Effect::Append(TranscriptRole::System, CONNECTING_TEXT.to_string()),
                Effect::ArmTimeout(DEFAULT_CONNECT_TIMEOUT),
                Effect::StartProvider,
            ]
        );
    }

    #[test]
    fn test_start_without_profile_is_not_ready() {
        let e = Env {
            profile: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        };
        let t = transition(&status(CallState::Idle), SessionEvent::StartRequested, &e);

        assert_eq!(t.status.call, CallState::Idle);
        assert_eq!(t.status.error.unwrap().kind, ErrorKind::NotReady);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_start_while_outstanding_is_noop() {
        let p = profile();
        for call in [CallState::Connecting, CallState::Active] {
            let prior = status(call);
            let t = transition(&prior, SessionEvent::StartRequested, &env(&p));
            assert_eq!(t.status, prior);
            assert!(t.effects.is_empty());
        }
    }

    #[test]
    fn test_restart_after_ended_or_failed() {
        let p = profile();
        for call in [CallState::Ended, CallState::Failed] {
            let t = transition(&status(call), SessionEvent::StartRequested, &env(&p));
            assert_eq!(t.status.call, CallState::Connecting);
            assert!(t.effects.contains(&Effect::StartProvider));
        }
    }

    #[test]
    fn test_call_start_activates_and_welcomes_user() {
        let p = profile();
        let t = transition(
            &status(CallState::Connecting),
            provider(ProviderEvent::CallStart),
            &env(&p),
        );

        assert_eq!(t.status.call, CallState::Active);
        assert_eq!(t.effects[0], Effect::DisarmTimeout);
        let entries = appended(&t.effects);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, TranscriptRole::System);
        assert!(entries[0].1.contains("Ravi"));
    }

    #[test]
    fn test_timeout_fails_connecting_call() {
        let p = profile();
        let t = transition(
            &status(CallState::Connecting),
            SessionEvent::ConnectTimedOut,
            &env(&p),
        );

        assert_eq!(t.status.call, CallState::Failed);
        let error = t.status.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ConnectionTimeout);
        assert!(!error.occurred_during_active_call);
        let stops = t.effects.iter().filter(|e| **e == Effect::StopProvider).count();
        assert_eq!(stops, 1);
        assert_eq!(appended(&t.effects).len(), 1);
    }

    #[test]
    fn test_timeout_after_activation_is_ignored() {
        let p = profile();
        let prior = status(CallState::Active);
        let t = transition(&prior, SessionEvent::ConnectTimedOut, &env(&p));
        assert_eq!(t.status, prior);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_unauthorized_error_while_connecting() {
        let p = profile();
        let t = transition(
            &status(CallState::Connecting),
            provider(ProviderEvent::Error(RawProviderError::from_status(401))),
            &env(&p),
        );

        assert_eq!(t.status.call, CallState::Failed);
        assert_eq!(t.status.error.unwrap().kind, ErrorKind::AuthenticationFailed);
        assert!(t.effects.contains(&Effect::StopProvider));
        assert!(t.effects.contains(&Effect::DisarmTimeout));
    }

    #[test]
    fn test_error_during_active_call_is_flagged() {
        let p = profile();
        let mut prior = status(CallState::Active);
        prior.speaking = SpeakingState::Speaking;
        prior.volume = VolumeLevel::new(0.8);

        let t = transition(
            &prior,
            provider(ProviderEvent::Error(RawProviderError::from_message(
                "Meeting has ended",
            ))),
            &env(&p),
        );

        // "ended" is only treated as benign outside an active call.
        assert_eq!(t.status.call, CallState::Failed);
        assert!(t.status.error.unwrap().occurred_during_active_call);
        assert_eq!(t.status.speaking, SpeakingState::Silent);
        assert_eq!(t.status.volume.value(), 0.0);
    }

    #[test]
    fn test_benign_ended_error_is_suppressed_when_not_active() {
        let p = profile();
        for call in [CallState::Connecting, CallState::Ended, CallState::Idle] {
            let prior = status(call);
            let t = transition(
                &prior,
                provider(ProviderEvent::Error(RawProviderError::from_message(
                    "Meeting has ended",
                ))),
                &env(&p),
            );
            assert_eq!(t.status, prior);
            assert!(t.effects.is_empty());
        }
    }

    #[test]
    fn test_late_error_surfaces_without_transition() {
        let p = profile();
        let t = transition(
            &status(CallState::Ended),
            provider(ProviderEvent::Error(RawProviderError::from_message(
                "NotAllowedError",
            ))),
            &env(&p),
        );
        assert_eq!(t.status.call, CallState::Ended);
        assert_eq!(
            t.status.error.unwrap().kind,
            ErrorKind::MicrophonePermissionDenied
        );
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_provider_call_end_resets_active_substate() {
        let p = profile();
        let mut prior = status(CallState::Active);
        prior.speaking = SpeakingState::Speaking;
        prior.volume = VolumeLevel::new(0.5);
        prior.muted = true;

        let t = transition(&prior, provider(ProviderEvent::CallEnd), &env(&p));

        assert_eq!(t.status.call, CallState::Ended);
        assert_eq!(t.status.speaking, SpeakingState::Silent);
        assert_eq!(t.status.volume, VolumeLevel::default());
        assert!(!t.status.muted);
        assert!(!t.effects.contains(&Effect::StopProvider));
    }

    #[test]
    fn test_user_end_stops_provider_once() {
        let p = profile();
        let first = transition(&status(CallState::Active), SessionEvent::EndRequested, &env(&p));
        assert_eq!(first.status.call, CallState::Ended);
        assert!(first.effects.contains(&Effect::StopProvider));

        let second = transition(&first.status, SessionEvent::EndRequested, &env(&p));
        assert_eq!(second.status, first.status);
        assert!(second.effects.is_empty());

        let duplicate = transition(&first.status, provider(ProviderEvent::CallEnd), &env(&p));
        assert_eq!(duplicate.status, first.status);
        assert!(duplicate.effects.is_empty());
    }

    #[test]
    fn test_end_while_connecting_cancels() {
        let p = profile();
        let t = transition(
            &status(CallState::Connecting),
            SessionEvent::EndRequested,
            &env(&p),
        );
        assert_eq!(t.status.call, CallState::Ended);
        assert!(t.effects.contains(&Effect::StopProvider));
        assert!(t.effects.contains(&Effect::DisarmTimeout));
    }

    #[test]
    fn test_speech_and_volume_only_apply_while_active() {
        let p = profile();
        let active = status(CallState::Active);
        let speaking = transition(&active, provider(ProviderEvent::SpeechStart), &env(&p));
        assert_eq!(speaking.status.speaking, SpeakingState::Speaking);
        let silent = transition(&speaking.status, provider(ProviderEvent::SpeechEnd), &env(&p));
        assert_eq!(silent.status.speaking, SpeakingState::Silent);

        let loud = transition(&active, provider(ProviderEvent::VolumeLevel(3.0)), &env(&p));
        assert_eq!(loud.status.volume.value(), 1.0);

        let connecting = status(CallState::Connecting);
        let ignored = transition(&connecting, provider(ProviderEvent::SpeechStart), &env(&p));
        assert_eq!(ignored.status, connecting);
    }

    #[test]
    fn test_final_transcript_is_appended() {
        let p = profile();
        let t = transition(
            &status(CallState::Active),
            final_transcript(TranscriptRole::User, "leaf spots on tomato"),
            &env(&p),
        );
        assert_eq!(
            t.effects,
            vec![Effect::Append(
                TranscriptRole::User,
                "leaf spots on tomato".to_string()
            )]
        );
    }

    #[test]
    fn test_blank_and_partial_transcripts_are_discarded() {
        let p = profile();
        let active = status(CallState::Active);
        for text in ["", "   ", "\n\t"] {
            let t = transition(&active, final_transcript(TranscriptRole::Assistant, text), &env(&p));
            assert!(t.effects.is_empty());
        }

        let partial = provider(ProviderEvent::Message(ProviderMessage::Transcript {
            transcript_type: TranscriptKind::Partial,
            role: TranscriptRole::User,
            transcript: "leaf sp".to_string(),
        }));
        assert!(transition(&active, partial, &env(&p)).effects.is_empty());
    }

    #[test]
    fn test_function_call_is_forwarded() {
        let p = profile();
        let call = FunctionCall {
            name: "get_crop_analysis".to_string(),
            parameters: serde_json::json!({ "limit": 3 }),
        };
        let t = transition(
            &status(CallState::Active),
            provider(ProviderEvent::Message(ProviderMessage::FunctionCall {
                function_call: call.clone(),
                function_call_id: Some("fc_7".to_string()),
            })),
            &env(&p),
        );
        assert_eq!(
            t.effects,
            vec![Effect::InvokeFunction {
                call,
                call_id: Some("fc_7".to_string())
            }]
        );
    }

    #[test]
    fn test_mute_only_while_active_and_only_on_change() {
        let p = profile();
        let active = status(CallState::Active);
        let muted = transition(&active, SessionEvent::MuteRequested(true), &env(&p));
        assert!(muted.status.muted);
        assert_eq!(muted.effects, vec![Effect::SetProviderMuted(true)]);

        let again = transition(&muted.status, SessionEvent::MuteRequested(true), &env(&p));
        assert!(again.effects.is_empty());

        let idle = status(CallState::Idle);
        let ignored = transition(&idle, SessionEvent::MuteRequested(true), &env(&p));
        assert_eq!(ignored.status, idle);
    }

    #[test]
    fn test_initialization_outcomes() {
        let p = profile();
        let failed = transition(
            &status(CallState::Idle),
            SessionEvent::InitializationFailed(SessionError::new(
                ErrorKind::Unauthenticated,
                "sign in first",
            )),
            &env(&p),
        );
        assert_eq!(failed.status.call, CallState::Idle);
        assert_eq!(
            failed.status.error.as_ref().unwrap().kind,
            ErrorKind::Unauthenticated
        );

        let recovered = transition(&failed.status, SessionEvent::InitializationSucceeded, &env(&p));
        assert_eq!(recovered.status.error, None);

        let mut timed_out = status(CallState::Failed);
        timed_out.error = Some(SessionError::new(ErrorKind::ConnectionTimeout, "slow"));
        let kept = transition(&timed_out, SessionEvent::InitializationSucceeded, &env(&p));
        assert_eq!(kept.status.error, timed_out.error);
    }

    #[test]
    fn test_timeout_text_keeps_sub_second_bounds() {
        assert!(timeout_text(Duration::from_secs(15)).contains("within 15 seconds"));
        assert!(timeout_text(Duration::from_millis(250)).contains("within 250 ms"));
        assert!(timeout_text(Duration::from_millis(1500)).contains("within 1500 ms"));
    }

    #[test]
    fn test_volume_level_normalisation() {
        assert_eq!(VolumeLevel::new(-0.5).value(), 0.0);
        assert_eq!(VolumeLevel::new(0.42).value(), 0.42);
        assert_eq!(VolumeLevel::new(f32::NAN).value(), 0.0);
    }
}
