//! Manages the WebSocket connection lifecycle for a voice call session.

use super::{
    protocol::{ClientMessage, ProviderCommand, ServerMessage},
    provider::SocketProvider,
};
use crate::state::AppState;
use agrivoice_core::{
    backend::{BackendClient, StaticToken},
    provider::{ProviderEvent, event_channel},
    session::{CallSession, SessionHandle, SessionSettings, SessionSnapshot},
};
use anyhow::{Context, Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    time::{self, Instant},
};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Minimum spacing between snapshots sent to one client.
const SNAPSHOT_INTERVAL: Duration = Duration::from_millis(50);

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Main handler for an individual WebSocket connection.
///
/// The first client message must be `init`; it carries the backend token the
/// session's loader will use.
#[instrument(name = "ws_session", skip_all, fields(connection_id = %Uuid::new_v4()))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("New WebSocket connection. Awaiting initialization...");
    let (mut socket_tx, mut socket_rx) = socket.split();

    let init = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => parse_init(&text),
        Some(Ok(_)) => Err(anyhow!("First message was not a text `init` message.")),
        _ => {
            info!("Client disconnected before sending init message.");
            return;
        }
    };
    let token = match init {
        Ok(token) => token,
        Err(e) => {
            error!("Session initialization failed: {:?}", e);
            let message = ServerMessage::Error {
                message: e.to_string(),
            };
            if let Err(e) = send_msg(&mut socket_tx, message).await {
                debug!(error = ?e, "Could not report init failure to client.");
            }
            return;
        }
    };

    if let Err(e) = run_voice_session(state, token, socket_tx, socket_rx).await {
        error!(error = ?e, "Voice session terminated with error.");
    }
    info!("WebSocket connection closed and call session terminated.");
}

/// Extracts the optional backend token from the `init` message.
fn parse_init(text: &str) -> Result<Option<String>> {
    let message: ClientMessage =
        serde_json::from_str(text).context("First message is not a valid client message")?;
    match message {
        ClientMessage::Init { token } => Ok(token),
        other => Err(anyhow!("First message must be `init`, got `{}`", other.kind())),
    }
}

/// The main event loop for an initialized connection.
///
/// Outbound traffic (snapshots and provider commands) and inbound client
/// messages are multiplexed in one loop, so the socket sink has one owner.
async fn run_voice_session(
    state: Arc<AppState>,
    token: Option<String>,
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut socket_rx: SplitStream<WebSocket>,
) -> Result<()> {
    let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = event_channel();

    let backend = BackendClient::new(
        state.http.clone(),
        state.config.backend_url.clone(),
        Arc::new(StaticToken::new(token)),
    );
    let settings = SessionSettings {
        connect_timeout: state.config.connect_timeout,
        ..SessionSettings::default()
    };
    let session = CallSession::spawn(
        Box::new(SocketProvider::new(commands_tx)),
        events_rx,
        Arc::new(backend),
        settings,
    );
    session.initialize().await?;

    let mut snapshots = session.subscribe();
    let first = ServerMessage::Snapshot {
        snapshot: snapshots.borrow_and_update().clone(),
    };
    send_msg(&mut socket_tx, first).await?;
    let mut snapshot_due = Instant::now() + SNAPSHOT_INTERVAL;

    loop {
        tokio::select! {
            outbound = next_outbound(&mut commands_rx, &mut snapshots, snapshot_due) => match outbound {
                Some(message) => {
                    if matches!(message, ServerMessage::Snapshot { .. }) {
                        snapshot_due = Instant::now() + SNAPSHOT_INTERVAL;
                    }
                    send_msg(&mut socket_tx, message).await?;
                }
                None => {
                    warn!("Call session stopped publishing; closing connection.");
                    break;
                }
            },
            incoming = socket_rx.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(message) => route_client_message(message, &session, &events_tx).await?,
                        Err(e) => {
                            warn!(error = %e, "Ignoring malformed client message.");
                            let reply = ServerMessage::Error {
                                message: format!("Malformed message: {e}"),
                            };
                            send_msg(&mut socket_tx, reply).await?;
                        }
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client closed the connection. Shutting down session.");
                    break;
                },
                Some(Ok(Message::Binary(_))) => warn!("Ignoring unexpected binary frame."),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {},
                Some(Err(e)) => {
                    error!("Error receiving from client WebSocket: {:?}", e);
                    break;
                },
            },
        }
    }

    session
        .shutdown()
        .await
        .context("Call session task panicked")?;
    Ok(())
}

/// Picks the next message for the client.
///
/// Pending provider commands always go first. Snapshots are coalesced: at
/// most one is produced per `snapshot_due` window and it is always the
/// latest. Returns `None` once the session has stopped publishing.
async fn next_outbound(
    commands: &mut mpsc::UnboundedReceiver<ProviderCommand>,
    snapshots: &mut watch::Receiver<SessionSnapshot>,
    snapshot_due: Instant,
) -> Option<ServerMessage> {
    tokio::select! {
        biased;
        Some(command) = commands.recv() => Some(ServerMessage::ProviderCommand { command }),
        changed = async {
            time::sleep_until(snapshot_due).await;
            snapshots.changed().await
        } => match changed {
            Ok(()) => Some(ServerMessage::Snapshot {
                snapshot: snapshots.borrow_and_update().clone(),
            }),
            Err(_) => None,
        },
    }
}

/// Hands one post-init client message to the call session.
async fn route_client_message(
    message: ClientMessage,
    session: &SessionHandle,
    provider_events: &mpsc::Sender<ProviderEvent>,
) -> Result<()> {
    debug!(kind = message.kind(), "Client message received");
    match message {
        ClientMessage::Init { .. } => warn!("Ignoring repeated `init` message."),
        ClientMessage::StartCall => session.start_call().await?,
        ClientMessage::EndCall => session.end_call().await?,
        ClientMessage::ClearTranscript => session.clear_transcript().await?,
        ClientMessage::SetMuted { muted } => session.set_muted(muted).await?,
        ClientMessage::SendText { text } => session.send_text(text).await?,
        ClientMessage::RetryInit => session.initialize().await?,
        ClientMessage::ProviderEvent { event, payload } => {
            if let Some(event) = ProviderEvent::from_wire(&event, payload) {
                provider_events
                    .send(event)
                    .await
                    .context("Call session stopped consuming provider events")?;
            }
        }
    }
    Ok(())
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
