//! A [`VoiceProvider`] whose SDK lives in the connected browser.

use super::protocol::ProviderCommand;
use agrivoice_core::{
    context::SessionConfig,
    error::RawProviderError,
    provider::{StartFuture, VoiceProvider},
};
use secrecy::ExposeSecret;
use serde_json::Value;
use std::future;
use tokio::sync::mpsc;
use tracing::warn;

/// Forwards provider commands to the browser.
///
/// Commands travel on their own unbounded channel, separate from snapshots,
/// so a slow client delays them but never loses them.
pub(crate) struct SocketProvider {
    commands: mpsc::UnboundedSender<ProviderCommand>,
}

impl SocketProvider {
    pub(crate) fn new(commands: mpsc::UnboundedSender<ProviderCommand>) -> Self {
        Self { commands }
    }

    fn command(&self, command: ProviderCommand) {
        if self.commands.send(command).is_err() {
            warn!("Client connection closed; provider command not delivered.");
        }
    }
}

impl VoiceProvider for SocketProvider {
    fn start(&mut self, config: &SessionConfig) -> StartFuture {
        let command = ProviderCommand::Start {
            provider_key: config.provider_key().expose_secret().to_string(),
            agent_id: config.agent_id().to_string(),
        };
        let queued = self.commands.send(command).map_err(|_| {
            RawProviderError::from_message("client disconnected before the call started")
        });
        Box::pin(future::ready(queued))
    }

    fn stop(&mut self) {
        self.command(ProviderCommand::Stop);
    }

    fn set_muted(&mut self, muted: bool) {
        self.command(ProviderCommand::SetMuted { muted });
    }

    fn send(&mut self, message: Value) {
        self.command(ProviderCommand::Send { message });
    }
}
