//! Upgrades browser connections and hands them to a relay.

use super::{
    provider::openai::OpenAiConnector,
    relay::{ClientChannel, ClientError, ClientFrame, RelaySession},
    upstream::UpstreamSession,
};
use crate::{config::Config, state::AppState};
use async_trait::async_trait;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use voice_relay_core::{AudioPacer, REALTIME_SAMPLE_RATE};

#[async_trait]
impl ClientChannel for WebSocket {
    async fn next_frame(&mut self) -> Result<Option<ClientFrame>, ClientError> {
        loop {
            let message = match self.recv().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(ClientError(e.to_string())),
                Some(Ok(message)) => message,
            };
            match message {
                Message::Text(text) => return Ok(Some(ClientFrame::Text(text.as_str().to_owned()))),
                Message::Binary(data) => return Ok(Some(ClientFrame::Binary(data))),
                Message::Close(frame) => {
                    debug!(?frame, "Client sent close frame.");
                    return Ok(None);
                }
                // axum answers pings itself.
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }

    async fn send_frame(&mut self, frame: ClientFrame) -> Result<(), ClientError> {
        let message = match frame {
            ClientFrame::Text(text) => Message::Text(text.into()),
            ClientFrame::Binary(data) => Message::Binary(data),
        };
        self.send(message)
            .await
            .map_err(|e| ClientError(e.to_string()))
    }
}

/// Builds the upstream half of a relay from the service configuration.
pub(crate) fn upstream_from_config(config: &Config) -> UpstreamSession {
    UpstreamSession::new(
        Box::new(OpenAiConnector::from_config(config)),
        config.session_config(),
        config.retry_policy(),
    )
}

/// Relays browser microphone audio to the realtime service and streams the
/// spoken responses back.
#[utoipa::path(
    get,
    path = "/ws/audio",
    responses(
        (status = 101, description = "Switching to the audio relay WebSocket protocol")
    )
)]
pub async fn audio_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(|socket| handle_audio_socket(socket, state))
}

#[instrument(name = "relay_session", skip_all, fields(session_id = %Uuid::new_v4()))]
async fn handle_audio_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("Client connected to audio relay.");
    let upstream = upstream_from_config(&state.config);
    let pacer = AudioPacer::new(REALTIME_SAMPLE_RATE);

    let report = RelaySession::new(socket, upstream, pacer).run().await;
    info!(
        final_state = ?report.final_state,
        connection_attempts = report.connection_attempts,
        failed = report.result.is_err(),
        "Relay session finished."
    );
}
