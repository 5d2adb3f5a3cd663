//! Diagnostic passthrough at `/ws/test`.
//!
//! Reports whether the realtime service accepts a session, then forwards each
//! client text frame upstream verbatim and answers with the next upstream frame.

use super::{
    protocol::ProbeStatus,
    provider::UpstreamFrame,
    relay::{ClientChannel, ClientFrame},
    session::upstream_from_config,
    upstream::UpstreamSession,
};
use crate::state::AppState;
use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Checks connectivity to the realtime service.
#[utoipa::path(
    get,
    path = "/ws/test",
    responses(
        (status = 101, description = "Switching to the diagnostic WebSocket protocol")
    )
)]
pub async fn probe_ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let upstream = upstream_from_config(&state.config);
        run_probe(socket, upstream).await;
    })
}

#[instrument(name = "probe_session", skip_all, fields(session_id = %Uuid::new_v4()))]
pub(crate) async fn run_probe<C: ClientChannel>(mut client: C, mut upstream: UpstreamSession) {
    let status = match upstream.connect().await {
        Ok(()) => ProbeStatus::Connected {
            message: "Connected to OpenAI successfully".to_string(),
        },
        Err(e) => {
            warn!(error = %e, "Probe could not reach the realtime service.");
            ProbeStatus::Error {
                message: e.to_string(),
            }
        }
    };
    let connected = matches!(status, ProbeStatus::Connected { .. });

    if send_status(&mut client, &status).await && connected {
        forward(&mut client, &mut upstream).await;
    }
    upstream.close(None).await;
    info!("Probe session finished.");
}

async fn forward<C: ClientChannel>(client: &mut C, upstream: &mut UpstreamSession) {
    loop {
        let text = match client.next_frame().await {
            Ok(Some(ClientFrame::Text(text))) => text,
            Ok(Some(ClientFrame::Binary(_))) => {
                warn!("Probe ignores binary frames.");
                continue;
            }
            Ok(None) | Err(_) => return,
        };
        if let Err(e) = upstream.send_raw(text).await {
            warn!(error = %e, "Probe could not forward message.");
            return;
        }
        let reply = match upstream.next_raw().await {
            Ok(UpstreamFrame::Text(text)) => ClientFrame::Text(text),
            Ok(UpstreamFrame::Binary(data)) => ClientFrame::Binary(data),
            Err(e) => {
                let status = ProbeStatus::Error {
                    message: e.to_string(),
                };
                send_status(client, &status).await;
                return;
            }
        };
        if client.send_frame(reply).await.is_err() {
            return;
        }
    }
}

async fn send_status<C: ClientChannel>(client: &mut C, status: &ProbeStatus) -> bool {
    let Ok(text) = serde_json::to_string(status) else {
        return false;
    };
    client.send_frame(ClientFrame::Text(text)).await.is_ok()
}
