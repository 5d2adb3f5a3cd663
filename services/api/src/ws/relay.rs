//! Per-connection relay between one browser socket and one upstream session.
//!
//! A `RelaySession` walks `Idle → Accepted → ConnectingUpstream → Ready →
//! Relaying → Closing → Closed`. Every path out of the relay goes through
//! [`RelaySession::shutdown`], which closes the upstream exactly once.
//!
//! While a response cycle is being forwarded the client socket is still
//! watched: pings are answered, audio is queued until the cycle ends, and a
//! hang-up abandons the cycle.

use super::{
    protocol::{ClientMessage, ConnectionStatus, ServerMessage},
    upstream::{ConnectError, SendError, UpstreamError, UpstreamSession},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::{collections::VecDeque, pin::pin};
use tracing::{debug, error, info, warn};
use voice_relay_core::{AudioPacer, FlushPayload, UpstreamEvent};

/// A frame exchanged with the browser client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Text(String),
    Binary(Bytes),
}

#[derive(Debug, thiserror::Error)]
#[error("client socket error: {0}")]
pub struct ClientError(pub String);

/// The browser-facing side of a relay.
#[async_trait]
pub trait ClientChannel: Send {
    /// Next data frame. `Ok(None)` means the client went away.
    ///
    /// Must be cancel safe: the relay races it against upstream reads.
    async fn next_frame(&mut self) -> Result<Option<ClientFrame>, ClientError>;

    async fn send_frame(&mut self, frame: ClientFrame) -> Result<(), ClientError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Accepted,
    ConnectingUpstream,
    Ready,
    Relaying,
    Closing,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to connect to the realtime service: {0}")]
    Connect(#[from] ConnectError),
    #[error("Failed to send audio to the realtime service: {0}")]
    Send(#[from] SendError),
    #[error("Realtime service connection failed: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("client disconnected")]
    ClientDisconnected,
}

/// How a relay ended.
#[derive(Debug)]
pub struct RelayReport {
    pub final_state: RelayState,
    pub connection_attempts: u32,
    /// `Ok` when the client hung up; otherwise the fault that ended the relay.
    pub result: Result<(), RelayError>,
}

pub struct RelaySession<C> {
    client: C,
    upstream: UpstreamSession,
    pacer: AudioPacer,
    state: RelayState,
    client_writable: bool,
    /// Client audio that arrived during a response cycle, oldest first.
    queued_audio: VecDeque<Bytes>,
}

impl<C: ClientChannel> RelaySession<C> {
    pub fn new(client: C, upstream: UpstreamSession, pacer: AudioPacer) -> Self {
        Self {
            client,
            upstream,
            pacer,
            state: RelayState::Idle,
            client_writable: true,
            queued_audio: VecDeque::new(),
        }
    }

    /// Drives the session to `Closed`.
    pub async fn run(mut self) -> RelayReport {
        self.transition(RelayState::Accepted);
        let result = match self.establish().await {
            Ok(()) => self.relay().await,
            Err(e) => Err(e),
        };
        let result = self.shutdown(result).await;
        RelayReport {
            final_state: self.state,
            connection_attempts: self.upstream.connection_attempts(),
            result,
        }
    }

    async fn establish(&mut self) -> Result<(), RelayError> {
        self.send(ServerMessage::ConnectionStatus {
            status: ConnectionStatus::WebsocketConnected,
        })
        .await?;

        self.transition(RelayState::ConnectingUpstream);
        self.upstream.connect().await?;

        self.transition(RelayState::Ready);
        self.send(ServerMessage::ConnectionStatus {
            status: ConnectionStatus::Ready,
        })
        .await
    }

    async fn relay(&mut self) -> Result<(), RelayError> {
        self.transition(RelayState::Relaying);
        loop {
            let frame = match self.queued_audio.pop_front() {
                Some(audio) => ClientFrame::Binary(audio),
                None => match self.client.next_frame().await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => return Err(self.client_gone()),
                    Err(e) => {
                        debug!(error = %e, "Client read failed.");
                        return Err(self.client_gone());
                    }
                },
            };
            match frame {
                ClientFrame::Binary(audio) => {
                    if let Some(payload) = self.pacer.ingest(&audio) {
                        self.flush(payload).await?;
                    }
                }
                ClientFrame::Text(text) => {
                    if let Some(reply) = control_reply(&text) {
                        self.send(reply).await?;
                    }
                }
            }
        }
    }

    /// Sends one paced segment and forwards the complete upstream response
    /// before any further client audio is paced.
    async fn flush(&mut self, payload: FlushPayload) -> Result<(), RelayError> {
        debug!(bytes = payload.len(), "Sending audio segment upstream.");
        if let Err(e) = self.upstream.send_audio_chunk(&payload).await {
            self.pacer.restore(payload);
            return Err(e.into());
        }

        let mut events = pin!(self.upstream.receive_events());
        loop {
            let event = tokio::select! {
                biased;
                event = events.next() => match event {
                    Some(event) => event?,
                    None => return Ok(()),
                },
                frame = self.client.next_frame() => {
                    let reply = match frame {
                        Ok(Some(ClientFrame::Binary(audio))) => {
                            self.queued_audio.push_back(audio);
                            None
                        }
                        Ok(Some(ClientFrame::Text(text))) => control_reply(&text),
                        Ok(None) => {
                            debug!("Client left during a response cycle.");
                            self.client_writable = false;
                            return Err(RelayError::ClientDisconnected);
                        }
                        Err(e) => {
                            debug!(error = %e, "Client read failed during a response cycle.");
                            self.client_writable = false;
                            return Err(RelayError::ClientDisconnected);
                        }
                    };
                    if let Some(reply) = reply {
                        if let Err(e) = self.client.send_frame(encode(&reply)).await {
                            debug!(error = %e, "Client write failed mid-response.");
                            self.client_writable = false;
                            return Err(RelayError::ClientDisconnected);
                        }
                    }
                    continue;
                }
            };
            let frame = match event {
                UpstreamEvent::AudioDelta(audio) => ClientFrame::Binary(audio),
                UpstreamEvent::TranscriptText(text) => {
                    encode(&ServerMessage::Transcript { text })
                }
                UpstreamEvent::Error(message) => {
                    warn!(%message, "Upstream reported an error.");
                    encode(&ServerMessage::Error { message })
                }
                UpstreamEvent::Other(payload) => ClientFrame::Text(payload.to_string()),
                UpstreamEvent::AudioDone => {
                    debug!("Upstream response audio complete.");
                    continue;
                }
                UpstreamEvent::SessionCreated
                | UpstreamEvent::SpeechStarted
                | UpstreamEvent::SpeechStopped => continue,
            };
            if let Err(e) = self.client.send_frame(frame).await {
                debug!(error = %e, "Client write failed mid-response.");
                self.client_writable = false;
                return Err(RelayError::ClientDisconnected);
            }
        }
    }

    /// Reports the fault (when the client can still hear it) and releases the
    /// upstream. Runs once per session.
    async fn shutdown(&mut self, result: Result<(), RelayError>) -> Result<(), RelayError> {
        self.transition(RelayState::Closing);
        let result = match result {
            Ok(()) | Err(RelayError::ClientDisconnected) => {
                info!("Client disconnected.");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Relay session failed.");
                if self.client_writable {
                    let notice = ServerMessage::Error {
                        message: e.to_string(),
                    };
                    if let Err(send_err) = self.send(notice).await {
                        debug!(error = %send_err, "Could not report failure to client.");
                    }
                }
                Err(e)
            }
        };

        // Audio queued behind an unfinished cycle joins the trailing flush.
        for audio in self.queued_audio.drain(..) {
            if let Some(payload) = self.pacer.ingest(&audio) {
                self.pacer.restore(payload);
            }
        }
        let pending = self.pacer.drain();
        self.upstream.close(pending).await;
        self.transition(RelayState::Closed);
        result
    }

    async fn send(&mut self, message: ServerMessage) -> Result<(), RelayError> {
        if let Err(e) = self.client.send_frame(encode(&message)).await {
            debug!(error = %e, "Client write failed.");
            return Err(self.client_gone());
        }
        Ok(())
    }

    fn client_gone(&mut self) -> RelayError {
        self.client_writable = false;
        RelayError::ClientDisconnected
    }

    fn transition(&mut self, next: RelayState) {
        debug!(from = ?self.state, to = ?next, "Relay state transition.");
        self.state = next;
    }
}

/// The reply owed to a client control message, if any.
fn control_reply(text: &str) -> Option<ServerMessage> {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Ping) => Some(ServerMessage::Pong),
        Err(e) => {
            warn!(error = %e, "Ignoring unrecognised client message.");
            None
        }
    }
}

fn encode(message: &ServerMessage) -> ClientFrame {
    // `ServerMessage` has only string and enum fields, so serialization cannot fail.
    let text = serde_json::to_string(message).unwrap_or_default();
    ClientFrame::Text(text)
}
