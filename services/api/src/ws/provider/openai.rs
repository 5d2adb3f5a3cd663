//! WebSocket transport to the OpenAI Realtime API.

use super::{TransportError, UpstreamConnector, UpstreamFrame, UpstreamTransport};
use crate::config::Config;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{
            HeaderValue,
            header::{AUTHORIZATION, ORIGIN},
        },
        protocol::Message as WsMessage,
    },
};
use tracing::{debug, info};

/// Connection-health parameters for the upstream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Idle time after which a Ping is sent.
    pub ping_interval: Duration,
    /// How long to wait for any frame after a Ping before giving up.
    pub ping_timeout: Duration,
}

/// Opens authenticated connections to the realtime endpoint.
pub struct OpenAiConnector {
    url: String,
    api_key: SecretString,
    keepalive: Keepalive,
}

impl OpenAiConnector {
    pub fn new(url: String, api_key: SecretString, keepalive: Keepalive) -> Self {
        Self {
            url,
            api_key,
            keepalive,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.upstream_url(),
            SecretString::from(config.openai_api_key.expose_secret().to_owned()),
            Keepalive {
                ping_interval: config.ping_interval,
                ping_timeout: config.ping_timeout,
            },
        )
    }
}

#[async_trait]
impl UpstreamConnector for OpenAiConnector {
    async fn connect(&self) -> Result<Box<dyn UpstreamTransport>, TransportError> {
        let mut request = self.url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key.expose_secret()))
            .map_err(|_| TransportError::Request("API key is not a valid header value".into()))?;
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, bearer);
        headers.insert("openai-beta", HeaderValue::from_static("realtime=v1"));
        headers.insert(ORIGIN, HeaderValue::from_static("https://api.openai.com"));

        let (ws_stream, response) = connect_async(request).await?;
        info!(status = %response.status(), "Connected to realtime WebSocket.");
        Ok(Box::new(WsTransport::new(ws_stream, self.keepalive)))
    }
}

/// A tungstenite stream with idle pings.
pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    keepalive: Keepalive,
    awaiting_pong: bool,
}

impl WsTransport {
    pub fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>, keepalive: Keepalive) -> Self {
        Self {
            stream,
            keepalive,
            awaiting_pong: false,
        }
    }
}

#[async_trait]
impl UpstreamTransport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<UpstreamFrame>, TransportError> {
        loop {
            let wait = if self.awaiting_pong {
                self.keepalive.ping_timeout
            } else {
                self.keepalive.ping_interval
            };
            let next = match tokio::time::timeout(wait, self.stream.next()).await {
                Ok(next) => next,
                Err(_) if self.awaiting_pong => return Err(TransportError::KeepaliveTimeout(wait)),
                Err(_) => {
                    debug!("Upstream idle, sending keepalive ping.");
                    self.stream.send(WsMessage::Ping(Bytes::new())).await?;
                    self.awaiting_pong = true;
                    continue;
                }
            };
            // Any inbound traffic proves the connection is alive.
            self.awaiting_pong = false;

            match next {
                None => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(Some(UpstreamFrame::Text(text.as_str().to_owned())));
                }
                Some(Ok(WsMessage::Binary(data))) => return Ok(Some(UpstreamFrame::Binary(data))),
                Some(Ok(WsMessage::Close(close_frame))) => {
                    info!(?close_frame, "Upstream sent close frame.");
                    return Ok(None);
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.close(None).await?;
        Ok(())
    }
}
