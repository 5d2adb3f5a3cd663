//! Owns the upstream socket for one relay session.
//!
//! The session negotiates `session.update`/`session.created`, sends paced
//! audio as `append` + `commit` pairs, and exposes one response cycle at a
//! time as a stream of [`UpstreamEvent`]s.

use super::provider::{TransportError, UpstreamConnector, UpstreamFrame, UpstreamTransport};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use futures::{Stream, stream};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use voice_relay_core::{
    CycleStep, FlushPayload, RetryPolicy, UpstreamEvent, demux,
    realtime_api::{ClientEvent, SessionConfig},
};

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("could not encode session configuration: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("handshake rejected: expected `session.created`, got {0}")]
    Handshake(String),
    /// The upstream answered `session.update` with an `error` event, e.g. for
    /// a bad API key. Retrying cannot help.
    #[error("upstream rejected the session: {0}")]
    Rejected(String),
    #[error("upstream closed the connection during the handshake")]
    ClosedDuringHandshake,
    #[error("connect attempt exceeded the {0:?} budget")]
    TimedOut(Duration),
    #[error("giving up after {attempts} connection attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        last: Box<ConnectError>,
    },
}

impl ConnectError {
    /// Whether another attempt might succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_) | Self::Encode(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("upstream session is not connected")]
    NotConnected,
    #[error("could not encode upstream message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Faults while consuming upstream frames. All of them end the relay.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream session is not connected")]
    NotConnected,
    #[error("upstream closed the connection")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct UpstreamSession {
    connector: Box<dyn UpstreamConnector>,
    transport: Option<Box<dyn UpstreamTransport>>,
    session_config: SessionConfig,
    retry: RetryPolicy,
    connection_attempts: u32,
}

impl UpstreamSession {
    pub fn new(
        connector: Box<dyn UpstreamConnector>,
        session_config: SessionConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            connector,
            transport: None,
            session_config,
            retry,
            connection_attempts: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Attempts made by the most recent `connect` call.
    pub fn connection_attempts(&self) -> u32 {
        self.connection_attempts
    }

    /// Connects and negotiates the session, retrying per the retry policy.
    #[instrument(name = "upstream_connect", skip_all)]
    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.is_connected() {
            return Ok(());
        }
        let started = Instant::now();
        self.connection_attempts = 0;

        loop {
            self.connection_attempts += 1;
            let attempt = self.connection_attempts;
            let remaining = self.retry.total_budget.saturating_sub(started.elapsed());

            let attempt_fut = handshake(&*self.connector, &self.session_config);
            let error = match tokio::time::timeout(remaining, attempt_fut).await {
                Ok(Ok(transport)) => {
                    self.transport = Some(transport);
                    info!(attempt, "Upstream session created.");
                    return Ok(());
                }
                Ok(Err(e)) => e,
                Err(_) => ConnectError::TimedOut(self.retry.total_budget),
            };

            let delay = self.retry.delay_after(attempt);
            if !error.is_transient()
                || !self.retry.should_retry(attempt)
                || !self.retry.fits_budget(started.elapsed(), delay)
            {
                warn!(attempt, error = %error, "Upstream connect failed, giving up.");
                return Err(ConnectError::Exhausted {
                    attempts: attempt,
                    last: Box::new(error),
                });
            }
            warn!(
                attempt,
                max_attempts = self.retry.max_attempts,
                retry_in = ?delay,
                error = %error,
                "Upstream connect failed, retrying."
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Sends one paced audio segment as `append` followed by `commit`.
    pub async fn send_audio_chunk(&mut self, audio: &[u8]) -> Result<(), SendError> {
        let transport = self.transport.as_deref_mut().ok_or(SendError::NotConnected)?;
        send_audio(transport, audio).await
    }

    /// Consumes one response cycle.
    ///
    /// Binary frames are yielded as raw audio. Text frames go through
    /// [`demux`]; malformed ones are skipped. The stream ends after yielding
    /// `AudioDone` or `Error`, or after yielding a fault when the connection
    /// breaks.
    pub fn receive_events(
        &mut self,
    ) -> impl Stream<Item = Result<UpstreamEvent, UpstreamError>> + Send + '_ {
        let start = match self.transport.as_deref_mut() {
            Some(transport) => Cycle::Reading(transport),
            None => Cycle::NotConnected,
        };
        stream::unfold(start, |cycle| async move {
            let transport = match cycle {
                Cycle::Reading(transport) => transport,
                Cycle::NotConnected => return Some((Err(UpstreamError::NotConnected), Cycle::Done)),
                Cycle::Done => return None,
            };
            loop {
                let text = match transport.next_frame().await {
                    Ok(Some(UpstreamFrame::Text(text))) => text,
                    Ok(Some(UpstreamFrame::Binary(audio))) => {
                        return Some((Ok(UpstreamEvent::AudioDelta(audio)), Cycle::Reading(transport)));
                    }
                    Ok(None) => return Some((Err(UpstreamError::Closed), Cycle::Done)),
                    Err(e) => return Some((Err(e.into()), Cycle::Done)),
                };
                let event = match demux(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "Skipping malformed upstream frame.");
                        continue;
                    }
                };
                match event.cycle_step() {
                    CycleStep::Emit => return Some((Ok(event), Cycle::Reading(transport))),
                    CycleStep::Finish => return Some((Ok(event), Cycle::Done)),
                    CycleStep::Skip => match event {
                        UpstreamEvent::SpeechStarted => info!("Upstream detected speech start."),
                        UpstreamEvent::SpeechStopped => info!("Upstream detected speech stop."),
                        other => debug!(event = ?other, "Ignoring event outside the handshake."),
                    },
                }
            }
        })
    }

    /// Forwards a client-authored message to the upstream unchanged.
    pub async fn send_raw(&mut self, text: String) -> Result<(), SendError> {
        let transport = self.transport.as_deref_mut().ok_or(SendError::NotConnected)?;
        transport.send_text(text).await?;
        Ok(())
    }

    /// Next upstream frame without classification.
    pub async fn next_raw(&mut self) -> Result<UpstreamFrame, UpstreamError> {
        let transport = self
            .transport
            .as_deref_mut()
            .ok_or(UpstreamError::NotConnected)?;
        transport.next_frame().await?.ok_or(UpstreamError::Closed)
    }

    /// Flushes `pending` audio (best effort) and closes the socket.
    ///
    /// Calling it again after the socket is gone does nothing.
    pub async fn close(&mut self, pending: Option<FlushPayload>) {
        let Some(mut transport) = self.transport.take() else {
            debug!("Upstream session already closed.");
            return;
        };
        if let Some(payload) = pending {
            debug!(bytes = payload.len(), "Flushing trailing audio before close.");
            if let Err(e) = send_audio(transport.as_mut(), &payload).await {
                warn!(error = %e, "Could not flush trailing audio.");
            }
        }
        if let Err(e) = transport.close().await {
            debug!(error = %e, "Ignoring error while closing upstream socket.");
        }
        info!("Upstream session closed.");
    }
}

enum Cycle<'a> {
    Reading(&'a mut (dyn UpstreamTransport + 'static)),
    NotConnected,
    Done,
}

/// One connect attempt: open the socket, send `session.update` and wait for
/// exactly one reply, which must be `session.created`.
async fn handshake(
    connector: &dyn UpstreamConnector,
    session: &SessionConfig,
) -> Result<Box<dyn UpstreamTransport>, ConnectError> {
    let mut transport = connector.connect().await?;
    match negotiate(transport.as_mut(), session).await {
        Ok(()) => Ok(transport),
        Err(e) => {
            if let Err(close_err) = transport.close().await {
                debug!(error = %close_err, "Ignoring close error after failed handshake.");
            }
            Err(e)
        }
    }
}

async fn negotiate(
    transport: &mut dyn UpstreamTransport,
    session: &SessionConfig,
) -> Result<(), ConnectError> {
    let update = ClientEvent::SessionUpdate {
        session: session.clone(),
    };
    transport.send_text(serde_json::to_string(&update)?).await?;

    match transport.next_frame().await? {
        None => Err(ConnectError::ClosedDuringHandshake),
        Some(UpstreamFrame::Binary(data)) => Err(ConnectError::Handshake(format!(
            "a {}-byte binary frame",
            data.len()
        ))),
        Some(UpstreamFrame::Text(text)) => match demux(&text) {
            Ok(UpstreamEvent::SessionCreated) => Ok(()),
            Ok(UpstreamEvent::Error(message)) => Err(ConnectError::Rejected(message)),
            Ok(other) => Err(ConnectError::Handshake(format!("{:?}", other))),
            Err(e) => Err(ConnectError::Handshake(e.to_string())),
        },
    }
}

async fn send_audio(transport: &mut dyn UpstreamTransport, audio: &[u8]) -> Result<(), SendError> {
    let append = ClientEvent::InputAudioBufferAppend {
        audio: BASE64.encode(audio),
    };
    transport.send_text(serde_json::to_string(&append)?).await?;
    transport
        .send_text(serde_json::to_string(&ClientEvent::InputAudioBufferCommit)?)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::provider::{
        MockUpstreamConnector,
        testing::{OnceConnector, ScriptedTransport, default_session_update},
    };
    use bytes::Bytes;
    use futures::StreamExt;
    use serde_json::{Value, json};

    fn session_with(connector: impl UpstreamConnector + 'static) -> UpstreamSession {
        UpstreamSession::new(
            Box::new(connector),
            SessionConfig::default(),
            RetryPolicy::default(),
        )
    }

    async fn connected(transport: ScriptedTransport) -> UpstreamSession {
        let mut session = session_with(OnceConnector::new(transport));
        session.connect().await.expect("handshake should succeed");
        session
    }

    async fn collect(session: &mut UpstreamSession) -> Vec<Result<UpstreamEvent, UpstreamError>> {
        session.receive_events().collect().await
    }

    #[tokio::test]
    async fn test_connect_sends_session_update_and_accepts_session_created() {
        let (transport, recorded) = ScriptedTransport::accepting();
        let session = connected(transport).await;

        assert!(session.is_connected());
        assert_eq!(session.connection_attempts(), 1);
        assert_eq!(recorded.lock().unwrap().sent, vec![default_session_update()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_rejects_other_handshake_tags() {
        let mut connector = MockUpstreamConnector::new();
        connector.expect_connect().times(3).returning(|| {
            let (transport, _) = ScriptedTransport::new();
            Ok(Box::new(transport.text(r#"{"type":"session.updated"}"#)))
        });
        let mut session = session_with(connector);

        let err = session.connect().await.unwrap_err();
        match err {
            ConnectError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ConnectError::Handshake(_)));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert!(!session.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_three_times_within_budget() {
        let mut connector = MockUpstreamConnector::new();
        connector
            .expect_connect()
            .times(3)
            .returning(|| Err(TransportError::Request("connection refused".to_string())));
        let mut session = session_with(connector);
        let policy = RetryPolicy::default();

        let started = Instant::now();
        let err = session.connect().await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, ConnectError::Exhausted { attempts: 3, .. }));
        assert_eq!(session.connection_attempts(), 3);
        assert!(elapsed >= policy.total_backoff(), "waited only {elapsed:?}");
        assert!(elapsed <= policy.total_budget, "waited {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_recovers_after_transient_failure() {
        let mut seq = mockall::Sequence::new();
        let mut connector = MockUpstreamConnector::new();
        connector
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(TransportError::Closed));
        let (transport, recorded) = ScriptedTransport::accepting();
        connector
            .expect_connect()
            .times(1)
            .in_sequence(&mut seq)
            .return_once(move || Ok(Box::new(transport)));
        let mut session = session_with(connector);

        let started = Instant::now();
        session.connect().await.expect("second attempt should succeed");

        assert_eq!(session.connection_attempts(), 2);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(recorded.lock().unwrap().sent.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_handshake_closes_the_socket() {
        let (transport, recorded) = ScriptedTransport::new();
        let transport = transport.text(r#"{"type":"error","error":{"message":"bad key"}}"#);
        let mut session = UpstreamSession::new(
            Box::new(OnceConnector::new(transport)),
            SessionConfig::default(),
            RetryPolicy::with_max_attempts(1),
        );

        let err = session.connect().await.unwrap_err();
        assert!(err.to_string().contains("bad key"), "{err}");
        assert_eq!(recorded.lock().unwrap().close_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_does_not_retry_a_rejected_session() {
        let mut connector = MockUpstreamConnector::new();
        connector.expect_connect().times(1).returning(|| {
            let (transport, _) = ScriptedTransport::new();
            Ok(Box::new(transport.text(
                r#"{"type":"error","error":{"message":"Incorrect API key provided"}}"#,
            )))
        });
        let mut session = session_with(connector);

        let started = Instant::now();
        let err = session.connect().await.unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(session.connection_attempts(), 1);
        match err {
            ConnectError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 1);
                assert!(matches!(*last, ConnectError::Rejected(ref m) if m.contains("API key")));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(ConnectError::Transport(TransportError::Closed).is_transient());
        assert!(ConnectError::Handshake("session.updated".to_string()).is_transient());
        assert!(ConnectError::ClosedDuringHandshake.is_transient());
        assert!(!ConnectError::Rejected("bad key".to_string()).is_transient());
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (transport, _) = ScriptedTransport::accepting();
        let mut session = session_with(OnceConnector::new(transport));

        let err = session.send_audio_chunk(&[0, 1]).await.unwrap_err();
        assert!(matches!(err, SendError::NotConnected));

        session.connect().await.unwrap();
        session.close(None).await;
        let err = session.send_audio_chunk(&[0, 1]).await.unwrap_err();
        assert!(matches!(err, SendError::NotConnected));
    }

    #[tokio::test]
    async fn test_send_audio_chunk_appends_then_commits() {
        let (transport, recorded) = ScriptedTransport::accepting();
        let mut session = connected(transport).await;

        session.send_audio_chunk(&[1, 2, 3]).await.unwrap();

        let sent = recorded.lock().unwrap().sent.clone();
        assert_eq!(sent.len(), 3);
        let append: Value = serde_json::from_str(&sent[1]).unwrap();
        let commit: Value = serde_json::from_str(&sent[2]).unwrap();
        assert_eq!(append, json!({ "type": "input_audio_buffer.append", "audio": "AQID" }));
        assert_eq!(commit, json!({ "type": "input_audio_buffer.commit" }));
    }

    #[tokio::test]
    async fn test_receive_events_yields_audio_and_stops_at_done() {
        let (transport, _) = ScriptedTransport::accepting();
        let transport = transport
            .text(r#"{"type":"input_audio_buffer.speech_started"}"#)
            .text(r#"{"type":"response.audio.delta","delta":"AQID"}"#)
            .text("{ not json")
            .binary(&[9, 9])
            .text(r#"{"type":"response.audio_transcript.done","transcript":"hello"}"#)
            .text(r#"{"type":"response.audio.done"}"#)
            .text(r#"{"type":"response.audio.delta","delta":"BAUG"}"#);
        let mut session = connected(transport).await;

        let events: Vec<UpstreamEvent> = collect(&mut session)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(
            events,
            vec![
                UpstreamEvent::AudioDelta(Bytes::from_static(&[1, 2, 3])),
                UpstreamEvent::AudioDelta(Bytes::from_static(&[9, 9])),
                UpstreamEvent::TranscriptText("hello".to_string()),
                UpstreamEvent::AudioDone,
            ]
        );

        // The frame after `response.audio.done` belongs to the next cycle.
        let next: Vec<UpstreamEvent> = collect(&mut session)
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect();
        assert_eq!(next[0], UpstreamEvent::AudioDelta(Bytes::from_static(&[4, 5, 6])));
    }

    #[tokio::test]
    async fn test_receive_events_stops_at_error() {
        let (transport, _) = ScriptedTransport::accepting();
        let transport = transport
            .text(r#"{"type":"error","error":{"message":"boom"}}"#)
            .text(r#"{"type":"response.audio.delta","delta":"AQID"}"#);
        let mut session = connected(transport).await;

        let events = collect(&mut session).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap(), &UpstreamEvent::Error("boom".to_string()));
    }

    #[tokio::test]
    async fn test_receive_events_propagates_connection_loss() {
        let (transport, _) = ScriptedTransport::accepting();
        let transport = transport.text(r#"{"type":"response.created"}"#);
        let mut session = connected(transport).await;

        let events = collect(&mut session).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Ok(UpstreamEvent::Other(_))));
        assert!(matches!(events[1], Err(UpstreamError::Closed)));

        let (transport, _) = ScriptedTransport::accepting();
        let transport = transport.fault(TransportError::KeepaliveTimeout(Duration::from_secs(20)));
        let mut session = connected(transport).await;
        let events = collect(&mut session).await;
        assert!(matches!(
            events.as_slice(),
            [Err(UpstreamError::Transport(TransportError::KeepaliveTimeout(_)))]
        ));
    }

    #[tokio::test]
    async fn test_receive_events_without_connection() {
        let (transport, _) = ScriptedTransport::accepting();
        let mut session = session_with(OnceConnector::new(transport));
        let events = collect(&mut session).await;
        assert!(matches!(events.as_slice(), [Err(UpstreamError::NotConnected)]));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_flushes_pending_audio() {
        let (transport, recorded) = ScriptedTransport::accepting();
        let mut session = connected(transport).await;
        let mut pacer = voice_relay_core::AudioPacer::new(voice_relay_core::REALTIME_SAMPLE_RATE);
        assert!(pacer.ingest(&[1, 2, 3]).is_none());

        session.close(pacer.drain()).await;
        session.close(None).await;

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.close_calls, 1);
        // session.update, then the drained append + commit
        assert_eq!(recorded.sent.len(), 3);
        assert!(recorded.sent[1].contains("AQID"));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_close_swallows_flush_errors() {
        let (transport, recorded) = ScriptedTransport::accepting();
        let mut session = connected(transport.failing_sends_after(1)).await;

        let mut pacer = voice_relay_core::AudioPacer::new(voice_relay_core::REALTIME_SAMPLE_RATE);
        pacer.ingest(&[0u8; 64]);
        session.close(pacer.drain()).await;

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.sent.len(), 1);
        assert_eq!(recorded.close_calls, 1);
        assert!(!session.is_connected());
    }
}
