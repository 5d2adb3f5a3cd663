//! Upstream event classification.
//!
//! `demux` turns one upstream text frame into an [`UpstreamEvent`]. It holds
//! no state; what the caller does with an event inside a response cycle is
//! described by [`UpstreamEvent::cycle_step`].

use crate::realtime_api::{AudioDeltaPayload, ErrorPayload};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

/// Normalized events produced from upstream frames.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    SessionCreated,
    SpeechStarted,
    SpeechStopped,
    /// Decoded PCM16 audio for the client.
    AudioDelta(Bytes),
    AudioDone,
    TranscriptText(String),
    Error(String),
    /// Any other tag, kept verbatim.
    Other(Value),
}

/// What a response-consumption loop does with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStep {
    /// Hand the event to the caller and keep reading.
    Emit,
    /// Log it and keep reading without handing it out.
    Skip,
    /// Hand the event to the caller, then stop reading.
    Finish,
}

impl UpstreamEvent {
    pub fn cycle_step(&self) -> CycleStep {
        match self {
            Self::AudioDone | Self::Error(_) => CycleStep::Finish,
            Self::SessionCreated | Self::SpeechStarted | Self::SpeechStopped => CycleStep::Skip,
            Self::AudioDelta(_) | Self::TranscriptText(_) | Self::Other(_) => CycleStep::Emit,
        }
    }
}

/// A frame that could not be turned into an event.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no string `type` tag")]
    MissingType,
    #[error("`{tag}` message is missing `{field}`")]
    MissingField { tag: String, field: &'static str },
    #[error("invalid base64 audio: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Classifies a single upstream text frame.
pub fn demux(text: &str) -> Result<UpstreamEvent, DecodeError> {
    let payload: Value = serde_json::from_str(text)?;
    let tag = payload
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;

    let event = match tag {
        "session.created" => UpstreamEvent::SessionCreated,
        "input_audio_buffer.speech_started" => UpstreamEvent::SpeechStarted,
        "input_audio_buffer.speech_stopped" => UpstreamEvent::SpeechStopped,
        "response.audio.done" => UpstreamEvent::AudioDone,
        "response.audio.delta" => {
            let delta = AudioDeltaPayload::deserialize(&payload)?;
            UpstreamEvent::AudioDelta(Bytes::from(BASE64.decode(delta.delta)?))
        }
        "error" => UpstreamEvent::Error(error_message(&payload)?),
        "response.audio_transcript.done"
        | "conversation.item.input_audio_transcription.completed" => {
            UpstreamEvent::TranscriptText(string_field(&payload, tag, "transcript")?)
        }
        "response.text.done" => UpstreamEvent::TranscriptText(string_field(&payload, tag, "text")?),
        _ => UpstreamEvent::Other(payload),
    };
    Ok(event)
}

fn error_message(payload: &Value) -> Result<String, DecodeError> {
    let parsed = ErrorPayload::deserialize(payload)?;
    let message = parsed
        .error
        .and_then(|detail| detail.message.or(detail.code))
        .or(parsed.message)
        .unwrap_or_else(|| "unknown upstream error".to_string());
    Ok(message)
}

fn string_field(payload: &Value, tag: &str, field: &'static str) -> Result<String, DecodeError> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| DecodeError::MissingField {
            tag: tag.to_string(),
            field,
        })
}
