//! Wire vocabulary of the upstream realtime speech API.
//!
//! Outbound messages are modelled as a tagged `ClientEvent` enum. Inbound
//! messages are classified by [`crate::events::demux`], which only needs the
//! payload structs below for the tags it understands.

use serde::{Deserialize, Serialize};

/// Messages sent to the upstream service.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Negotiates modalities, voice, formats, transcription and turn detection.
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },
    /// Appends base64 PCM16 audio to the upstream input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend { audio: String },
    /// Marks the end of the appended segment.
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,
}

/// Session parameters sent in `session.update`.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub modalities: Vec<Modality>,
    pub voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    pub input_audio_transcription: AudioTranscription,
    pub turn_detection: TurnDetection,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modalities: vec![Modality::Text, Modality::Audio],
            voice: "alloy".to_string(),
            instructions: None,
            input_audio_format: AudioFormat::Pcm16,
            output_audio_format: AudioFormat::Pcm16,
            input_audio_transcription: AudioTranscription {
                model: "whisper-1".to_string(),
            },
            turn_detection: TurnDetection::default(),
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    #[serde(rename = "pcm16")]
    Pcm16,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AudioTranscription {
    pub model: String,
}

/// Server-side voice activity detection.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename = "server_vad")]
pub struct TurnDetection {
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
    pub create_response: bool,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
            create_response: true,
        }
    }
}

/// Payload of `response.audio.delta`.
#[derive(Deserialize, Debug)]
pub(crate) struct AudioDeltaPayload {
    pub delta: String,
}

/// Payload of `error`. The service nests details under `error`; some
/// gateways flatten the message to the top level.
#[derive(Deserialize, Debug)]
pub(crate) struct ErrorPayload {
    #[serde(default)]
    pub error: Option<ErrorDetail>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct ErrorDetail {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_update_shape() {
        let event = ClientEvent::SessionUpdate {
            session: SessionConfig::default(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "session.update",
                "session": {
                    "modalities": ["text", "audio"],
                    "voice": "alloy",
                    "input_audio_format": "pcm16",
                    "output_audio_format": "pcm16",
                    "input_audio_transcription": { "model": "whisper-1" },
                    "turn_detection": {
                        "type": "server_vad",
                        "threshold": 0.5,
                        "prefix_padding_ms": 300,
                        "silence_duration_ms": 500,
                        "create_response": true
                    }
                }
            })
        );
    }

    #[test]
    fn test_instructions_are_sent_when_present() {
        let session = SessionConfig {
            instructions: Some("Collect the patient's history.".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["instructions"], "Collect the patient's history.");
    }

    #[test]
    fn test_audio_buffer_messages() {
        let append = ClientEvent::InputAudioBufferAppend {
            audio: "AQID".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&append).unwrap(),
            json!({ "type": "input_audio_buffer.append", "audio": "AQID" })
        );
        assert_eq!(
            serde_json::to_value(&ClientEvent::InputAudioBufferCommit).unwrap(),
            json!({ "type": "input_audio_buffer.commit" })
        );
    }
}
