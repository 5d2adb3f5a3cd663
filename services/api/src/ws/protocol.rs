//! Defines the WebSocket message protocol between the browser client and the relay.

use serde::{Deserialize, Serialize};

/// Text control messages sent from the client (browser) to the relay.
/// Audio travels separately as binary frames.
#[derive(Deserialize, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Liveness check; answered immediately with `pong`.
    Ping,
}

/// Text messages sent from the relay to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Progress of the connection setup.
    ConnectionStatus { status: ConnectionStatus },
    /// Text of the user's or the assistant's speech.
    Transcript { text: String },
    /// Reply to a client `ping`.
    Pong,
    /// Reports an upstream or relay failure to the client.
    Error { message: String },
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// The client socket was accepted; the upstream is not ready yet.
    WebsocketConnected,
    /// The upstream session is negotiated and audio may flow.
    Ready,
}

/// Status messages of the `/ws/test` probe endpoint.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProbeStatus {
    Connected { message: String },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ping_deserialization() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"shout"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("ping").is_err());
    }

    #[test]
    fn test_server_message_serialization() {
        let cases = [
            (
                ServerMessage::ConnectionStatus {
                    status: ConnectionStatus::WebsocketConnected,
                },
                json!({ "type": "connection_status", "status": "websocket_connected" }),
            ),
            (
                ServerMessage::ConnectionStatus {
                    status: ConnectionStatus::Ready,
                },
                json!({ "type": "connection_status", "status": "ready" }),
            ),
            (
                ServerMessage::Transcript {
                    text: "Any allergies?".to_string(),
                },
                json!({ "type": "transcript", "text": "Any allergies?" }),
            ),
            (ServerMessage::Pong, json!({ "type": "pong" })),
            (
                ServerMessage::Error {
                    message: "boom".to_string(),
                },
                json!({ "type": "error", "message": "boom" }),
            ),
        ];
        for (message, expected) in cases {
            assert_eq!(serde_json::to_value(&message).unwrap(), expected);
        }
    }

    #[test]
    fn test_probe_status_serialization() {
        let status = ProbeStatus::Error {
            message: "Failed to connect to OpenAI".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({ "status": "error", "message": "Failed to connect to OpenAI" })
        );
    }
}
