//! WebSocket Relay
//!
//! This module contains the real-time audio path between the browser and the
//! upstream realtime service. It is structured into submodules:
//!
//! - `protocol`: The JSON control messages exchanged with the browser.
//! - `provider`: The transport seam and the OpenAI WebSocket connector.
//! - `upstream`: Handshake, retry, audio submission and response cycles.
//! - `relay`: The per-connection state machine tying both sides together.
//! - `session`: Axum upgrade handler for `/ws/audio`.
//! - `probe`: The `/ws/test` diagnostic passthrough.

pub mod probe;
pub mod protocol;
pub mod provider;
pub mod relay;
pub mod session;
pub mod upstream;

pub use probe::probe_ws_handler;
pub use session::audio_ws_handler;
