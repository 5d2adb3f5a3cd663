//! Voice Relay API Library Crate
//!
//! This library contains the web service that relays browser audio to the
//! OpenAI Realtime API: configuration, application state, HTTP handlers,
//! WebSocket relay logic, and routing. The `api` binary is a thin wrapper
//! around this library.

pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
