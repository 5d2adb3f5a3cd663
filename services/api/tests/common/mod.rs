//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use secrecy::SecretString;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::Level;
use voice_relay_api::{config::Config, router::create_router, state::AppState};
use voice_relay_core::realtime_api::TurnDetection;

pub const TEST_API_KEY: &str = "test-key";
pub const TEST_MODEL: &str = "gpt-4o-realtime-preview-2024-10-01";

/// A configuration pointing the realtime socket and every HTTP endpoint at
/// local mocks. `http_base` is the origin of the mocked REST API.
pub fn test_config(realtime_url: &str, http_base: &str) -> Config {
    Config {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        openai_api_key: SecretString::from(TEST_API_KEY.to_string()),
        realtime_url: realtime_url.to_string(),
        realtime_model: TEST_MODEL.to_string(),
        realtime_sessions_url: format!("{http_base}/v1/realtime/sessions"),
        realtime_offer_url: format!("{http_base}/v1/realtime"),
        chat_completions_url: format!("{http_base}/v1/chat/completions"),
        voice: "alloy".to_string(),
        transcription_model: "whisper-1".to_string(),
        instructions: None,
        turn_detection: TurnDetection::default(),
        ping_interval: Duration::from_secs(20),
        ping_timeout: Duration::from_secs(20),
        connect_attempts: 1,
        cors_allowed_origin: "http://localhost:3000".to_string(),
        log_level: Level::DEBUG,
    }
}

pub fn test_state(config: Config) -> Arc<AppState> {
    Arc::new(AppState::new(config))
}

/// Serves the full router on an ephemeral port.
pub async fn spawn_app(config: Config) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(test_state(config));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
