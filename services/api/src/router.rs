//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application: the
//! health check, the REST passthroughs, and the two WebSocket endpoints.

use crate::{
    handlers,
    models::{ErrorResponse, StatusResponse, TokenRequest},
    state::AppState,
    ws::{self, audio_ws_handler, probe_ws_handler},
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::root,
        handlers::create_token,
        handlers::sdp_offer,
        handlers::chat_completions,
        ws::session::audio_ws_handler,
        ws::probe::probe_ws_handler,
    ),
    components(
        schemas(StatusResponse, TokenRequest, ErrorResponse)
    ),
    tags(
        (name = "Voice Relay API", description = "Browser audio relay to the OpenAI Realtime API")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/session", get(handlers::create_token))
        .route("/offer", post(handlers::sdp_offer))
        .route("/api/openai", post(handlers::chat_completions))
        .route("/ws/audio", get(audio_ws_handler))
        .route("/ws/test", get(probe_ws_handler))
        .with_state(app_state)
}
