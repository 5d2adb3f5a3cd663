//! Axum Handlers for the REST API
//!
//! Health check plus thin passthroughs to the OpenAI REST API: ephemeral
//! token minting, WebRTC SDP negotiation and chat completions. All carry
//! `utoipa` annotations for OpenAPI generation.

use axum::{
    extract::State,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Json, Response},
};
use secrecy::ExposeSecret;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::{
    models::{ErrorResponse, StatusResponse, TokenRequest},
    state::AppState,
};

pub enum ApiError {
    BadGateway(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadGateway(message) => {
                (StatusCode::BAD_GATEWAY, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Report that the service is up.
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service is online", body = StatusResponse)
    )
)]
pub async fn root() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "online".to_string(),
        service: "Voice Relay API".to_string(),
    })
}

/// Mint an ephemeral realtime session token for direct browser use.
///
/// The upstream response body is passed through unchanged.
#[utoipa::path(
    get,
    path = "/session",
    responses(
        (status = 200, description = "Realtime session with a client secret"),
        (status = 502, description = "The realtime service rejected the request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn create_token(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let config = &state.config;
    let request = TokenRequest {
        model: config.realtime_model.clone(),
        voice: config.voice.clone(),
    };

    let response = state
        .http
        .post(&config.realtime_sessions_url)
        .bearer_auth(config.openai_api_key.expose_secret())
        .json(&request)
        .send()
        .await?;
    let response = ensure_success(response, "realtime sessions").await?;

    let body: Value = response.json().await?;
    info!(model = %request.model, "Issued realtime session token.");
    Ok(Json(body))
}

/// Exchange a WebRTC SDP offer for the realtime service's SDP answer.
#[utoipa::path(
    post,
    path = "/offer",
    request_body(content = String, content_type = "application/sdp", description = "SDP offer"),
    responses(
        (status = 200, description = "SDP answer", body = String, content_type = "application/sdp"),
        (status = 502, description = "The realtime service rejected the offer", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn sdp_offer(
    State(state): State<Arc<AppState>>,
    offer: String,
) -> Result<impl IntoResponse, ApiError> {
    let config = &state.config;
    debug!(bytes = offer.len(), "Forwarding SDP offer.");

    let response = state
        .http
        .post(&config.realtime_offer_url)
        .query(&[("model", config.realtime_model.as_str())])
        .bearer_auth(config.openai_api_key.expose_secret())
        .header(CONTENT_TYPE, SDP_CONTENT_TYPE)
        .body(offer)
        .send()
        .await?;
    let response = ensure_success(response, "realtime SDP").await?;

    let answer = response.text().await?;
    debug!(bytes = answer.len(), "Received SDP answer.");
    Ok(([(CONTENT_TYPE, SDP_CONTENT_TYPE)], answer))
}

/// Forward a chat completion request with the server's API key.
#[utoipa::path(
    post,
    path = "/api/openai",
    request_body(content = Object, description = "Chat completions request body"),
    responses(
        (status = 200, description = "Chat completions response"),
        (status = 502, description = "The chat completions endpoint rejected the request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let config = &state.config;
    let response = state
        .http
        .post(&config.chat_completions_url)
        .bearer_auth(config.openai_api_key.expose_secret())
        .json(&request)
        .send()
        .await?;
    let response = ensure_success(response, "chat completions").await?;
    Ok(Json(response.json().await?))
}

const SDP_CONTENT_TYPE: &str = "application/sdp";

/// Maps a non-2xx upstream reply to `502 Bad Gateway`.
async fn ensure_success(
    response: reqwest::Response,
    endpoint: &str,
) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(%status, %body, endpoint, "Upstream endpoint rejected request.");
    Err(ApiError::BadGateway(format!(
        "Upstream {} endpoint returned {}",
        endpoint, status
    )))
}
