//! API Models
//!
//! Request and response bodies of the HTTP endpoints, annotated for OpenAPI
//! generation with `utoipa`.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct StatusResponse {
    #[schema(example = "online")]
    pub status: String,
    #[schema(example = "Voice Relay API")]
    pub service: String,
}

/// Body sent to the realtime sessions endpoint when minting a client token.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct TokenRequest {
    #[schema(example = "gpt-4o-realtime-preview-2024-10-01")]
    pub model: String,
    #[schema(example = "alloy")]
    pub voice: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ErrorResponse {
    pub message: String,
}
