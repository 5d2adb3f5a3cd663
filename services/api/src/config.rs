use secrecy::SecretString;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;
use voice_relay_core::{
    RetryPolicy,
    realtime_api::{AudioTranscription, SessionConfig, TurnDetection},
};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub openai_api_key: SecretString,
    pub realtime_url: String,
    pub realtime_model: String,
    pub realtime_sessions_url: String,
    /// HTTP endpoint answering WebRTC SDP offers.
    pub realtime_offer_url: String,
    pub chat_completions_url: String,
    pub voice: String,
    pub transcription_model: String,
    pub instructions: Option<String>,
    pub turn_detection: TurnDetection,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub connect_attempts: u32,
    pub cors_allowed_origin: String,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address = parse_var("BIND_ADDRESS", "0.0.0.0:8000")?;

        let openai_api_key = std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        let realtime_url = var_or("REALTIME_URL", "wss://api.openai.com/v1/realtime");
        let realtime_model = var_or("REALTIME_MODEL", "gpt-4o-realtime-preview-2024-10-01");
        let realtime_sessions_url = var_or(
            "REALTIME_SESSIONS_URL",
            "https://api.openai.com/v1/realtime/sessions",
        );
        let realtime_offer_url = var_or("REALTIME_OFFER_URL", "https://api.openai.com/v1/realtime");
        let chat_completions_url = var_or(
            "CHAT_COMPLETIONS_URL",
            "https://api.openai.com/v1/chat/completions",
        );
        let voice = var_or("REALTIME_VOICE", "alloy");
        let transcription_model = var_or("TRANSCRIPTION_MODEL", "whisper-1");
        let instructions = std::env::var("SESSION_INSTRUCTIONS")
            .ok()
            .filter(|text| !text.trim().is_empty());

        let defaults = TurnDetection::default();
        let threshold: f32 = parse_var("VAD_THRESHOLD", &defaults.threshold.to_string())?;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::InvalidValue(
                "VAD_THRESHOLD".to_string(),
                format!("{} is outside 0.0..=1.0", threshold),
            ));
        }
        let turn_detection = TurnDetection {
            threshold,
            prefix_padding_ms: parse_var(
                "VAD_PREFIX_PADDING_MS",
                &defaults.prefix_padding_ms.to_string(),
            )?,
            silence_duration_ms: parse_var(
                "VAD_SILENCE_DURATION_MS",
                &defaults.silence_duration_ms.to_string(),
            )?,
            create_response: true,
        };

        let ping_interval = Duration::from_secs(parse_positive("UPSTREAM_PING_INTERVAL_SECS", 20)?);
        let ping_timeout = Duration::from_secs(parse_positive("UPSTREAM_PING_TIMEOUT_SECS", 20)?);
        let connect_attempts = parse_positive("UPSTREAM_CONNECT_ATTEMPTS", 3)? as u32;

        let cors_allowed_origin = var_or("CORS_ALLOWED_ORIGIN", "http://localhost:3000");

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            openai_api_key,
            realtime_url,
            realtime_model,
            realtime_sessions_url,
            realtime_offer_url,
            chat_completions_url,
            voice,
            transcription_model,
            instructions,
            turn_detection,
            ping_interval,
            ping_timeout,
            connect_attempts,
            cors_allowed_origin,
            log_level,
        })
    }

    /// Full upstream WebSocket URL including the `model` query parameter.
    pub fn upstream_url(&self) -> String {
        let separator = if self.realtime_url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.realtime_url, separator, self.realtime_model)
    }

    /// Session parameters negotiated with the upstream on every connect.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            voice: self.voice.clone(),
            instructions: self.instructions.clone(),
            input_audio_transcription: AudioTranscription {
                model: self.transcription_model.clone(),
            },
            turn_detection: self.turn_detection.clone(),
            ..Default::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_max_attempts(self.connect_attempts)
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T>(name: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = var_or(name, default);
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))
}

fn parse_positive(name: &str, default: u64) -> Result<u64, ConfigError> {
    let value: u64 = parse_var(name, &default.to_string())?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            name.to_string(),
            "must be greater than zero".to_string(),
        ));
    }
    Ok(value)
}
