use thiserror::Error;

use crate::EntityId;

/// Errors surfaced by the mirror
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned error status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Authorization rejected after token refresh")]
    Unauthorized,

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing field `{0}`")]
    MissingField(String),

    #[error("Unknown actuator {0}")]
    UnknownActuator(EntityId),

    #[error("State `{state}` is not valid for actuator {actuator_id}")]
    InvalidState { actuator_id: EntityId, state: String },

    #[error("Telemetry transport error: {0}")]
    Transport(#[from] anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
