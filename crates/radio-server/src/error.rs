//! Error handling for the broker server.

use axum::{http::StatusCode, response::IntoResponse, Json};
use radio_core::Error as BrokerError;
use serde_json::json;
use thiserror::Error;

/// Broker server error types
#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Invalid job id: {0}")]
    InvalidJobId(String),

    #[error("Invalid {header} header: {reason}")]
    InvalidHeader { header: &'static str, reason: String },

    #[error("Unsupported job filter: {0}")]
    UnsupportedFilter(String),

    #[error("Job {0} has no stored audio file")]
    NoAudioFile(uuid::Uuid),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] config::ConfigError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Broker(e) => broker_status(e),
            ServerError::InvalidJobId(_)
            | ServerError::InvalidHeader { .. }
            | ServerError::UnsupportedFilter(_) => StatusCode::BAD_REQUEST,
            ServerError::NoAudioFile(_) => StatusCode::NOT_FOUND,
            ServerError::ConfigError(_) | ServerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

fn broker_status(error: &BrokerError) -> StatusCode {
    match error {
        BrokerError::Malformed(_) | BrokerError::SignatureInvalid(_) | BrokerError::StaleOffer(_) => {
            StatusCode::BAD_REQUEST
        }
        BrokerError::JobNotFound(_) => StatusCode::NOT_FOUND,
        BrokerError::AlreadyCompleted { .. }
        | BrokerError::InvalidTransition { .. }
        | BrokerError::DuplicateJob(_)
        | BrokerError::IdempotencyConflict(_) => StatusCode::CONFLICT,
        BrokerError::DispatchFailure(_) => StatusCode::BAD_GATEWAY,
        BrokerError::StorageFailure(_)
        | BrokerError::InvalidConfig(_)
        | BrokerError::Io(_)
        | BrokerError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let error_message = match &self {
            ServerError::ConfigError(_) => "Configuration error".to_string(),
            _ if status == StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!("Request failed: {}", self);
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

/// Result type alias for server operations
pub type ServerResult<T> = Result<T, ServerError>;
