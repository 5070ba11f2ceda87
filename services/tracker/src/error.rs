//! Error types for the tracker service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use parceltrack_carriers::{CarrierError, CarrierErrorKind};
use parceltrack_store::StoreError;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Tracker service error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Duplicate shipment: {0}")]
    Duplicate(String),

    #[error("Rate limited, retry in {remaining_seconds}s")]
    RateLimited { remaining_seconds: i64 },

    #[error("Carrier error: {0}")]
    Carrier(#[from] CarrierError),

    #[error("Database error: {0}")]
    Store(StoreError),

    #[error("Mail error: {0}")]
    Mail(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Error::NotFound(what),
            StoreError::Duplicate(what) => Error::Duplicate(what),
            other => Error::Store(other),
        }
    }
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Duplicate(_) => StatusCode::CONFLICT,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Carrier(carrier) => match carrier.kind {
                CarrierErrorKind::RateLimited | CarrierErrorKind::Timeout => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::BAD_GATEWAY,
            },
            Error::Store(_) | Error::Mail(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Internal error: {:?}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let mut body = json!({
            "error": message,
            "code": status.as_u16()
        });
        if let Error::RateLimited { remaining_seconds } = &self {
            body["remaining_time"] = json!(remaining_seconds);
        }

        (status, Json(body)).into_response()
    }
}
