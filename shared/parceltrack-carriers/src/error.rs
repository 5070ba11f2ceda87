//! Carrier error taxonomy.
//!
//! Every transport failure is classified into a kind plus retryability
//! flags; the refresh engine uses the classification to decide counter
//! updates and the HTTP layer uses it for status codes.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierErrorKind {
    NotFound,
    RateLimited,
    Auth,
    Transport,
    BotDetected,
    ParseFailure,
    Timeout,
    Unknown,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CarrierError {
    pub kind: CarrierErrorKind,
    pub retryable: bool,
    pub rate_limited: bool,
    pub message: String,
}

impl CarrierError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            kind: CarrierErrorKind::NotFound,
            retryable: false,
            rate_limited: false,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: CarrierErrorKind::RateLimited,
            retryable: true,
            rate_limited: true,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            kind: CarrierErrorKind::Auth,
            retryable: false,
            rate_limited: false,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            kind: CarrierErrorKind::Transport,
            retryable: true,
            rate_limited: false,
            message: message.into(),
        }
    }

    pub fn bot_detected(message: impl Into<String>) -> Self {
        Self {
            kind: CarrierErrorKind::BotDetected,
            retryable: false,
            rate_limited: false,
            message: message.into(),
        }
    }

    pub fn parse_failure(message: impl Into<String>) -> Self {
        Self {
            kind: CarrierErrorKind::ParseFailure,
            retryable: false,
            rate_limited: false,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: CarrierErrorKind::Timeout,
            retryable: true,
            rate_limited: false,
            message: message.into(),
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            kind: CarrierErrorKind::Unknown,
            retryable: false,
            rate_limited: false,
            message: message.into(),
        }
    }

    /// Classify an HTTP status from a carrier endpoint
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        match status.as_u16() {
            401 | 403 => Self::auth(format!("carrier returned {status}: {body}")),
            404 => Self::not_found(format!("carrier returned 404: {body}")),
            429 => Self::rate_limited(format!("carrier returned 429: {body}")),
            500..=599 => Self::transport(format!("carrier returned {status}: {body}")),
            _ => Self::unknown(format!("carrier returned {status}: {body}")),
        }
    }
}

impl From<reqwest::Error> for CarrierError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(format!("carrier request timed out: {err}"))
        } else if err.is_connect() {
            Self::transport(format!("carrier connection failed: {err}"))
        } else if err.is_decode() {
            Self::parse_failure(format!("carrier response undecodable: {err}"))
        } else {
            Self::transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let err = CarrierError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(err.kind, CarrierErrorKind::RateLimited);
        assert!(err.retryable);
        assert!(err.rate_limited);

        let err = CarrierError::from_status(reqwest::StatusCode::UNAUTHORIZED, "");
        assert_eq!(err.kind, CarrierErrorKind::Auth);
        assert!(!err.retryable);

        let err = CarrierError::from_status(reqwest::StatusCode::BAD_GATEWAY, "");
        assert_eq!(err.kind, CarrierErrorKind::Transport);
        assert!(err.retryable);
    }

    #[test]
    fn test_bot_detected_not_retryable() {
        let err = CarrierError::bot_detected("challenge page");
        assert!(!err.retryable);
        assert!(!err.rate_limited);
    }
}
