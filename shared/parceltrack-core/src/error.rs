//! Error types shared by the ParcelTrack crates

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown carrier: {0}")]
    UnknownCarrier(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
