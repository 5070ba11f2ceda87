//! Core domain types and configuration for the ParcelTrack platform.

pub mod carrier;
pub mod config;
pub mod domain;
pub mod error;
pub mod rate_limit;

pub use carrier::{Carrier, ShipmentStatus};
pub use config::Config;
pub use error::{CoreError, Result};
