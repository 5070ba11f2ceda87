//! Carrier tracking clients for the ParcelTrack platform.
//!
//! Every transport (REST API, headless browser, HTML scraping) implements
//! the same [`TrackingClient`] contract; [`factory::ClientFactory`] picks
//! the best available transport for a carrier from the configured
//! credentials.

pub mod api;
pub mod error;
pub mod factory;
pub mod headless;
pub mod scrape;
pub mod status;
pub mod types;
pub mod validate;

use async_trait::async_trait;

pub use error::{CarrierError, CarrierErrorKind};
pub use factory::{ClientFactory, SelectedClient, Transport};
pub use types::{CarrierEvent, RateLimitInfo, TrackingInfo, TrackingRequest, TrackingResponse};

/// Unified tracking contract implemented by every transport
#[async_trait]
pub trait TrackingClient: Send + Sync {
    /// Fetch tracking state for a batch of numbers.
    ///
    /// Implementations accept any batch size and fan out internally when
    /// the upstream takes fewer numbers per call.
    async fn track(&self, request: &TrackingRequest) -> Result<TrackingResponse, CarrierError>;

    /// Format-only validation (length, prefix, check digit where applicable)
    fn validate_tracking_number(&self, tracking_number: &str) -> bool;

    fn carrier_name(&self) -> &'static str;

    /// Most recent upstream rate-limit observation, if the carrier reports one
    fn rate_limit_info(&self) -> Option<RateLimitInfo> {
        None
    }
}
