//! REST API clients for carriers that offer one.
//!
//! UPS and FedEx authenticate with OAuth client-credentials; USPS and DHL
//! take a static API key. All four share the retry rule for expired
//! tokens: exactly one refresh-and-retry per 401/403.

mod dhl;
mod fedex;
mod oauth;
mod ups;
mod usps;

pub use dhl::DhlApiClient;
pub use fedex::FedexApiClient;
pub(crate) use oauth::OAuthTokenManager;
pub use ups::UpsApiClient;
pub use usps::UspsApiClient;

use crate::error::CarrierError;

/// Turn a non-success carrier response into a classified error
pub(crate) async fn error_from_response(response: reqwest::Response) -> CarrierError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    CarrierError::from_status(status, &snippet)
}
