//! Client factory: picks the transport for each carrier.
//!
//! Selection order, first match wins:
//! 1. REST API client when the required credentials are configured
//!    (FedEx: client id + secret; UPS: client id + secret, or the legacy
//!    access key; USPS and DHL: api key)
//! 2. headless browser, for carriers whose pages need JS rendering
//! 3. HTML scraping, always available as the terminal fallback

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use parceltrack_core::carrier::Carrier;
use parceltrack_core::config::{CarrierConfig, CarriersConfig};

use crate::api::{DhlApiClient, FedexApiClient, UpsApiClient, UspsApiClient};
use crate::headless::HeadlessClient;
use crate::scrape::ScrapingClient;
use crate::TrackingClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Api,
    Headless,
    Scraping,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Api => f.write_str("api"),
            Transport::Headless => f.write_str("headless"),
            Transport::Scraping => f.write_str("scraping"),
        }
    }
}

/// A selected client plus the transport that was chosen for it
#[derive(Clone)]
pub struct SelectedClient {
    pub client: Arc<dyn TrackingClient>,
    pub transport: Transport,
}

/// Per-carrier client registry built from a configuration snapshot
pub struct ClientFactory {
    ups: SelectedClient,
    usps: SelectedClient,
    fedex: SelectedClient,
    dhl: SelectedClient,
}

impl ClientFactory {
    pub fn new(config: &CarriersConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let factory = Self {
            ups: Self::build(Carrier::Ups, &config.ups, &http),
            usps: Self::build(Carrier::Usps, &config.usps, &http),
            fedex: Self::build(Carrier::Fedex, &config.fedex, &http),
            dhl: Self::build(Carrier::Dhl, &config.dhl, &http),
        };

        for carrier in Carrier::ALL {
            info!(
                carrier = %carrier,
                transport = %factory.select(carrier).transport,
                "Carrier client selected"
            );
        }
        factory
    }

    /// Whether the configured credentials are enough for the API transport
    pub fn has_api_credentials(carrier: Carrier, config: &CarrierConfig) -> bool {
        let has_oauth_pair = config.client_id.is_some() && config.client_secret.is_some();
        match carrier {
            Carrier::Fedex => has_oauth_pair,
            Carrier::Ups => has_oauth_pair || config.api_key.is_some(),
            Carrier::Usps | Carrier::Dhl => config.api_key.is_some(),
        }
    }

    fn build(carrier: Carrier, config: &CarrierConfig, http: &reqwest::Client) -> SelectedClient {
        if Self::has_api_credentials(carrier, config) {
            let client: Arc<dyn TrackingClient> = match carrier {
                Carrier::Ups => Arc::new(UpsApiClient::new(
                    http.clone(),
                    config.api_url.as_deref(),
                    config.client_id.as_deref(),
                    config.client_secret.as_deref(),
                    config.api_key.as_deref(),
                )),
                Carrier::Fedex => Arc::new(FedexApiClient::new(
                    http.clone(),
                    config.api_url.as_deref(),
                    config.client_id.as_deref().unwrap_or_default(),
                    config.client_secret.as_deref().unwrap_or_default(),
                )),
                Carrier::Usps => Arc::new(UspsApiClient::new(
                    http.clone(),
                    config.api_url.as_deref(),
                    config.api_key.as_deref().unwrap_or_default(),
                )),
                Carrier::Dhl => Arc::new(DhlApiClient::new(
                    http.clone(),
                    config.api_url.as_deref(),
                    config.api_key.as_deref().unwrap_or_default(),
                )),
            };
            return SelectedClient {
                client,
                transport: Transport::Api,
            };
        }

        if HeadlessClient::supports(carrier) {
            return SelectedClient {
                client: Arc::new(HeadlessClient::new(carrier)),
                transport: Transport::Headless,
            };
        }

        SelectedClient {
            client: Arc::new(ScrapingClient::new(http.clone(), carrier)),
            transport: Transport::Scraping,
        }
    }

    /// The client chosen for a carrier
    pub fn select(&self, carrier: Carrier) -> &SelectedClient {
        match carrier {
            Carrier::Ups => &self.ups,
            Carrier::Usps => &self.usps,
            Carrier::Fedex => &self.fedex,
            Carrier::Dhl => &self.dhl,
        }
    }

    pub fn transport(&self, carrier: Carrier) -> Transport {
        self.select(carrier).transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_config() -> CarriersConfig {
        CarriersConfig {
            ups: CarrierConfig::default(),
            usps: CarrierConfig::default(),
            fedex: CarrierConfig::default(),
            dhl: CarrierConfig::default(),
        }
    }

    #[test]
    fn test_no_credentials_falls_back() {
        let factory = ClientFactory::new(&empty_config());
        // JS-rendered pages go headless, the rest straight to scraping
        assert_eq!(factory.transport(Carrier::Ups), Transport::Headless);
        assert_eq!(factory.transport(Carrier::Fedex), Transport::Headless);
        assert_eq!(factory.transport(Carrier::Usps), Transport::Scraping);
        assert_eq!(factory.transport(Carrier::Dhl), Transport::Scraping);
    }

    #[test]
    fn test_api_keys_select_api_transport() {
        let mut config = empty_config();
        config.usps.api_key = Some("key".to_string());
        config.dhl.api_key = Some("key".to_string());
        config.fedex.client_id = Some("id".to_string());
        config.fedex.client_secret = Some("secret".to_string());

        let factory = ClientFactory::new(&config);
        assert_eq!(factory.transport(Carrier::Usps), Transport::Api);
        assert_eq!(factory.transport(Carrier::Dhl), Transport::Api);
        assert_eq!(factory.transport(Carrier::Fedex), Transport::Api);
        assert_eq!(factory.transport(Carrier::Ups), Transport::Headless);
    }

    #[test]
    fn test_ups_legacy_key_is_api() {
        let mut config = empty_config();
        config.ups.api_key = Some("legacy".to_string());
        let factory = ClientFactory::new(&config);
        assert_eq!(factory.transport(Carrier::Ups), Transport::Api);
    }

    #[test]
    fn test_fedex_requires_full_oauth_pair() {
        let mut config = empty_config();
        config.fedex.client_id = Some("id".to_string());
        // Secret missing: API transport unavailable
        assert!(!ClientFactory::has_api_credentials(
            Carrier::Fedex,
            &config.fedex
        ));
        let factory = ClientFactory::new(&config);
        assert_eq!(factory.transport(Carrier::Fedex), Transport::Headless);
    }

    #[test]
    fn test_selected_client_names() {
        let factory = ClientFactory::new(&empty_config());
        assert_eq!(factory.select(Carrier::Ups).client.carrier_name(), "UPS");
        assert_eq!(factory.select(Carrier::Dhl).client.carrier_name(), "DHL");
    }
}
