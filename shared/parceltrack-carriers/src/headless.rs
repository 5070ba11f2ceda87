//! Headless-browser transport.
//!
//! Some carrier pages only render tracking state client-side. This client
//! launches a short-lived headless Chrome, loads the public tracking page,
//! takes the rendered HTML and runs it through the same parser as the
//! scraping transport. The browser is always closed, success or failure.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use futures::StreamExt;
use tracing::{debug, warn};

use parceltrack_core::carrier::Carrier;

use crate::error::CarrierError;
use crate::scrape::{parse_page, tracking_url};
use crate::types::{TrackingInfo, TrackingRequest, TrackingResponse};
use crate::validate;
use crate::TrackingClient;

/// Bound on one page load including client-side rendering
const PAGE_TIMEOUT: Duration = Duration::from_secs(45);

/// Settle time after navigation for the tracking app to paint
const RENDER_DELAY: Duration = Duration::from_secs(3);

pub struct HeadlessClient {
    carrier: Carrier,
}

impl HeadlessClient {
    pub fn new(carrier: Carrier) -> Self {
        Self { carrier }
    }

    /// Carriers whose tracking pages require JS rendering
    pub fn supports(carrier: Carrier) -> bool {
        matches!(carrier, Carrier::Ups | Carrier::Fedex)
    }

    fn browser_config(&self) -> Result<BrowserConfig, CarrierError> {
        let mut builder = BrowserConfig::builder()
            .incognito()
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--no-first-run")
            .arg("--mute-audio");

        if let Ok(chrome_path) = std::env::var("CHROME_PATH") {
            builder = builder.chrome_executable(chrome_path);
        }

        builder
            .build()
            .map_err(|e| CarrierError::transport(format!("browser config: {e}")))
    }

    async fn render_page(&self, tracking_number: &str) -> Result<String, CarrierError> {
        let url = tracking_url(self.carrier, tracking_number);
        debug!(carrier = %self.carrier, tracking_number, "Launching headless browser");

        let (mut browser, mut handler) = Browser::launch(self.browser_config()?)
            .await
            .map_err(|e| CarrierError::transport(format!("browser launch: {e}")))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let rendered = tokio::time::timeout(PAGE_TIMEOUT, async {
            let page = browser
                .new_page(url.as_str())
                .await
                .map_err(|e| CarrierError::transport(format!("page open: {e}")))?;
            page.wait_for_navigation()
                .await
                .map_err(|e| CarrierError::transport(format!("navigation: {e}")))?;
            tokio::time::sleep(RENDER_DELAY).await;
            page.content()
                .await
                .map_err(|e| CarrierError::transport(format!("page content: {e}")))
        })
        .await
        .unwrap_or_else(|_| {
            Err(CarrierError::timeout(format!(
                "headless page load exceeded {}s",
                PAGE_TIMEOUT.as_secs()
            )))
        });

        // The browser dies with us regardless of the page outcome
        if let Err(e) = browser.close().await {
            warn!(carrier = %self.carrier, "Failed to close headless browser: {e}");
        }
        let _ = browser.wait().await;
        handler_task.abort();

        rendered
    }

    async fn track_one(&self, tracking_number: &str) -> Result<TrackingInfo, CarrierError> {
        let html = self.render_page(tracking_number).await?;
        parse_page(self.carrier, &html, tracking_number)
    }
}

#[async_trait]
impl TrackingClient for HeadlessClient {
    async fn track(&self, request: &TrackingRequest) -> Result<TrackingResponse, CarrierError> {
        let mut results = Vec::with_capacity(request.tracking_numbers.len());
        for number in &request.tracking_numbers {
            results.push(self.track_one(number).await?);
        }
        Ok(TrackingResponse { results })
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validate::validate(self.carrier, tracking_number)
    }

    fn carrier_name(&self) -> &'static str {
        self.carrier.display_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_support_matrix() {
        assert!(HeadlessClient::supports(Carrier::Ups));
        assert!(HeadlessClient::supports(Carrier::Fedex));
        assert!(!HeadlessClient::supports(Carrier::Usps));
        assert!(!HeadlessClient::supports(Carrier::Dhl));
    }
}
