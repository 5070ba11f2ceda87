//! USPS Tracking API client (API-key authenticated).
//!
//! The upstream accepts one number per call; batches fan out internally.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use parceltrack_core::carrier::{Carrier, ShipmentStatus};

use crate::api::error_from_response;
use crate::error::CarrierError;
use crate::status::map_status;
use crate::types::{CarrierEvent, TrackingInfo, TrackingRequest, TrackingResponse};
use crate::validate;
use crate::TrackingClient;

pub const DEFAULT_BASE_URL: &str = "https://apis.usps.com";

pub struct UspsApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl UspsApiClient {
    pub fn new(http: reqwest::Client, base_url: Option<&str>, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    async fn track_one(&self, tracking_number: &str) -> Result<TrackingInfo, CarrierError> {
        let url = format!("{}/tracking/v3/tracking/{tracking_number}", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("expand", "DETAIL")])
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let parsed: UspsTrackResponse = response
            .json()
            .await
            .map_err(|e| CarrierError::parse_failure(format!("USPS response: {e}")))?;
        to_tracking_info(tracking_number, parsed)
    }
}

#[async_trait]
impl TrackingClient for UspsApiClient {
    async fn track(&self, request: &TrackingRequest) -> Result<TrackingResponse, CarrierError> {
        let mut results = Vec::with_capacity(request.tracking_numbers.len());
        for number in &request.tracking_numbers {
            results.push(self.track_one(number).await?);
        }
        Ok(TrackingResponse { results })
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validate::validate(Carrier::Usps, tracking_number)
    }

    fn carrier_name(&self) -> &'static str {
        "USPS"
    }
}

// ---- wire format ----

#[derive(Debug, Default, Deserialize)]
struct UspsTrackResponse {
    #[serde(rename = "trackingNumber", default)]
    tracking_number: Option<String>,
    #[serde(rename = "statusSummary", default)]
    status_summary: Option<String>,
    #[serde(rename = "statusCategory", default)]
    status_category: Option<String>,
    #[serde(rename = "expectedDeliveryTimeStamp", default)]
    expected_delivery_timestamp: Option<String>,
    #[serde(rename = "mailClass", default)]
    mail_class: Option<String>,
    #[serde(rename = "trackingEvents", default)]
    tracking_events: Vec<UspsTrackingEvent>,
}

#[derive(Debug, Default, Deserialize)]
struct UspsTrackingEvent {
    #[serde(rename = "eventTimestamp", default)]
    event_timestamp: Option<String>,
    #[serde(rename = "eventType", default)]
    event_type: Option<String>,
    #[serde(rename = "eventCity", default)]
    event_city: Option<String>,
    #[serde(rename = "eventState", default)]
    event_state: Option<String>,
}

fn parse_usps_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn to_tracking_info(
    tracking_number: &str,
    response: UspsTrackResponse,
) -> Result<TrackingInfo, CarrierError> {
    if response.tracking_events.is_empty() {
        return Err(CarrierError::not_found(format!(
            "USPS returned no events for {tracking_number}"
        )));
    }

    let events: Vec<CarrierEvent> = response
        .tracking_events
        .iter()
        .filter_map(|event| {
            let timestamp = event.event_timestamp.as_deref().and_then(parse_usps_timestamp)?;
            let description = event.event_type.clone().unwrap_or_default();
            Some(CarrierEvent {
                timestamp,
                status: map_status(Carrier::Usps, &description),
                description,
                location: match (&event.event_city, &event.event_state) {
                    (Some(city), Some(state)) => format!("{city}, {state}"),
                    (Some(city), None) => city.clone(),
                    (None, Some(state)) => state.clone(),
                    (None, None) => String::new(),
                },
                details: None,
            })
        })
        .collect();

    // statusCategory is coarse ("Delivered", "In Transit"); the summary
    // carries the richer text when present
    let status_text = response
        .status_summary
        .as_deref()
        .or(response.status_category.as_deref())
        .unwrap_or("");
    let status = match map_status(Carrier::Usps, status_text) {
        ShipmentStatus::Unknown => events
            .first()
            .map(|event| event.status)
            .unwrap_or(ShipmentStatus::Unknown),
        mapped => mapped,
    };

    let mut info = TrackingInfo::new(tracking_number, status);
    info.service_type = response.mail_class;
    let expected = response
        .expected_delivery_timestamp
        .as_deref()
        .and_then(parse_usps_timestamp);
    if status.is_delivered() {
        info.actual_delivery = events.first().map(|event| event.timestamp);
    } else {
        info.estimated_delivery = expected;
    }
    info.events = events;
    Ok(info)
}
