//! DHL Unified Tracking API client.
//!
//! API-key authenticated, one number per call. DHL reports daily quota
//! headers on every response; the latest observation is kept for the
//! scheduler's rate-limit awareness.

use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use serde::Deserialize;

use parceltrack_core::carrier::{Carrier, ShipmentStatus};

use crate::api::error_from_response;
use crate::error::CarrierError;
use crate::status::map_status;
use crate::types::{CarrierEvent, RateLimitInfo, TrackingInfo, TrackingRequest, TrackingResponse};
use crate::validate;
use crate::TrackingClient;

pub const DEFAULT_BASE_URL: &str = "https://api-eu.dhl.com";

pub struct DhlApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    last_rate_limit: RwLock<Option<RateLimitInfo>>,
}

impl DhlApiClient {
    pub fn new(http: reqwest::Client, base_url: Option<&str>, api_key: &str) -> Self {
        Self {
            http,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            last_rate_limit: RwLock::new(None),
        }
    }

    fn record_rate_limit(&self, headers: &reqwest::header::HeaderMap) {
        let parse_header = |name: &str| -> Option<i64> {
            headers.get(name)?.to_str().ok()?.trim().parse().ok()
        };
        let (Some(limit), Some(remaining)) =
            (parse_header("ratelimit-limit"), parse_header("ratelimit-remaining"))
        else {
            return;
        };
        let reset_time = parse_header("ratelimit-reset")
            .map(|seconds| Utc::now() + TimeDelta::seconds(seconds));

        if let Ok(mut guard) = self.last_rate_limit.write() {
            *guard = Some(RateLimitInfo {
                limit,
                remaining,
                reset_time,
            });
        }
    }

    async fn track_one(&self, tracking_number: &str) -> Result<TrackingInfo, CarrierError> {
        let url = format!("{}/track/shipments", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("trackingNumber", tracking_number)])
            .header("DHL-API-Key", &self.api_key)
            .send()
            .await?;

        self.record_rate_limit(response.headers());

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let parsed: DhlTrackResponse = response
            .json()
            .await
            .map_err(|e| CarrierError::parse_failure(format!("DHL response: {e}")))?;
        to_tracking_info(tracking_number, parsed)
    }
}

#[async_trait]
impl TrackingClient for DhlApiClient {
    async fn track(&self, request: &TrackingRequest) -> Result<TrackingResponse, CarrierError> {
        let mut results = Vec::with_capacity(request.tracking_numbers.len());
        for number in &request.tracking_numbers {
            results.push(self.track_one(number).await?);
        }
        Ok(TrackingResponse { results })
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validate::validate(Carrier::Dhl, tracking_number)
    }

    fn carrier_name(&self) -> &'static str {
        "DHL"
    }

    fn rate_limit_info(&self) -> Option<RateLimitInfo> {
        self.last_rate_limit.read().ok().and_then(|guard| *guard)
    }
}

// ---- wire format ----

#[derive(Debug, Default, Deserialize)]
struct DhlTrackResponse {
    #[serde(default)]
    shipments: Vec<DhlShipment>,
}

#[derive(Debug, Default, Deserialize)]
struct DhlShipment {
    #[serde(default)]
    status: Option<DhlEvent>,
    #[serde(rename = "estimatedTimeOfDelivery", default)]
    estimated_time_of_delivery: Option<String>,
    #[serde(default)]
    service: Option<String>,
    #[serde(default)]
    details: Option<DhlDetails>,
    #[serde(default)]
    events: Vec<DhlEvent>,
}

#[derive(Debug, Default, Deserialize)]
struct DhlDetails {
    #[serde(default)]
    weight: Option<DhlWeight>,
}

#[derive(Debug, Default, Deserialize)]
struct DhlWeight {
    #[serde(default)]
    value: Option<f64>,
    #[serde(rename = "unitText", default)]
    unit_text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DhlEvent {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "statusCode", default)]
    status_code: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    location: Option<DhlLocation>,
}

#[derive(Debug, Default, Deserialize)]
struct DhlLocation {
    #[serde(default)]
    address: Option<DhlAddress>,
}

#[derive(Debug, Default, Deserialize)]
struct DhlAddress {
    #[serde(rename = "addressLocality", default)]
    address_locality: Option<String>,
}

/// DHL mixes full RFC 3339, offset-free, and date-only timestamps
fn parse_dhl_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn map_dhl_event_status(event: &DhlEvent) -> ShipmentStatus {
    let code = event.status_code.as_deref().unwrap_or("");
    match map_status(Carrier::Dhl, code) {
        ShipmentStatus::Unknown => {
            let text = event
                .status
                .as_deref()
                .or(event.description.as_deref())
                .unwrap_or("");
            map_status(Carrier::Dhl, text)
        }
        mapped => mapped,
    }
}

fn to_tracking_info(
    tracking_number: &str,
    response: DhlTrackResponse,
) -> Result<TrackingInfo, CarrierError> {
    let shipment = response.shipments.into_iter().next().ok_or_else(|| {
        CarrierError::not_found(format!("DHL returned no shipment for {tracking_number}"))
    })?;

    let events: Vec<CarrierEvent> = shipment
        .events
        .iter()
        .filter_map(|event| {
            let timestamp = event.timestamp.as_deref().and_then(parse_dhl_timestamp)?;
            Some(CarrierEvent {
                timestamp,
                status: map_dhl_event_status(event),
                description: event
                    .description
                    .clone()
                    .or_else(|| event.status.clone())
                    .unwrap_or_default(),
                location: event
                    .location
                    .as_ref()
                    .and_then(|l| l.address.as_ref())
                    .and_then(|a| a.address_locality.clone())
                    .unwrap_or_default(),
                details: None,
            })
        })
        .collect();

    if events.is_empty() {
        return Err(CarrierError::not_found(format!(
            "DHL returned no events for {tracking_number}"
        )));
    }

    let status = shipment
        .status
        .as_ref()
        .map(map_dhl_event_status)
        .unwrap_or_else(|| events.first().map(|event| event.status).unwrap_or(ShipmentStatus::Unknown));

    let mut info = TrackingInfo::new(tracking_number, status);
    info.service_type = shipment.service;
    info.weight = shipment.details.and_then(|details| {
        let weight = details.weight?;
        let value = weight.value?;
        Some(match weight.unit_text {
            Some(unit) => format!("{value} {unit}"),
            None => value.to_string(),
        })
    });
    if status.is_delivered() {
        info.actual_delivery = shipment
            .status
            .as_ref()
            .and_then(|s| s.timestamp.as_deref())
            .and_then(parse_dhl_timestamp)
            .or_else(|| events.first().map(|event| event.timestamp));
    } else {
        info.estimated_delivery = shipment
            .estimated_time_of_delivery
            .as_deref()
            .and_then(parse_dhl_timestamp);
    }
    info.events = events;
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "shipments": [{
            "id": "1234567890",
            "service": "express",
            "status": {
                "timestamp": "2026-03-01T10:15:00",
                "statusCode": "transit",
                "status": "WITH DELIVERY COURIER",
                "description": "With delivery courier"
            },
            "estimatedTimeOfDelivery": "2026-03-02",
            "details": {"weight": {"value": 1.2, "unitText": "kg"}},
            "events": [
                {
                    "timestamp": "2026-03-01T10:15:00",
                    "statusCode": "transit",
                    "description": "With delivery courier",
                    "location": {"address": {"addressLocality": "LEIPZIG"}}
                },
                {
                    "timestamp": "2026-02-28T22:01:00",
                    "statusCode": "transit",
                    "description": "Arrived at DHL hub",
                    "location": {"address": {"addressLocality": "LEIPZIG"}}
                }
            ]
        }]
    }"#;

    #[test]
    fn test_parse_sample_response() {
        let parsed: DhlTrackResponse = serde_json::from_str(SAMPLE).unwrap();
        let info = to_tracking_info("1234567890", parsed).unwrap();

        assert_eq!(info.status, ShipmentStatus::InTransit);
        assert_eq!(info.events.len(), 2);
        assert_eq!(info.events[0].location, "LEIPZIG");
        assert_eq!(info.weight.as_deref(), Some("1.2 kg"));
        assert!(info.estimated_delivery.is_some());
    }

    #[test]
    fn test_empty_shipments_is_not_found() {
        let parsed: DhlTrackResponse = serde_json::from_str(r#"{"shipments": []}"#).unwrap();
        let err = to_tracking_info("1234567890", parsed).unwrap_err();
        assert_eq!(err.kind, crate::error::CarrierErrorKind::NotFound);
    }

    #[test]
    fn test_date_only_timestamp() {
        let parsed = parse_dhl_timestamp("2026-03-02").unwrap();
        assert_eq!(parsed, "2026-03-02T00:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }
}
