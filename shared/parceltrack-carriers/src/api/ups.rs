//! UPS Track API client.
//!
//! Prefers OAuth client-credentials; falls back to the legacy access
//! license key when only `UPS_API_KEY` is configured. One tracking number
//! per upstream call.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::Deserialize;
use tracing::debug;

use parceltrack_core::carrier::Carrier;

use crate::api::{error_from_response, OAuthTokenManager};
use crate::error::CarrierError;
use crate::status::map_status;
use crate::types::{CarrierEvent, TrackingInfo, TrackingRequest, TrackingResponse};
use crate::validate;
use crate::TrackingClient;

pub const DEFAULT_BASE_URL: &str = "https://onlinetools.ups.com";

pub struct UpsApiClient {
    http: reqwest::Client,
    base_url: String,
    oauth: Option<OAuthTokenManager>,
    legacy_api_key: Option<String>,
}

impl UpsApiClient {
    pub fn new(
        http: reqwest::Client,
        base_url: Option<&str>,
        client_id: Option<&str>,
        client_secret: Option<&str>,
        legacy_api_key: Option<&str>,
    ) -> Self {
        let base_url = base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string();
        let oauth = match (client_id, client_secret) {
            (Some(id), Some(secret)) => Some(OAuthTokenManager::new(
                format!("{base_url}/security/v1/oauth/token"),
                id,
                secret,
                true,
            )),
            _ => None,
        };

        Self {
            http,
            base_url,
            oauth,
            legacy_api_key: legacy_api_key.map(str::to_string),
        }
    }

    async fn track_one(&self, tracking_number: &str) -> Result<TrackingInfo, CarrierError> {
        let url = format!("{}/api/track/v1/details/{tracking_number}", self.base_url);
        let mut refreshed = false;

        loop {
            let mut request = self
                .http
                .get(&url)
                .query(&[("locale", "en_US"), ("returnSignature", "false")])
                .header("transId", tracking_number)
                .header("transactionSrc", "parceltrack");

            request = match (&self.oauth, &self.legacy_api_key) {
                (Some(oauth), _) => request.bearer_auth(oauth.bearer(&self.http).await?),
                (None, Some(key)) => request.header("AccessLicenseNumber", key),
                (None, None) => request,
            };

            let response = request.send().await?;
            let status = response.status();

            // Expired token: refresh exactly once, then surface auth
            if matches!(status.as_u16(), 401 | 403) {
                if let (Some(oauth), false) = (&self.oauth, refreshed) {
                    debug!(tracking_number, "UPS token rejected, refreshing once");
                    oauth.force_refresh(&self.http).await?;
                    refreshed = true;
                    continue;
                }
                return Err(error_from_response(response).await);
            }
            if !status.is_success() {
                return Err(error_from_response(response).await);
            }

            let parsed: UpsTrackResponse = response
                .json()
                .await
                .map_err(|e| CarrierError::parse_failure(format!("UPS response: {e}")))?;
            return to_tracking_info(tracking_number, parsed);
        }
    }
}

#[async_trait]
impl TrackingClient for UpsApiClient {
    async fn track(&self, request: &TrackingRequest) -> Result<TrackingResponse, CarrierError> {
        let mut results = Vec::with_capacity(request.tracking_numbers.len());
        for number in &request.tracking_numbers {
            results.push(self.track_one(number).await?);
        }
        Ok(TrackingResponse { results })
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validate::validate(Carrier::Ups, tracking_number)
    }

    fn carrier_name(&self) -> &'static str {
        "UPS"
    }
}

// ---- wire format ----

#[derive(Debug, Default, Deserialize)]
struct UpsTrackResponse {
    #[serde(rename = "trackResponse", default)]
    track_response: Option<UpsTrackBody>,
}

#[derive(Debug, Default, Deserialize)]
struct UpsTrackBody {
    #[serde(default)]
    shipment: Vec<UpsShipment>,
}

#[derive(Debug, Default, Deserialize)]
struct UpsShipment {
    #[serde(default)]
    package: Vec<UpsPackage>,
}

#[derive(Debug, Default, Deserialize)]
struct UpsPackage {
    #[serde(default)]
    activity: Vec<UpsActivity>,
    #[serde(rename = "deliveryDate", default)]
    delivery_date: Vec<UpsDeliveryDate>,
    #[serde(rename = "currentStatus", default)]
    current_status: Option<UpsStatus>,
    #[serde(default)]
    service: Option<UpsService>,
    #[serde(default)]
    weight: Option<UpsWeight>,
}

#[derive(Debug, Default, Deserialize)]
struct UpsActivity {
    #[serde(default)]
    status: Option<UpsStatus>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    time: Option<String>,
    #[serde(default)]
    location: Option<UpsLocation>,
}

#[derive(Debug, Default, Deserialize)]
struct UpsStatus {
    #[serde(rename = "type", default)]
    status_type: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UpsLocation {
    #[serde(default)]
    address: Option<UpsAddress>,
}

#[derive(Debug, Default, Deserialize)]
struct UpsAddress {
    #[serde(default)]
    city: Option<String>,
    #[serde(rename = "stateProvince", default)]
    state_province: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UpsDeliveryDate {
    #[serde(rename = "type", default)]
    date_type: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UpsService {
    #[serde(rename = "description", default)]
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UpsWeight {
    #[serde(default)]
    weight: Option<String>,
    #[serde(rename = "unitOfMeasurement", default)]
    unit: Option<String>,
}

/// UPS encodes activity instants as YYYYMMDD + HHMMSS
fn parse_ups_timestamp(date: Option<&str>, time: Option<&str>) -> Option<DateTime<Utc>> {
    let date = NaiveDate::parse_from_str(date?, "%Y%m%d").ok()?;
    let time = time
        .and_then(|t| NaiveTime::parse_from_str(t, "%H%M%S").ok())
        .unwrap_or(NaiveTime::MIN);
    Some(date.and_time(time).and_utc())
}

fn parse_ups_date(date: &str) -> Option<DateTime<Utc>> {
    parse_ups_timestamp(Some(date), None)
}

fn to_tracking_info(
    tracking_number: &str,
    response: UpsTrackResponse,
) -> Result<TrackingInfo, CarrierError> {
    let package = response
        .track_response
        .and_then(|body| body.shipment.into_iter().next())
        .and_then(|shipment| shipment.package.into_iter().next())
        .ok_or_else(|| {
            CarrierError::not_found(format!("UPS returned no shipment for {tracking_number}"))
        })?;

    if package.activity.is_empty() {
        return Err(CarrierError::not_found(format!(
            "UPS returned no activity for {tracking_number}"
        )));
    }

    let events: Vec<CarrierEvent> = package
        .activity
        .iter()
        .filter_map(|activity| {
            let timestamp = parse_ups_timestamp(activity.date.as_deref(), activity.time.as_deref())?;
            let status = activity.status.as_ref();
            let description = status
                .and_then(|s| s.description.clone())
                .unwrap_or_default()
                .trim()
                .to_string();
            let code = status.and_then(|s| s.status_type.as_deref()).unwrap_or("");
            let mapped = match map_status(Carrier::Ups, code) {
                parceltrack_core::carrier::ShipmentStatus::Unknown => {
                    map_status(Carrier::Ups, &description)
                }
                mapped => mapped,
            };
            Some(CarrierEvent {
                timestamp,
                status: mapped,
                description,
                location: format_location(activity.location.as_ref()),
                details: None,
            })
        })
        .collect();

    let status = package
        .current_status
        .as_ref()
        .map(|current| {
            let code = current.status_type.as_deref().unwrap_or("");
            match map_status(Carrier::Ups, code) {
                parceltrack_core::carrier::ShipmentStatus::Unknown => {
                    map_status(Carrier::Ups, current.description.as_deref().unwrap_or(""))
                }
                mapped => mapped,
            }
        })
        .or_else(|| events.first().map(|event| event.status))
        .unwrap_or(parceltrack_core::carrier::ShipmentStatus::Unknown);

    let mut info = TrackingInfo::new(tracking_number, status);
    info.service_type = package.service.and_then(|s| s.description);
    info.weight = package.weight.and_then(|w| match (w.weight, w.unit) {
        (Some(value), Some(unit)) => Some(format!("{value} {unit}")),
        (Some(value), None) => Some(value),
        _ => None,
    });

    for delivery in &package.delivery_date {
        let Some(parsed) = delivery.date.as_deref().and_then(parse_ups_date) else {
            continue;
        };
        match delivery.date_type.as_deref() {
            Some("DEL") => info.actual_delivery = Some(parsed),
            Some("SDD") | Some("RDD") => info.estimated_delivery = Some(parsed),
            _ => {}
        }
    }
    if status.is_delivered() && info.actual_delivery.is_none() {
        info.actual_delivery = events.first().map(|event| event.timestamp);
    }

    info.events = events;
    Ok(info)
}

fn format_location(location: Option<&UpsLocation>) -> String {
    let Some(address) = location.and_then(|l| l.address.as_ref()) else {
        return String::new();
    };
    match (&address.city, &address.state_province) {
        (Some(city), Some(state)) => format!("{city}, {state}"),
        (Some(city), None) => city.clone(),
        (None, Some(state)) => state.clone(),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parceltrack_core::carrier::ShipmentStatus;

    const SAMPLE: &str = r#"{
        "trackResponse": {
            "shipment": [{
                "package": [{
                    "trackingNumber": "1Z999AA10123456784",
                    "currentStatus": {"type": "I", "description": "In Transit"},
                    "activity": [
                        {
                            "status": {"type": "I", "description": "Departed from Facility"},
                            "date": "20260301", "time": "120000",
                            "location": {"address": {"city": "Louisville", "stateProvince": "KY"}}
                        },
                        {
                            "status": {"type": "I", "description": "Origin Scan"},
                            "date": "20260301", "time": "080000",
                            "location": {"address": {"city": "Louisville", "stateProvince": "KY"}}
                        }
                    ],
                    "deliveryDate": [{"type": "SDD", "date": "20260303"}],
                    "service": {"description": "UPS Ground"},
                    "weight": {"weight": "2.5", "unitOfMeasurement": "LBS"}
                }]
            }]
        }
    }"#;

    #[test]
    fn test_parse_sample_response() {
        let parsed: UpsTrackResponse = serde_json::from_str(SAMPLE).unwrap();
        let info = to_tracking_info("1Z999AA10123456784", parsed).unwrap();

        assert_eq!(info.status, ShipmentStatus::InTransit);
        assert_eq!(info.events.len(), 2);
        assert_eq!(info.events[1].description, "Origin Scan");
        assert_eq!(info.events[1].location, "Louisville, KY");
        assert_eq!(info.service_type.as_deref(), Some("UPS Ground"));
        assert_eq!(info.weight.as_deref(), Some("2.5 LBS"));
        assert!(info.estimated_delivery.is_some());
        assert!(info.actual_delivery.is_none());
    }

    #[test]
    fn test_empty_shipment_is_not_found() {
        let parsed: UpsTrackResponse =
            serde_json::from_str(r#"{"trackResponse": {"shipment": []}}"#).unwrap();
        let err = to_tracking_info("1Z999AA10123456784", parsed).unwrap_err();
        assert_eq!(err.kind, crate::error::CarrierErrorKind::NotFound);
    }

    #[test]
    fn test_timestamp_parsing() {
        let ts = parse_ups_timestamp(Some("20260301"), Some("080000")).unwrap();
        assert_eq!(ts, "2026-03-01T08:00:00Z".parse::<DateTime<Utc>>().unwrap());

        // Missing time collapses to midnight
        let ts = parse_ups_timestamp(Some("20260301"), None).unwrap();
        assert_eq!(ts, "2026-03-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap());

        assert!(parse_ups_timestamp(Some("tomorrow"), None).is_none());
    }
}
