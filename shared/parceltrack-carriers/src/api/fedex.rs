//! FedEx Track API client.
//!
//! OAuth client-credentials, up to 30 tracking numbers per call.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use parceltrack_core::carrier::{Carrier, ShipmentStatus};

use crate::api::{error_from_response, OAuthTokenManager};
use crate::error::CarrierError;
use crate::status::map_status;
use crate::types::{CarrierEvent, TrackingInfo, TrackingRequest, TrackingResponse};
use crate::validate;
use crate::TrackingClient;

pub const DEFAULT_BASE_URL: &str = "https://apis.fedex.com";

/// Upstream cap on numbers per request
const MAX_PER_CALL: usize = 30;

pub struct FedexApiClient {
    http: reqwest::Client,
    base_url: String,
    oauth: OAuthTokenManager,
}

impl FedexApiClient {
    pub fn new(
        http: reqwest::Client,
        base_url: Option<&str>,
        client_id: &str,
        client_secret: &str,
    ) -> Self {
        let base_url = base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string();
        let oauth = OAuthTokenManager::new(
            format!("{base_url}/oauth/token"),
            client_id,
            client_secret,
            false,
        );
        Self {
            http,
            base_url,
            oauth,
        }
    }

    async fn track_chunk(&self, numbers: &[String]) -> Result<Vec<TrackingInfo>, CarrierError> {
        let url = format!("{}/track/v1/trackingnumbers", self.base_url);
        let body = FedexTrackRequest {
            include_detailed_scans: true,
            tracking_info: numbers
                .iter()
                .map(|number| FedexTrackingInfoRequest {
                    tracking_number_info: FedexTrackingNumberInfo {
                        tracking_number: number.clone(),
                    },
                })
                .collect(),
        };

        let mut refreshed = false;
        loop {
            let token = self.oauth.bearer(&self.http).await?;
            let response = self
                .http
                .post(&url)
                .bearer_auth(token)
                .header("x-locale", "en_US")
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if matches!(status.as_u16(), 401 | 403) && !refreshed {
                debug!("FedEx token rejected, refreshing once");
                self.oauth.force_refresh(&self.http).await?;
                refreshed = true;
                continue;
            }
            if !status.is_success() {
                return Err(error_from_response(response).await);
            }

            let parsed: FedexTrackResponse = response
                .json()
                .await
                .map_err(|e| CarrierError::parse_failure(format!("FedEx response: {e}")))?;
            return to_tracking_infos(parsed);
        }
    }
}

#[async_trait]
impl TrackingClient for FedexApiClient {
    async fn track(&self, request: &TrackingRequest) -> Result<TrackingResponse, CarrierError> {
        let mut results = Vec::with_capacity(request.tracking_numbers.len());
        for chunk in request.tracking_numbers.chunks(MAX_PER_CALL) {
            results.extend(self.track_chunk(chunk).await?);
        }
        if results.is_empty() {
            return Err(CarrierError::not_found("FedEx returned no track results"));
        }
        Ok(TrackingResponse { results })
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validate::validate(Carrier::Fedex, tracking_number)
    }

    fn carrier_name(&self) -> &'static str {
        "FedEx"
    }
}

// ---- wire format ----

#[derive(Debug, Serialize)]
struct FedexTrackRequest {
    #[serde(rename = "includeDetailedScans")]
    include_detailed_scans: bool,
    #[serde(rename = "trackingInfo")]
    tracking_info: Vec<FedexTrackingInfoRequest>,
}

#[derive(Debug, Serialize)]
struct FedexTrackingInfoRequest {
    #[serde(rename = "trackingNumberInfo")]
    tracking_number_info: FedexTrackingNumberInfo,
}

#[derive(Debug, Serialize)]
struct FedexTrackingNumberInfo {
    #[serde(rename = "trackingNumber")]
    tracking_number: String,
}

#[derive(Debug, Default, Deserialize)]
struct FedexTrackResponse {
    #[serde(default)]
    output: Option<FedexOutput>,
}

#[derive(Debug, Default, Deserialize)]
struct FedexOutput {
    #[serde(rename = "completeTrackResults", default)]
    complete_track_results: Vec<FedexCompleteTrackResult>,
}

#[derive(Debug, Default, Deserialize)]
struct FedexCompleteTrackResult {
    #[serde(rename = "trackingNumber", default)]
    tracking_number: Option<String>,
    #[serde(rename = "trackResults", default)]
    track_results: Vec<FedexTrackResult>,
}

#[derive(Debug, Default, Deserialize)]
struct FedexTrackResult {
    #[serde(rename = "latestStatusDetail", default)]
    latest_status_detail: Option<FedexStatusDetail>,
    #[serde(rename = "scanEvents", default)]
    scan_events: Vec<FedexScanEvent>,
    #[serde(rename = "dateAndTimes", default)]
    date_and_times: Vec<FedexDateAndTime>,
    #[serde(rename = "serviceDetail", default)]
    service_detail: Option<FedexServiceDetail>,
    #[serde(default)]
    error: Option<FedexResultError>,
}

#[derive(Debug, Default, Deserialize)]
struct FedexStatusDetail {
    #[serde(rename = "derivedCode", default)]
    derived_code: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FedexScanEvent {
    #[serde(default)]
    date: Option<String>,
    #[serde(rename = "eventDescription", default)]
    event_description: Option<String>,
    #[serde(rename = "exceptionDescription", default)]
    exception_description: Option<String>,
    #[serde(rename = "derivedStatusCode", default)]
    derived_status_code: Option<String>,
    #[serde(rename = "scanLocation", default)]
    scan_location: Option<FedexScanLocation>,
}

#[derive(Debug, Default, Deserialize)]
struct FedexScanLocation {
    #[serde(default)]
    city: Option<String>,
    #[serde(rename = "stateOrProvinceCode", default)]
    state_or_province_code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FedexDateAndTime {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(rename = "dateTime", default)]
    date_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FedexServiceDetail {
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FedexResultError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// FedEx emits RFC 3339 with an offset; some sandbox payloads drop it
fn parse_fedex_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

fn to_tracking_infos(response: FedexTrackResponse) -> Result<Vec<TrackingInfo>, CarrierError> {
    let complete = response
        .output
        .map(|output| output.complete_track_results)
        .unwrap_or_default();

    let mut infos = Vec::new();
    for result in complete {
        let Some(number) = result.tracking_number else {
            continue;
        };
        let Some(track) = result.track_results.into_iter().next() else {
            continue;
        };
        if let Some(error) = &track.error {
            debug!(
                tracking_number = %number,
                code = error.code.as_deref().unwrap_or(""),
                message = error.message.as_deref().unwrap_or(""),
                "FedEx reported per-number error"
            );
            continue;
        }

        let events: Vec<CarrierEvent> = track
            .scan_events
            .iter()
            .filter_map(|scan| {
                let timestamp = scan.date.as_deref().and_then(parse_fedex_timestamp)?;
                let description = scan
                    .event_description
                    .clone()
                    .or_else(|| scan.exception_description.clone())
                    .unwrap_or_default();
                let code = scan.derived_status_code.as_deref().unwrap_or("");
                let mapped = match map_status(Carrier::Fedex, code) {
                    ShipmentStatus::Unknown => map_status(Carrier::Fedex, &description),
                    mapped => mapped,
                };
                Some(CarrierEvent {
                    timestamp,
                    status: mapped,
                    description,
                    location: format_location(scan.scan_location.as_ref()),
                    details: None,
                })
            })
            .collect();

        let status = track
            .latest_status_detail
            .as_ref()
            .map(|detail| {
                let code = detail.derived_code.as_deref().unwrap_or("");
                match map_status(Carrier::Fedex, code) {
                    ShipmentStatus::Unknown => {
                        map_status(Carrier::Fedex, detail.description.as_deref().unwrap_or(""))
                    }
                    mapped => mapped,
                }
            })
            .or_else(|| events.first().map(|event| event.status))
            .unwrap_or(ShipmentStatus::Unknown);

        let mut info = TrackingInfo::new(number, status);
        info.service_type = track.service_detail.and_then(|detail| detail.description);
        for date_and_time in &track.date_and_times {
            let Some(parsed) = date_and_time.date_time.as_deref().and_then(parse_fedex_timestamp)
            else {
                continue;
            };
            match date_and_time.kind.as_deref() {
                Some("ACTUAL_DELIVERY") => info.actual_delivery = Some(parsed),
                Some("ESTIMATED_DELIVERY") => info.estimated_delivery = Some(parsed),
                _ => {}
            }
        }
        info.events = events;
        infos.push(info);
    }

    if infos.is_empty() {
        return Err(CarrierError::not_found("FedEx returned no usable results"));
    }
    Ok(infos)
}

fn format_location(location: Option<&FedexScanLocation>) -> String {
    let Some(location) = location else {
        return String::new();
    };
    match (&location.city, &location.state_or_province_code) {
        (Some(city), Some(state)) => format!("{city}, {state}"),
        (Some(city), None) => city.clone(),
        (None, Some(state)) => state.clone(),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "output": {
            "completeTrackResults": [{
                "trackingNumber": "449044304137821",
                "trackResults": [{
                    "latestStatusDetail": {"derivedCode": "DL", "description": "Delivered"},
                    "scanEvents": [
                        {
                            "date": "2026-03-02T16:30:00-05:00",
                            "eventDescription": "Delivered",
                            "derivedStatusCode": "DL",
                            "scanLocation": {"city": "Memphis", "stateOrProvinceCode": "TN"}
                        },
                        {
                            "date": "2026-03-02T08:10:00-05:00",
                            "eventDescription": "On FedEx vehicle for delivery",
                            "derivedStatusCode": "OD",
                            "scanLocation": {"city": "Memphis", "stateOrProvinceCode": "TN"}
                        }
                    ],
                    "dateAndTimes": [
                        {"type": "ACTUAL_DELIVERY", "dateTime": "2026-03-02T16:30:00-05:00"}
                    ],
                    "serviceDetail": {"description": "FedEx Ground"}
                }]
            }]
        }
    }"#;

    #[test]
    fn test_parse_sample_response() {
        let parsed: FedexTrackResponse = serde_json::from_str(SAMPLE).unwrap();
        let infos = to_tracking_infos(parsed).unwrap();

        assert_eq!(infos.len(), 1);
        let info = &infos[0];
        assert_eq!(info.status, ShipmentStatus::Delivered);
        assert_eq!(info.events.len(), 2);
        assert_eq!(info.events[1].status, ShipmentStatus::OutForDelivery);
        assert_eq!(info.events[0].location, "Memphis, TN");
        assert!(info.actual_delivery.is_some());
    }

    #[test]
    fn test_per_number_error_drops_result() {
        let raw = r#"{
            "output": {
                "completeTrackResults": [{
                    "trackingNumber": "000000000000",
                    "trackResults": [{
                        "error": {"code": "TRACKING.TRACKINGNUMBER.NOTFOUND", "message": "not found"}
                    }]
                }]
            }
        }"#;
        let parsed: FedexTrackResponse = serde_json::from_str(raw).unwrap();
        let err = to_tracking_infos(parsed).unwrap_err();
        assert_eq!(err.kind, crate::error::CarrierErrorKind::NotFound);
    }

    #[test]
    fn test_timestamp_with_and_without_offset() {
        assert!(parse_fedex_timestamp("2026-03-02T16:30:00-05:00").is_some());
        assert!(parse_fedex_timestamp("2026-03-02T16:30:00").is_some());
        assert!(parse_fedex_timestamp("March 2nd").is_none());
    }
}
