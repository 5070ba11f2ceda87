//! Wire-level types of the unified tracking contract

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use parceltrack_core::carrier::{Carrier, ShipmentStatus};

/// A batch of tracking numbers for one carrier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingRequest {
    pub tracking_numbers: Vec<String>,
    pub carrier: Carrier,
}

impl TrackingRequest {
    pub fn single(carrier: Carrier, tracking_number: impl Into<String>) -> Self {
        Self {
            tracking_numbers: vec![tracking_number.into()],
            carrier,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackingResponse {
    pub results: Vec<TrackingInfo>,
}

/// Tracking state for one number as reported by the carrier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingInfo {
    pub tracking_number: String,
    pub status: ShipmentStatus,
    pub estimated_delivery: Option<DateTime<Utc>>,
    pub actual_delivery: Option<DateTime<Utc>>,
    pub events: Vec<CarrierEvent>,
    pub service_type: Option<String>,
    pub weight: Option<String>,
    pub dimensions: Option<String>,
}

impl TrackingInfo {
    pub fn new(tracking_number: impl Into<String>, status: ShipmentStatus) -> Self {
        Self {
            tracking_number: tracking_number.into(),
            status,
            estimated_delivery: None,
            actual_delivery: None,
            events: Vec::new(),
            service_type: None,
            weight: None,
            dimensions: None,
        }
    }
}

/// A single carrier scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarrierEvent {
    pub timestamp: DateTime<Utc>,
    pub status: ShipmentStatus,
    pub description: String,
    pub location: String,
    pub details: Option<String>,
}

/// Upstream quota observation reported by some carriers (DHL)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: i64,
    pub remaining: i64,
    pub reset_time: Option<DateTime<Utc>>,
}
