//! Persistent entities and API payloads for the tracking system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::carrier::{Carrier, ShipmentStatus};

/// Sentinel shipment id for tracking events produced while validating a
/// candidate number that has no shipment yet. Such events are never persisted.
pub const VALIDATION_SHIPMENT_ID: i64 = -1;

/// Upper bound on the stored auto-refresh error message
pub const AUTO_REFRESH_ERROR_MAX_LEN: usize = 500;

/// A tracked parcel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shipment {
    pub id: i64,
    pub tracking_number: String,
    pub carrier: Carrier,
    pub description: String,
    pub status: ShipmentStatus,
    pub is_delivered: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Estimated delivery while in flight; actual delivery instant once delivered
    pub expected_delivery: Option<DateTime<Utc>>,
    pub last_manual_refresh: Option<DateTime<Utc>>,
    pub manual_refresh_count: i64,
    pub auto_refresh_enabled: bool,
    pub auto_refresh_fail_count: i64,
    pub auto_refresh_error: Option<String>,
}

/// A carrier-reported scan event attached to a shipment.
///
/// Events are deduplicated per shipment by (timestamp, status, description).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub id: i64,
    pub shipment_id: i64,
    pub timestamp: DateTime<Utc>,
    pub location: String,
    pub status: ShipmentStatus,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Response body of a refresh, also the unit stored in the refresh cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub shipment_id: i64,
    pub updated_at: DateTime<Utc>,
    pub events_added: i64,
    pub total_events: i64,
    pub events: Vec<TrackingEvent>,
}

/// Outcome recorded for a scanned email message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessedEmailStatus {
    Processed,
    Skipped,
    Error,
}

impl ProcessedEmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessedEmailStatus::Processed => "processed",
            ProcessedEmailStatus::Skipped => "skipped",
            ProcessedEmailStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> ProcessedEmailStatus {
        match s {
            "processed" => ProcessedEmailStatus::Processed,
            "skipped" => ProcessedEmailStatus::Skipped,
            _ => ProcessedEmailStatus::Error,
        }
    }
}

/// Idempotency record for one scanned mail message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEmail {
    pub id: i64,
    pub message_id: String,
    pub thread_id: Option<String>,
    pub processed_at: DateTime<Utc>,
    pub tracking_numbers: Vec<String>,
    pub status: ProcessedEmailStatus,
    pub sender: String,
    pub subject: String,
    pub error_message: Option<String>,
}

/// Request to register a new shipment
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateShipmentRequest {
    #[validate(length(min = 1, message = "tracking_number must not be empty"))]
    pub tracking_number: String,
    pub carrier: Carrier,
    #[serde(default)]
    pub description: Option<String>,
}

/// Request to update a shipment; absent fields are left unchanged
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateShipmentRequest {
    pub description: Option<String>,
    pub auto_refresh_enabled: Option<bool>,
}

/// Truncate a carrier error message for storage on the shipment row
pub fn truncate_refresh_error(message: &str) -> String {
    if message.len() <= AUTO_REFRESH_ERROR_MAX_LEN {
        return message.to_string();
    }
    let mut end = AUTO_REFRESH_ERROR_MAX_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
