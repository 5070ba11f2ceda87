//! Carrier and shipment status enums shared across the platform.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Supported commercial carriers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Carrier {
    Ups,
    Usps,
    Fedex,
    Dhl,
}

impl Carrier {
    pub const ALL: [Carrier; 4] = [Carrier::Ups, Carrier::Usps, Carrier::Fedex, Carrier::Dhl];

    pub fn as_str(&self) -> &'static str {
        match self {
            Carrier::Ups => "ups",
            Carrier::Usps => "usps",
            Carrier::Fedex => "fedex",
            Carrier::Dhl => "dhl",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Carrier::Ups => "UPS",
            Carrier::Usps => "USPS",
            Carrier::Fedex => "FedEx",
            Carrier::Dhl => "DHL",
        }
    }

    /// Maximum tracking numbers per upstream call
    pub fn batch_size(&self) -> usize {
        match self {
            Carrier::Usps => 10,
            Carrier::Fedex => 30,
            Carrier::Ups | Carrier::Dhl => 1,
        }
    }

    /// Sender domains used by the email ingestion search filter
    pub fn sender_domains(&self) -> &'static [&'static str] {
        match self {
            Carrier::Ups => &["ups.com"],
            Carrier::Usps => &["usps.com", "usps.gov"],
            Carrier::Fedex => &["fedex.com"],
            Carrier::Dhl => &["dhl.com", "dhl.de"],
        }
    }
}

impl fmt::Display for Carrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Carrier {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ups" => Ok(Carrier::Ups),
            "usps" => Ok(Carrier::Usps),
            "fedex" => Ok(Carrier::Fedex),
            "dhl" => Ok(Carrier::Dhl),
            other => Err(CoreError::UnknownCarrier(other.to_string())),
        }
    }
}

/// Shipment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    Pending,
    PreShip,
    InTransit,
    OutForDelivery,
    Delivered,
    Exception,
    Returned,
    Unknown,
}

impl ShipmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShipmentStatus::Pending => "pending",
            ShipmentStatus::PreShip => "pre_ship",
            ShipmentStatus::InTransit => "in_transit",
            ShipmentStatus::OutForDelivery => "out_for_delivery",
            ShipmentStatus::Delivered => "delivered",
            ShipmentStatus::Exception => "exception",
            ShipmentStatus::Returned => "returned",
            ShipmentStatus::Unknown => "unknown",
        }
    }

    /// Parse a stored status string; unrecognized values map to Unknown
    pub fn parse(s: &str) -> ShipmentStatus {
        match s {
            "pending" => ShipmentStatus::Pending,
            "pre_ship" => ShipmentStatus::PreShip,
            "in_transit" => ShipmentStatus::InTransit,
            "out_for_delivery" => ShipmentStatus::OutForDelivery,
            "delivered" => ShipmentStatus::Delivered,
            "exception" => ShipmentStatus::Exception,
            "returned" => ShipmentStatus::Returned,
            _ => ShipmentStatus::Unknown,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, ShipmentStatus::Delivered)
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
