//! Mapping from carrier-specific status values to the shipment status enum.
//!
//! The mapping is total: anything unrecognized becomes `Unknown`.

use parceltrack_core::carrier::{Carrier, ShipmentStatus};

/// Map a raw carrier status string (code or free text) to the shipment enum
pub fn map_status(carrier: Carrier, raw: &str) -> ShipmentStatus {
    let normalized = raw.trim().to_ascii_uppercase();
    if normalized.is_empty() {
        return ShipmentStatus::Unknown;
    }

    let by_code = match carrier {
        Carrier::Ups => map_ups_code(&normalized),
        Carrier::Fedex => map_fedex_code(&normalized),
        Carrier::Dhl => map_dhl_code(&normalized),
        Carrier::Usps => None,
    };

    by_code.unwrap_or_else(|| map_keywords(&normalized))
}

/// UPS activity status types
fn map_ups_code(code: &str) -> Option<ShipmentStatus> {
    match code {
        "M" | "MV" | "P" => Some(ShipmentStatus::PreShip),
        "I" => Some(ShipmentStatus::InTransit),
        "O" | "OT" => Some(ShipmentStatus::OutForDelivery),
        "D" => Some(ShipmentStatus::Delivered),
        "X" => Some(ShipmentStatus::Exception),
        "RS" => Some(ShipmentStatus::Returned),
        _ => None,
    }
}

/// FedEx derived status codes
fn map_fedex_code(code: &str) -> Option<ShipmentStatus> {
    match code {
        "IN" | "PU" | "OC" => Some(ShipmentStatus::PreShip),
        "IT" | "DP" | "AR" => Some(ShipmentStatus::InTransit),
        "OD" => Some(ShipmentStatus::OutForDelivery),
        "DL" => Some(ShipmentStatus::Delivered),
        "DE" | "SE" | "CA" => Some(ShipmentStatus::Exception),
        "RS" => Some(ShipmentStatus::Returned),
        _ => None,
    }
}

/// DHL Unified Tracking status codes
fn map_dhl_code(code: &str) -> Option<ShipmentStatus> {
    match code {
        "PRE-TRANSIT" => Some(ShipmentStatus::PreShip),
        "TRANSIT" => Some(ShipmentStatus::InTransit),
        "DELIVERED" => Some(ShipmentStatus::Delivered),
        "FAILURE" => Some(ShipmentStatus::Exception),
        _ => None,
    }
}

/// Free-text fallback shared by every carrier (USPS reports only text).
/// Order matters: "OUT FOR DELIVERY" contains "DELIVER".
fn map_keywords(text: &str) -> ShipmentStatus {
    if text.contains("OUT FOR DELIVERY") {
        ShipmentStatus::OutForDelivery
    } else if text.contains("DELIVERED") {
        ShipmentStatus::Delivered
    } else if text.contains("RETURN") {
        ShipmentStatus::Returned
    } else if text.contains("EXCEPTION")
        || text.contains("ALERT")
        || text.contains("FAILURE")
        || text.contains("UNDELIVERABLE")
        || text.contains("HELD")
    {
        ShipmentStatus::Exception
    } else if text.contains("PRE-SHIPMENT")
        || text.contains("PRE SHIPMENT")
        || text.contains("LABEL CREATED")
        || text.contains("SHIPPING LABEL")
        || text.contains("AWAITING ITEM")
        || text.contains("ORDER PROCESSED")
    {
        ShipmentStatus::PreShip
    } else if text.contains("IN TRANSIT")
        || text.contains("ARRIVED")
        || text.contains("DEPARTED")
        || text.contains("ACCEPTED")
        || text.contains("PICKED UP")
        || text.contains("ON THE WAY")
        || text.contains("IN POSSESSION")
        || text.contains("PROCESSED THROUGH")
        || text.contains("ORIGIN SCAN")
    {
        ShipmentStatus::InTransit
    } else if text.contains("PENDING") {
        ShipmentStatus::Pending
    } else {
        ShipmentStatus::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ups_codes() {
        assert_eq!(map_status(Carrier::Ups, "D"), ShipmentStatus::Delivered);
        assert_eq!(map_status(Carrier::Ups, "I"), ShipmentStatus::InTransit);
        assert_eq!(map_status(Carrier::Ups, "M"), ShipmentStatus::PreShip);
        assert_eq!(map_status(Carrier::Ups, "X"), ShipmentStatus::Exception);
        assert_eq!(map_status(Carrier::Ups, "RS"), ShipmentStatus::Returned);
    }

    #[test]
    fn test_fedex_codes() {
        assert_eq!(map_status(Carrier::Fedex, "DL"), ShipmentStatus::Delivered);
        assert_eq!(map_status(Carrier::Fedex, "OD"), ShipmentStatus::OutForDelivery);
        assert_eq!(map_status(Carrier::Fedex, "IT"), ShipmentStatus::InTransit);
        assert_eq!(map_status(Carrier::Fedex, "DE"), ShipmentStatus::Exception);
    }

    #[test]
    fn test_usps_free_text() {
        assert_eq!(
            map_status(Carrier::Usps, "Out for Delivery, Expected Delivery by 9:00pm"),
            ShipmentStatus::OutForDelivery
        );
        assert_eq!(
            map_status(Carrier::Usps, "Delivered, In/At Mailbox"),
            ShipmentStatus::Delivered
        );
        assert_eq!(
            map_status(Carrier::Usps, "Pre-Shipment Info Sent to USPS, USPS Awaiting Item"),
            ShipmentStatus::PreShip
        );
        assert_eq!(
            map_status(Carrier::Usps, "Arrived at USPS Regional Facility"),
            ShipmentStatus::InTransit
        );
    }

    #[test]
    fn test_mapping_is_total() {
        assert_eq!(map_status(Carrier::Ups, "ZQX"), ShipmentStatus::Unknown);
        assert_eq!(map_status(Carrier::Dhl, ""), ShipmentStatus::Unknown);
        assert_eq!(
            map_status(Carrier::Usps, "\u{1F4E6}\u{1F4E6}"),
            ShipmentStatus::Unknown
        );
    }

    #[test]
    fn test_out_for_delivery_beats_delivered_substring() {
        assert_eq!(
            map_status(Carrier::Usps, "OUT FOR DELIVERY"),
            ShipmentStatus::OutForDelivery
        );
    }
}
