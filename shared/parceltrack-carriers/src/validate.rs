//! Format-only tracking number validation.
//!
//! Length and prefix rules per carrier, plus the USPS IMpb mod-10 check
//! digit. This never hits the network; whether a number actually exists is
//! the refresh engine's job.

use std::sync::OnceLock;

use regex::Regex;

use parceltrack_core::carrier::Carrier;

fn ups_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^1Z[0-9A-Z]{15,16}$").unwrap())
}

fn usps_digits_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^9[2345][0-9]{18,20}$").unwrap())
}

fn usps_intl_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z]{2}[0-9]{9}US$").unwrap())
}

fn fedex_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([0-9]{12}|[0-9]{15}|[0-9]{20,22})$").unwrap())
}

fn dhl_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9]{10,11}$").unwrap())
}

/// Validate a tracking number's format for a carrier
pub fn validate(carrier: Carrier, tracking_number: &str) -> bool {
    let normalized = tracking_number.trim().to_ascii_uppercase();
    match carrier {
        Carrier::Ups => ups_re().is_match(&normalized),
        Carrier::Usps => {
            (usps_digits_re().is_match(&normalized) && usps_check_digit_ok(&normalized))
                || usps_intl_re().is_match(&normalized)
        }
        Carrier::Fedex => fedex_re().is_match(&normalized),
        Carrier::Dhl => dhl_re().is_match(&normalized),
    }
}

/// USPS IMpb mod-10: weights 3 and 1 alternate from the digit next to the
/// check digit; check = (10 - sum mod 10) mod 10.
fn usps_check_digit_ok(digits: &str) -> bool {
    let bytes = digits.as_bytes();
    let Some((&check, payload)) = bytes.split_last() else {
        return false;
    };
    let check = (check - b'0') as u32;

    let mut sum = 0u32;
    for (i, &b) in payload.iter().rev().enumerate() {
        let digit = (b - b'0') as u32;
        sum += if i % 2 == 0 { digit * 3 } else { digit };
    }
    (10 - sum % 10) % 10 == check
}

/// Compute the IMpb check digit for a payload (used to build fixtures)
#[cfg(test)]
pub(crate) fn usps_check_digit(payload: &str) -> u32 {
    let mut sum = 0u32;
    for (i, b) in payload.bytes().rev().enumerate() {
        let digit = (b - b'0') as u32;
        sum += if i % 2 == 0 { digit * 3 } else { digit };
    }
    (10 - sum % 10) % 10
}
