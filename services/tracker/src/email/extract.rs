//! Candidate tracking-number extraction from message text.
//!
//! Per-carrier patterns pull candidates out of the subject and body; each
//! candidate carries a carrier guess. The sender's domain breaks ties when
//! a number shape is ambiguous (FedEx and DHL both use plain digit runs).

use std::sync::OnceLock;

use regex::Regex;

use parceltrack_core::carrier::Carrier;
use parceltrack_carriers::validate;

/// A tracking-number candidate with its carrier guess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub tracking_number: String,
    pub carrier: Carrier,
}

fn pattern_for(carrier: Carrier) -> &'static Regex {
    static UPS: OnceLock<Regex> = OnceLock::new();
    static USPS: OnceLock<Regex> = OnceLock::new();
    static FEDEX: OnceLock<Regex> = OnceLock::new();
    static DHL: OnceLock<Regex> = OnceLock::new();

    match carrier {
        Carrier::Ups => {
            UPS.get_or_init(|| Regex::new(r"\b1Z[0-9A-Za-z]{15,16}\b").unwrap())
        }
        Carrier::Usps => USPS.get_or_init(|| {
            Regex::new(r"\b(?:9[2345][0-9]{18,20}|[A-Z]{2}[0-9]{9}US)\b").unwrap()
        }),
        Carrier::Fedex => {
            FEDEX.get_or_init(|| Regex::new(r"\b(?:[0-9]{15}|[0-9]{12})\b").unwrap())
        }
        Carrier::Dhl => DHL.get_or_init(|| Regex::new(r"\b[0-9]{10,11}\b").unwrap()),
    }
}

/// Carrier implied by the sender address, if any
pub fn carrier_from_sender(sender: &str) -> Option<Carrier> {
    let sender = sender.to_ascii_lowercase();
    Carrier::ALL.into_iter().find(|carrier| {
        carrier
            .sender_domains()
            .iter()
            .any(|domain| sender.ends_with(domain) || sender.contains(&format!("@{domain}")))
    })
}

/// Extract validated-format candidates from message text.
///
/// The sender's carrier is tried first so its number shapes win ties;
/// duplicates keep the first guess. Candidates that fail format
/// validation (bad check digit, wrong length) are dropped here, before
/// any carrier call is spent on them.
pub fn extract_candidates(text: &str, sender: &str) -> Vec<Candidate> {
    let mut order: Vec<Carrier> = Vec::with_capacity(Carrier::ALL.len());
    if let Some(preferred) = carrier_from_sender(sender) {
        order.push(preferred);
    }
    for carrier in Carrier::ALL {
        if !order.contains(&carrier) {
            order.push(carrier);
        }
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    for carrier in order {
        for found in pattern_for(carrier).find_iter(text) {
            let number = found.as_str().to_ascii_uppercase();
            if !validate::validate(carrier, &number) {
                continue;
            }
            if candidates.iter().any(|c| c.tracking_number == number) {
                continue;
            }
            candidates.push(Candidate {
                tracking_number: number,
                carrier,
            });
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_ups_number() {
        let candidates = extract_candidates(
            "Your package 1Z999AA1234567890 has shipped!",
            "noreply@ups.com",
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].tracking_number, "1Z999AA1234567890");
        assert_eq!(candidates[0].carrier, Carrier::Ups);
    }

    #[test]
    fn test_sender_domain_breaks_digit_ambiguity() {
        // Eleven digits could be DHL; ten could too. From FedEx it's neither,
        // but a 12-digit run from FedEx is claimed by FedEx before DHL sees it.
        let text = "Tracking ID: 123456789012";
        let from_fedex = extract_candidates(text, "tracking@fedex.com");
        assert_eq!(from_fedex[0].carrier, Carrier::Fedex);
    }

    #[test]
    fn test_usps_check_digit_filters_noise() {
        // Valid check digit passes, corrupted one is dropped
        let valid = extract_candidates("num 9201900000000000000003 ok", "usps@usps.com");
        assert_eq!(valid.len(), 1);

        let invalid = extract_candidates("num 9201900000000000000004 ok", "usps@usps.com");
        assert!(invalid.is_empty());
    }

    #[test]
    fn test_multiple_candidates_deduplicated() {
        let text = "1Z999AA1234567890 again 1Z999AA1234567890 and 9201900000000000000003";
        let candidates = extract_candidates(text, "noreply@ups.com");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].carrier, Carrier::Ups);
        assert_eq!(candidates[1].carrier, Carrier::Usps);
    }

    #[test]
    fn test_no_candidates_in_plain_text() {
        let candidates = extract_candidates("Lunch at noon? INVALID123", "friend@example.com");
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_carrier_from_sender() {
        assert_eq!(carrier_from_sender("noreply@ups.com"), Some(Carrier::Ups));
        assert_eq!(
            carrier_from_sender("auto-notify@usps.gov"),
            Some(Carrier::Usps)
        );
        assert_eq!(carrier_from_sender("mail@dhl.de"), Some(Carrier::Dhl));
        assert_eq!(carrier_from_sender("person@example.com"), None);
    }
}
