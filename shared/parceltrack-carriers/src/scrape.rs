//! HTML scraping clients, the terminal transport fallback.
//!
//! Fetches the carrier's public tracking page with browser-like headers
//! and extracts status and scan rows from the page text. The same parser
//! runs over rendered HTML handed in by the headless transport.

use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;

use parceltrack_core::carrier::{Carrier, ShipmentStatus};

use crate::error::CarrierError;
use crate::status::map_status;
use crate::types::{CarrierEvent, TrackingInfo, TrackingRequest, TrackingResponse};
use crate::validate;
use crate::TrackingClient;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Markers of anti-bot challenge pages
const BOT_MARKERS: &[&str] = &[
    "captcha",
    "are you a robot",
    "pardon our interruption",
    "access denied",
    "request unsuccessful. incapsula",
    "checking your browser",
    "verify you are human",
];

/// Markers the carriers render when a number does not exist
const NOT_FOUND_MARKERS: &[&str] = &[
    "could not locate the shipment details",
    "tracking number cannot be found",
    "no record of that item",
    "unable to retrieve tracking results",
    "status information is not yet available",
];

pub fn tracking_url(carrier: Carrier, tracking_number: &str) -> String {
    match carrier {
        Carrier::Ups => format!("https://www.ups.com/track?loc=en_US&tracknum={tracking_number}"),
        Carrier::Usps => format!("https://tools.usps.com/go/TrackConfirmAction?tLabels={tracking_number}"),
        Carrier::Fedex => format!("https://www.fedex.com/fedextrack/?trknbr={tracking_number}"),
        Carrier::Dhl => format!(
            "https://www.dhl.com/us-en/home/tracking/tracking-express.html?submit=1&tracking-id={tracking_number}"
        ),
    }
}

pub struct ScrapingClient {
    http: reqwest::Client,
    carrier: Carrier,
}

impl ScrapingClient {
    pub fn new(http: reqwest::Client, carrier: Carrier) -> Self {
        Self { http, carrier }
    }

    async fn fetch_page(&self, tracking_number: &str) -> Result<String, CarrierError> {
        let url = tracking_url(self.carrier, tracking_number);
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header(reqwest::header::ACCEPT, "text/html,application/xhtml+xml")
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        // Challenge pages often come back 403/503 with a challenge body
        if contains_marker(&body, BOT_MARKERS) {
            return Err(CarrierError::bot_detected(format!(
                "{} challenge page for {tracking_number}",
                self.carrier
            )));
        }
        if !status.is_success() {
            return Err(CarrierError::from_status(status, ""));
        }
        Ok(body)
    }
}

#[async_trait]
impl TrackingClient for ScrapingClient {
    async fn track(&self, request: &TrackingRequest) -> Result<TrackingResponse, CarrierError> {
        let mut results = Vec::with_capacity(request.tracking_numbers.len());
        for number in &request.tracking_numbers {
            let html = self.fetch_page(number).await?;
            results.push(parse_page(self.carrier, &html, number)?);
        }
        Ok(TrackingResponse { results })
    }

    fn validate_tracking_number(&self, tracking_number: &str) -> bool {
        validate::validate(self.carrier, tracking_number)
    }

    fn carrier_name(&self) -> &'static str {
        self.carrier.display_name()
    }
}

fn contains_marker(html: &str, markers: &[&str]) -> bool {
    let lowered = html.to_lowercase();
    markers.iter().any(|marker| lowered.contains(marker))
}

/// Extract tracking state from a carrier page (fetched or rendered).
pub fn parse_page(
    carrier: Carrier,
    html: &str,
    tracking_number: &str,
) -> Result<TrackingInfo, CarrierError> {
    if contains_marker(html, BOT_MARKERS) {
        return Err(CarrierError::bot_detected(format!(
            "{carrier} challenge page for {tracking_number}"
        )));
    }
    if contains_marker(html, NOT_FOUND_MARKERS) {
        return Err(CarrierError::not_found(format!(
            "{carrier} page reports no record of {tracking_number}"
        )));
    }

    let text = html_to_text(html);
    let events = parse_event_lines(carrier, &text);
    if events.is_empty() {
        return Err(CarrierError::parse_failure(format!(
            "no scan rows recognized on {carrier} page for {tracking_number}"
        )));
    }

    let status = parse_page_status(&text)
        .or_else(|| events.first().map(|event| event.status))
        .unwrap_or(ShipmentStatus::Unknown);

    let mut info = TrackingInfo::new(tracking_number, status);
    if status.is_delivered() {
        info.actual_delivery = events.iter().map(|event| event.timestamp).max();
    }
    info.events = events;
    Ok(info)
}

/// Drop script/style blocks and tags, leaving one trimmed line per element
fn html_to_text(html: &str) -> String {
    static SCRIPT_RE: OnceLock<Regex> = OnceLock::new();
    static TAG_RE: OnceLock<Regex> = OnceLock::new();

    let script_re = SCRIPT_RE
        .get_or_init(|| Regex::new(r"(?is)<(script|style)\b.*?</(script|style)>").unwrap());
    let tag_re = TAG_RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").unwrap());

    let without_scripts = script_re.replace_all(html, "\n");
    let without_tags = tag_re.replace_all(&without_scripts, "\n");

    without_tags
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// First prominent status phrase on the page
fn parse_page_status(text: &str) -> Option<ShipmentStatus> {
    static STATUS_RE: OnceLock<Regex> = OnceLock::new();
    let status_re = STATUS_RE.get_or_init(|| {
        Regex::new(
            r"(?im)^(out for delivery.*|delivered.*|in transit.*|on the way.*|label created.*|pre-shipment.*|return to sender.*|delivery exception.*|exception.*)$",
        )
        .unwrap()
    });

    status_re
        .find(text)
        .map(|found| map_status_text(found.as_str()))
}

fn map_status_text(raw: &str) -> ShipmentStatus {
    // Any carrier's free text goes through the shared keyword table
    map_status(Carrier::Usps, raw)
}

/// One scan row: leading timestamp, description, then location after a
/// column gap (two+ spaces or a tab)
fn event_line_re(carrier: Carrier) -> &'static Regex {
    static UPS: OnceLock<Regex> = OnceLock::new();
    static USPS: OnceLock<Regex> = OnceLock::new();
    static FEDEX: OnceLock<Regex> = OnceLock::new();
    static DHL: OnceLock<Regex> = OnceLock::new();

    match carrier {
        Carrier::Ups => UPS.get_or_init(|| {
            Regex::new(
                r"(?m)^(?P<ts>\d{2}/\d{2}/\d{4}\s+\d{1,2}:\d{2}\s*[AP]\.?M\.?)\s+(?P<desc>.+?)(?:\s{2,}|\t)(?P<loc>.+)$",
            )
            .unwrap()
        }),
        Carrier::Usps => USPS.get_or_init(|| {
            Regex::new(
                r"(?m)^(?P<ts>[A-Z][a-z]+ \d{1,2}, \d{4}, \d{1,2}:\d{2} [ap]m)\s+(?P<desc>.+?)(?:\s{2,}|\t)(?P<loc>.+)$",
            )
            .unwrap()
        }),
        Carrier::Fedex => FEDEX.get_or_init(|| {
            Regex::new(
                r"(?m)^(?P<ts>\d{1,2}/\d{1,2}/\d{4}\s+\d{1,2}:\d{2}\s*[AP]M)\s+(?P<desc>.+?)(?:\s{2,}|\t)(?P<loc>.+)$",
            )
            .unwrap()
        }),
        Carrier::Dhl => DHL.get_or_init(|| {
            Regex::new(
                r"(?m)^(?P<ts>\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2})\s+(?P<desc>.+?)(?:\s{2,}|\t)(?P<loc>.+)$",
            )
            .unwrap()
        }),
    }
}

fn parse_event_lines(carrier: Carrier, text: &str) -> Vec<CarrierEvent> {
    event_line_re(carrier)
        .captures_iter(text)
        .filter_map(|captures| {
            let timestamp = parse_scrape_timestamp(carrier, captures.name("ts")?.as_str())?;
            let description = captures.name("desc")?.as_str().trim().to_string();
            let location = captures.name("loc")?.as_str().trim().to_string();
            Some(CarrierEvent {
                status: map_status_text(&description),
                timestamp,
                description,
                location,
                details: None,
            })
        })
        .collect()
}

fn parse_scrape_timestamp(carrier: Carrier, raw: &str) -> Option<DateTime<Utc>> {
    let cleaned = raw
        .replace("A.M.", "AM")
        .replace("P.M.", "PM")
        .replace("am", "AM")
        .replace("pm", "PM");
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");

    let formats: &[&str] = match carrier {
        Carrier::Ups | Carrier::Fedex => &["%m/%d/%Y %I:%M %p"],
        Carrier::Usps => &["%B %d, %Y, %I:%M %p"],
        Carrier::Dhl => &["%Y-%m-%d %H:%M"],
    };
    for format in formats {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(&cleaned, format) {
            return Some(parsed.and_utc());
        }
    }
    // Date-only fallback
    NaiveDate::parse_from_str(&cleaned, "%m/%d/%Y")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ups_page() {
        let html = r#"
            <html><head><script>var x = 1;</script></head><body>
            <h1>In Transit</h1>
            <div>03/01/2026 8:00 A.M.  Origin Scan  Louisville, KY</div>
            <div>03/01/2026 12:00 P.M.  Departed from Facility  Louisville, KY</div>
            </body></html>"#;
        let info = parse_page(Carrier::Ups, html, "1Z999AA1234567890").unwrap();

        assert_eq!(info.status, ShipmentStatus::InTransit);
        assert_eq!(info.events.len(), 2);
        assert_eq!(info.events[0].description, "Origin Scan");
        assert_eq!(info.events[0].location, "Louisville, KY");
    }

    #[test]
    fn test_parse_usps_page_delivered() {
        let html = r#"
            <body>
            <p>Delivered, In/At Mailbox</p>
            <ul>
            <li>March 2, 2026, 11:05 am  Delivered, In/At Mailbox  SEATTLE, WA 98101</li>
            <li>March 1, 2026, 7:15 am  Out for Delivery  SEATTLE, WA 98101</li>
            </ul>
            </body>"#;
        let info = parse_page(Carrier::Usps, html, "9201900000000000000003").unwrap();

        assert_eq!(info.status, ShipmentStatus::Delivered);
        assert_eq!(info.events.len(), 2);
        assert_eq!(info.events[1].status, ShipmentStatus::OutForDelivery);
        assert!(info.actual_delivery.is_some());
    }

    #[test]
    fn test_bot_challenge_detected() {
        let html = "<html><body>Pardon Our Interruption... verify you are human</body></html>";
        let err = parse_page(Carrier::Fedex, html, "449044304137821").unwrap_err();
        assert_eq!(err.kind, crate::error::CarrierErrorKind::BotDetected);
        assert!(!err.retryable);
    }

    #[test]
    fn test_not_found_page() {
        let html = "<body>We could not locate the shipment details for this number.</body>";
        let err = parse_page(Carrier::Ups, html, "1Z999AA1234567890").unwrap_err();
        assert_eq!(err.kind, crate::error::CarrierErrorKind::NotFound);
    }

    #[test]
    fn test_unparseable_page_is_parse_failure() {
        let html = "<body><h1>Welcome to tracking</h1></body>";
        let err = parse_page(Carrier::Dhl, html, "1234567890").unwrap_err();
        assert_eq!(err.kind, crate::error::CarrierErrorKind::ParseFailure);
    }

    #[test]
    fn test_dhl_timestamp_format() {
        let html = "2026-03-01 10:15  With delivery courier  LEIPZIG";
        let info = parse_page(Carrier::Dhl, html, "1234567890").unwrap();
        assert_eq!(
            info.events[0].timestamp,
            "2026-03-01T10:15:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }
}
