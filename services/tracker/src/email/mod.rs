//! Email ingestion pipeline.
//!
//! A daemon that periodically searches a mail account for carrier
//! notifications, extracts candidate tracking numbers, validates each one
//! through the refresh engine and creates shipments for the candidates
//! that validate. Idempotent over the processed-email ledger.

mod client;
mod extract;
mod pipeline;

pub use client::{EmailMessage, ImapMailClient, MailClient};
pub use extract::{extract_candidates, Candidate};
pub use pipeline::{EmailIngestor, EmailMetricsSnapshot};
