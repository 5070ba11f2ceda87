//! The ingestion daemon: periodic tick over new mail, validation through
//! the refresh engine, shipment creation and the processed-email ledger.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parceltrack_core::config::Config;
use parceltrack_core::domain::{CreateShipmentRequest, ProcessedEmailStatus};
use parceltrack_store::{NewProcessedEmail, ProcessedEmailRepository, ShipmentRepository, Store};

use crate::error::{Error, Result};
use crate::refresh::RefreshEngine;

use super::client::{EmailMessage, MailClient};
use super::extract::{extract_candidates, Candidate};

/// Spacing between messages within a tick to limit carrier load
const INTER_MESSAGE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct EmailMetrics {
    ticks: AtomicI64,
    messages_seen: AtomicI64,
    duplicates_skipped: AtomicI64,
    processed: AtomicI64,
    skipped: AtomicI64,
    errors: AtomicI64,
    candidates_validated: AtomicI64,
    shipments_created: AtomicI64,
    shipments_linked_existing: AtomicI64,
}

/// Counters exposed through the control surface
#[derive(Debug, Clone, Serialize)]
pub struct EmailMetricsSnapshot {
    pub ticks: i64,
    pub messages_seen: i64,
    pub duplicates_skipped: i64,
    pub processed: i64,
    pub skipped: i64,
    pub errors: i64,
    pub candidates_validated: i64,
    pub shipments_created: i64,
    pub shipments_linked_existing: i64,
    pub paused: bool,
    pub dry_run: bool,
}

pub struct EmailIngestor {
    store: Store,
    /// Where the processed-email ledger lives; defaults to the main store
    ledger: Store,
    /// Email-shipment links only exist when the ledger is co-located with
    /// the shipment tables (cross-file foreign keys cannot hold)
    link_shipments: bool,
    engine: Arc<RefreshEngine>,
    mail: Arc<dyn MailClient>,
    config: Arc<Config>,
    paused: AtomicBool,
    tick_running: AtomicBool,
    metrics: EmailMetrics,
}

impl EmailIngestor {
    pub fn new(
        store: Store,
        engine: Arc<RefreshEngine>,
        mail: Arc<dyn MailClient>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            ledger: store.clone(),
            store,
            link_shipments: true,
            engine,
            mail,
            config,
            paused: AtomicBool::new(false),
            tick_running: AtomicBool::new(false),
            metrics: EmailMetrics::default(),
        }
    }

    /// Keep the processed-email ledger in its own store file
    pub fn with_state_store(mut self, ledger: Store) -> Self {
        self.ledger = ledger;
        self.link_shipments = false;
        self
    }

    /// Probe the mail account and the store before the daemon starts;
    /// failure aborts startup.
    pub async fn health_check(&self) -> Result<()> {
        self.mail.health_check().await?;
        if !self.store.ping().await || !self.ledger.ping().await {
            return Err(Error::Internal("store ping failed".to_string()));
        }
        Ok(())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Email ingestion paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("Email ingestion resumed");
    }

    pub fn metrics(&self) -> EmailMetricsSnapshot {
        EmailMetricsSnapshot {
            ticks: self.metrics.ticks.load(Ordering::SeqCst),
            messages_seen: self.metrics.messages_seen.load(Ordering::SeqCst),
            duplicates_skipped: self.metrics.duplicates_skipped.load(Ordering::SeqCst),
            processed: self.metrics.processed.load(Ordering::SeqCst),
            skipped: self.metrics.skipped.load(Ordering::SeqCst),
            errors: self.metrics.errors.load(Ordering::SeqCst),
            candidates_validated: self.metrics.candidates_validated.load(Ordering::SeqCst),
            shipments_created: self.metrics.shipments_created.load(Ordering::SeqCst),
            shipments_linked_existing: self
                .metrics
                .shipments_linked_existing
                .load(Ordering::SeqCst),
            paused: self.paused.load(Ordering::SeqCst),
            dry_run: self.config.email.dry_run,
        }
    }

    /// Periodic loop until cancelled; the in-flight tick drains on stop
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.config.email.check_interval_secs.max(1));
        tokio::spawn(async move {
            info!(
                interval_secs = interval.as_secs(),
                dry_run = self.config.email.dry_run,
                "Email ingestion daemon started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The immediate first tick from interval() is intentional: scan
            // promptly at startup, then settle into the cadence.
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Email ingestion daemon stopping");
                        break;
                    }
                    _ = ticker.tick() => self.run_tick().await,
                }
            }
        })
    }

    /// One scan of the mailbox
    pub async fn run_tick(&self) {
        if self.paused.load(Ordering::SeqCst) {
            debug!("Email ingestion paused, skipping tick");
            return;
        }
        if self.tick_running.swap(true, Ordering::SeqCst) {
            warn!("Previous email tick still running, skipping");
            return;
        }

        self.tick_inner().await;

        self.tick_running.store(false, Ordering::SeqCst);
    }

    async fn tick_inner(&self) {
        let since = Utc::now() - TimeDelta::days(self.config.email.scan_days);
        let mut messages = match self
            .mail
            .search_since(since, self.config.email.search_query.as_deref())
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Mail search failed, will retry next tick: {e}");
                return;
            }
        };

        // Oldest first so shipment creation follows mail order
        messages.sort_by_key(|message| message.received_at);
        let total = messages.len();
        messages.truncate(self.config.email.max_per_run);
        debug!(
            total,
            processing = messages.len(),
            "Email tick scanning messages"
        );

        let count = messages.len();
        for (index, message) in messages.into_iter().enumerate() {
            self.process_message(message).await;
            if index + 1 < count {
                tokio::time::sleep(INTER_MESSAGE_DELAY).await;
            }
        }

        self.cleanup_retention().await;
        self.metrics.ticks.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.metrics();
        info!(
            processed = snapshot.processed,
            skipped = snapshot.skipped,
            errors = snapshot.errors,
            shipments_created = snapshot.shipments_created,
            "Email tick complete"
        );
    }

    /// Handle one message with panic isolation: a panic in extraction or
    /// validation is recorded as an error row and the tick continues.
    async fn process_message(&self, message: EmailMessage) {
        self.metrics.messages_seen.fetch_add(1, Ordering::SeqCst);

        let processed = ProcessedEmailRepository::new(&self.ledger);
        match processed.is_processed(&message.message_id).await {
            Ok(true) => {
                self.metrics.duplicates_skipped.fetch_add(1, Ordering::SeqCst);
                debug!(message_id = %message.message_id, "Already processed, skipping");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(message_id = %message.message_id, "Dedup lookup failed: {e}");
                self.metrics.errors.fetch_add(1, Ordering::SeqCst);
                return;
            }
        }

        let outcome = std::panic::AssertUnwindSafe(self.handle_message(&message))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(message_id = %message.message_id, "Message processing failed: {e}");
                self.record_outcome(
                    &message,
                    Vec::new(),
                    ProcessedEmailStatus::Error,
                    Some(e.to_string()),
                )
                .await;
                self.metrics.errors.fetch_add(1, Ordering::SeqCst);
            }
            Err(_panic) => {
                warn!(message_id = %message.message_id, "Panic during message processing");
                self.record_outcome(
                    &message,
                    Vec::new(),
                    ProcessedEmailStatus::Error,
                    Some("panic during message processing".to_string()),
                )
                .await;
                self.metrics.errors.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    async fn handle_message(&self, message: &EmailMessage) -> Result<()> {
        let text = format!("{}\n{}", message.subject, message.body);
        let candidates = extract_candidates(&text, &message.sender);
        if candidates.is_empty() {
            debug!(message_id = %message.message_id, "No candidates found");
            self.record_outcome(
                message,
                Vec::new(),
                ProcessedEmailStatus::Skipped,
                Some("no tracking number candidates found".to_string()),
            )
            .await;
            self.metrics.skipped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let mut valid: Vec<Candidate> = Vec::new();
        for candidate in &candidates {
            self.metrics.candidates_validated.fetch_add(1, Ordering::SeqCst);
            match self
                .engine
                .validate(candidate.carrier, &candidate.tracking_number)
                .await
            {
                Ok(_) => valid.push(candidate.clone()),
                Err(Error::RateLimited { remaining_seconds }) => {
                    debug!(
                        tracking_number = %candidate.tracking_number,
                        remaining_seconds,
                        "Validation rate limited, retrying on a later tick"
                    );
                }
                Err(e) => {
                    debug!(
                        tracking_number = %candidate.tracking_number,
                        "Candidate did not validate: {e}"
                    );
                }
            }
        }

        if valid.is_empty() {
            self.record_outcome(
                message,
                candidates
                    .iter()
                    .map(|candidate| candidate.tracking_number.clone())
                    .collect(),
                ProcessedEmailStatus::Skipped,
                Some("no candidates validated with their carrier".to_string()),
            )
            .await;
            self.metrics.skipped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let mut linked_shipments: Vec<i64> = Vec::new();
        let mut create_errors: Vec<String> = Vec::new();
        if self.config.email.dry_run {
            info!(
                message_id = %message.message_id,
                candidates = valid.len(),
                "Dry run: shipments not created"
            );
        } else {
            for candidate in &valid {
                match self.create_or_find_shipment(candidate, message).await {
                    Ok(shipment_id) => linked_shipments.push(shipment_id),
                    Err(e) => create_errors.push(format!("{}: {e}", candidate.tracking_number)),
                }
            }
        }

        let error_message = (!create_errors.is_empty()).then(|| create_errors.join("; "));
        let row_id = self
            .record_outcome(
                message,
                valid
                    .iter()
                    .map(|candidate| candidate.tracking_number.clone())
                    .collect(),
                ProcessedEmailStatus::Processed,
                error_message,
            )
            .await;

        if let Some(row_id) = row_id {
            if self.link_shipments {
                let processed = ProcessedEmailRepository::new(&self.ledger);
                for shipment_id in linked_shipments {
                    if let Err(e) = processed.link_shipment(row_id, shipment_id).await {
                        warn!(row_id, shipment_id, "Linking email to shipment failed: {e}");
                    }
                }
            }
        }
        self.metrics.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Create the shipment, retrying transient store errors; an existing
    /// (carrier, tracking_number) row is resolved and linked instead of
    /// treated as a failure.
    async fn create_or_find_shipment(
        &self,
        candidate: &Candidate,
        message: &EmailMessage,
    ) -> Result<i64> {
        let shipments = ShipmentRepository::new(&self.store);
        let request = CreateShipmentRequest {
            tracking_number: candidate.tracking_number.clone(),
            carrier: candidate.carrier,
            description: Some(describe(message)),
        };

        let mut attempt = 0u32;
        loop {
            match shipments.create(&request).await {
                Ok(shipment) => {
                    info!(
                        shipment_id = shipment.id,
                        tracking_number = %shipment.tracking_number,
                        carrier = %shipment.carrier,
                        "Shipment created from email"
                    );
                    self.metrics.shipments_created.fetch_add(1, Ordering::SeqCst);
                    return Ok(shipment.id);
                }
                Err(e) if e.is_duplicate() => {
                    let existing = shipments
                        .find_by_tracking(candidate.carrier, &candidate.tracking_number)
                        .await?
                        .ok_or_else(|| {
                            Error::Internal("duplicate shipment vanished".to_string())
                        })?;
                    self.metrics
                        .shipments_linked_existing
                        .fetch_add(1, Ordering::SeqCst);
                    return Ok(existing.id);
                }
                Err(e) if attempt < self.config.email.create_retry_count => {
                    attempt += 1;
                    warn!(
                        tracking_number = %candidate.tracking_number,
                        attempt,
                        "Shipment creation failed, retrying: {e}"
                    );
                    tokio::time::sleep(Duration::from_secs(
                        self.config.email.create_retry_delay_secs,
                    ))
                    .await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn record_outcome(
        &self,
        message: &EmailMessage,
        tracking_numbers: Vec<String>,
        status: ProcessedEmailStatus,
        error_message: Option<String>,
    ) -> Option<i64> {
        let processed = ProcessedEmailRepository::new(&self.ledger);
        match processed
            .record(&NewProcessedEmail {
                message_id: message.message_id.clone(),
                thread_id: message.thread_id.clone(),
                tracking_numbers,
                status,
                sender: message.sender.clone(),
                subject: message.subject.clone(),
                error_message,
            })
            .await
        {
            Ok(row_id) => Some(row_id),
            Err(e) => {
                warn!(message_id = %message.message_id, "Recording processed email failed: {e}");
                None
            }
        }
    }

    async fn cleanup_retention(&self) {
        let cutoff = Utc::now() - TimeDelta::days(self.config.email.retention_days);
        match ProcessedEmailRepository::new(&self.ledger)
            .cleanup_older_than(cutoff)
            .await
        {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Pruned old processed-email rows"),
            Err(e) => warn!("Processed-email retention cleanup failed: {e}"),
        }
    }
}

fn describe(message: &EmailMessage) -> String {
    if message.subject.is_empty() {
        format!("Imported from email ({})", message.sender)
    } else {
        message.subject.clone()
    }
}
