//! Processed-email idempotency ledger and email-shipment links

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use parceltrack_core::domain::{ProcessedEmail, ProcessedEmailStatus};

use crate::error::Result;
use crate::store::Store;

/// Fields recorded for one scanned message
#[derive(Debug, Clone)]
pub struct NewProcessedEmail {
    pub message_id: String,
    pub thread_id: Option<String>,
    pub tracking_numbers: Vec<String>,
    pub status: ProcessedEmailStatus,
    pub sender: String,
    pub subject: String,
    pub error_message: Option<String>,
}

/// Repository for the processed-email set
pub struct ProcessedEmailRepository<'a> {
    store: &'a Store,
}

impl<'a> ProcessedEmailRepository<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Whether a message id has already been handled
    pub async fn is_processed(&self, message_id: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM processed_emails WHERE message_id = $1")
                .bind(message_id)
                .fetch_one(self.store.pool())
                .await?;
        Ok(count > 0)
    }

    /// Record the outcome for a message. Idempotent: replaying the same
    /// message id leaves the original row untouched. Returns the row id.
    pub async fn record(&self, email: &NewProcessedEmail) -> Result<i64> {
        let now = Utc::now();
        let tracking_json = serde_json::to_string(&email.tracking_numbers)?;

        sqlx::query(
            "INSERT INTO processed_emails
                (message_id, thread_id, processed_at, tracking_numbers,
                 status, sender, subject, error_message)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (message_id) DO NOTHING",
        )
        .bind(&email.message_id)
        .bind(&email.thread_id)
        .bind(now)
        .bind(&tracking_json)
        .bind(email.status.as_str())
        .bind(&email.sender)
        .bind(&email.subject)
        .bind(&email.error_message)
        .execute(self.store.pool())
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM processed_emails WHERE message_id = $1")
            .bind(&email.message_id)
            .fetch_one(self.store.pool())
            .await?;
        Ok(id)
    }

    pub async fn find_by_message_id(&self, message_id: &str) -> Result<Option<ProcessedEmail>> {
        let row = sqlx::query("SELECT * FROM processed_emails WHERE message_id = $1")
            .bind(message_id)
            .fetch_optional(self.store.pool())
            .await?;
        row.map(|r| row_to_email(&r)).transpose()
    }

    /// Link a processed email to a shipment it referenced
    pub async fn link_shipment(&self, processed_email_id: i64, shipment_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO email_shipment_links
                (processed_email_id, shipment_id)
             VALUES ($1, $2)",
        )
        .bind(processed_email_id)
        .bind(shipment_id)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    pub async fn linked_shipments(&self, processed_email_id: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar(
            "SELECT shipment_id FROM email_shipment_links
             WHERE processed_email_id = $1 ORDER BY shipment_id",
        )
        .bind(processed_email_id)
        .fetch_all(self.store.pool())
        .await?;
        Ok(ids)
    }

    /// Drop ledger rows older than the retention horizon
    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM processed_emails WHERE processed_at < $1")
            .bind(cutoff)
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_email(row: &SqliteRow) -> Result<ProcessedEmail> {
    let status: String = row.try_get("status")?;
    let tracking_json: String = row.try_get("tracking_numbers")?;

    Ok(ProcessedEmail {
        id: row.try_get("id")?,
        message_id: row.try_get("message_id")?,
        thread_id: row.try_get("thread_id")?,
        processed_at: row.try_get("processed_at")?,
        tracking_numbers: serde_json::from_str(&tracking_json)?,
        status: ProcessedEmailStatus::parse(&status),
        sender: row.try_get("sender")?,
        subject: row.try_get("subject")?,
        error_message: row.try_get("error_message")?,
    })
}
