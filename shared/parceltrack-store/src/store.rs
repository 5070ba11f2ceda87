//! SQLite pool wrapper and schema migration

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::error::Result;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS shipments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tracking_number TEXT NOT NULL,
        carrier TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'pending',
        is_delivered INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        expected_delivery TEXT,
        last_manual_refresh TEXT,
        manual_refresh_count INTEGER NOT NULL DEFAULT 0,
        auto_refresh_enabled INTEGER NOT NULL DEFAULT 1,
        auto_refresh_fail_count INTEGER NOT NULL DEFAULT 0,
        auto_refresh_error TEXT,
        UNIQUE (carrier, tracking_number)
    )",
    "CREATE TABLE IF NOT EXISTS tracking_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        shipment_id INTEGER NOT NULL REFERENCES shipments(id) ON DELETE CASCADE,
        timestamp TEXT NOT NULL,
        location TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        UNIQUE (shipment_id, timestamp, status, description)
    )",
    "CREATE INDEX IF NOT EXISTS idx_tracking_events_shipment
        ON tracking_events(shipment_id, timestamp)",
    "CREATE TABLE IF NOT EXISTS refresh_cache (
        cache_key TEXT PRIMARY KEY,
        shipment_id INTEGER,
        response TEXT NOT NULL,
        cached_at TEXT NOT NULL,
        expires_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_refresh_cache_expires
        ON refresh_cache(expires_at)",
    "CREATE TABLE IF NOT EXISTS processed_emails (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        message_id TEXT NOT NULL UNIQUE,
        thread_id TEXT,
        processed_at TEXT NOT NULL,
        tracking_numbers TEXT NOT NULL DEFAULT '[]',
        status TEXT NOT NULL,
        sender TEXT NOT NULL DEFAULT '',
        subject TEXT NOT NULL DEFAULT '',
        error_message TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_processed_emails_processed_at
        ON processed_emails(processed_at)",
    "CREATE TABLE IF NOT EXISTS email_shipment_links (
        processed_email_id INTEGER NOT NULL REFERENCES processed_emails(id) ON DELETE CASCADE,
        shipment_id INTEGER NOT NULL REFERENCES shipments(id) ON DELETE CASCADE,
        PRIMARY KEY (processed_email_id, shipment_id)
    )",
];

/// Store handle shared across the service
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the store file and run migrations
    pub async fn connect(path: &str) -> Result<Self> {
        info!(path, "Opening store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests
    pub async fn connect_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Store schema up to date");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Liveness probe used by /api/health
    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
