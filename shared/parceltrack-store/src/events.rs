//! Tracking event repository

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use parceltrack_core::carrier::ShipmentStatus;
use parceltrack_core::domain::TrackingEvent;

use crate::error::Result;
use crate::store::Store;

/// Insert events for a shipment, skipping tuples already present.
///
/// Dedup key is (timestamp, status, description); the insert is an
/// `OR IGNORE` against the unique index, so replays are no-ops.
/// Returns the number of rows actually inserted.
pub(crate) async fn insert_events_dedup(
    conn: &mut SqliteConnection,
    shipment_id: i64,
    events: &[TrackingEvent],
) -> Result<i64> {
    let now = Utc::now();
    let mut added = 0i64;

    for event in events {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO tracking_events
                (shipment_id, timestamp, location, status, description, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(shipment_id)
        .bind(event.timestamp)
        .bind(&event.location)
        .bind(event.status.as_str())
        .bind(&event.description)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        added += result.rows_affected() as i64;
    }

    Ok(added)
}

/// Repository for persisted tracking events
pub struct TrackingEventRepository<'a> {
    store: &'a Store,
}

impl<'a> TrackingEventRepository<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Events for a shipment in carrier-reported timestamp order
    pub async fn list_for_shipment(&self, shipment_id: i64) -> Result<Vec<TrackingEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM tracking_events
             WHERE shipment_id = $1
             ORDER BY timestamp, id",
        )
        .bind(shipment_id)
        .fetch_all(self.store.pool())
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    pub async fn count_for_shipment(&self, shipment_id: i64) -> Result<i64> {
        let count =
            sqlx::query_scalar("SELECT COUNT(*) FROM tracking_events WHERE shipment_id = $1")
                .bind(shipment_id)
                .fetch_one(self.store.pool())
                .await?;
        Ok(count)
    }
}

fn row_to_event(row: &SqliteRow) -> Result<TrackingEvent> {
    let status: String = row.try_get("status")?;
    Ok(TrackingEvent {
        id: row.try_get("id")?,
        shipment_id: row.try_get("shipment_id")?,
        timestamp: row.try_get("timestamp")?,
        location: row.try_get("location")?,
        status: ShipmentStatus::parse(&status),
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}
