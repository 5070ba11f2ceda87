//! Shipment repository

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use parceltrack_core::carrier::{Carrier, ShipmentStatus};
use parceltrack_core::domain::{
    CreateShipmentRequest, Shipment, TrackingEvent, UpdateShipmentRequest,
};

use crate::error::{map_unique, Result, StoreError};
use crate::events::insert_events_dedup;
use crate::store::Store;

/// Shipment fields written by a successful refresh
#[derive(Debug, Clone)]
pub struct RefreshUpdate {
    pub status: ShipmentStatus,
    /// Estimated delivery, or the actual delivery instant once delivered
    pub expected_delivery: Option<DateTime<Utc>>,
    pub refreshed_at: DateTime<Utc>,
}

/// Repository for shipment rows
pub struct ShipmentRepository<'a> {
    store: &'a Store,
}

impl<'a> ShipmentRepository<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, req: &CreateShipmentRequest) -> Result<Shipment> {
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO shipments
                (tracking_number, carrier, description, status, is_delivered,
                 created_at, updated_at)
             VALUES ($1, $2, $3, 'pending', 0, $4, $4)",
        )
        .bind(&req.tracking_number)
        .bind(req.carrier.as_str())
        .bind(req.description.as_deref().unwrap_or(""))
        .bind(now)
        .execute(self.store.pool())
        .await
        .map_err(|e| {
            map_unique(
                e,
                &format!("shipment ({}, {})", req.carrier, req.tracking_number),
            )
        })?;

        let id = result.last_insert_rowid();
        self.find_by_id(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("shipment {id}")))
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<Shipment>> {
        let row = sqlx::query("SELECT * FROM shipments WHERE id = $1")
            .bind(id)
            .fetch_optional(self.store.pool())
            .await?;

        row.map(|r| row_to_shipment(&r)).transpose()
    }

    pub async fn find_all(&self) -> Result<Vec<Shipment>> {
        let rows = sqlx::query("SELECT * FROM shipments ORDER BY created_at DESC, id DESC")
            .fetch_all(self.store.pool())
            .await?;

        rows.iter().map(row_to_shipment).collect()
    }

    pub async fn find_by_tracking(
        &self,
        carrier: Carrier,
        tracking_number: &str,
    ) -> Result<Option<Shipment>> {
        let row = sqlx::query(
            "SELECT * FROM shipments WHERE carrier = $1 AND tracking_number = $2",
        )
        .bind(carrier.as_str())
        .bind(tracking_number)
        .fetch_optional(self.store.pool())
        .await?;

        row.map(|r| row_to_shipment(&r)).transpose()
    }

    /// Shipments a scheduler pass should refresh for one carrier.
    ///
    /// The failure threshold is a strict upper bound: a shipment whose
    /// fail count has reached it is excluded.
    pub async fn find_eligible_for_auto_update(
        &self,
        carrier: Carrier,
        created_after: DateTime<Utc>,
        failure_threshold: i64,
        limit: i64,
    ) -> Result<Vec<Shipment>> {
        let rows = sqlx::query(
            "SELECT * FROM shipments
             WHERE carrier = $1
               AND auto_refresh_enabled = 1
               AND is_delivered = 0
               AND auto_refresh_fail_count < $2
               AND created_at >= $3
             ORDER BY id
             LIMIT $4",
        )
        .bind(carrier.as_str())
        .bind(failure_threshold)
        .bind(created_after)
        .bind(limit)
        .fetch_all(self.store.pool())
        .await?;

        rows.iter().map(row_to_shipment).collect()
    }

    pub async fn update(&self, id: i64, req: &UpdateShipmentRequest) -> Result<Shipment> {
        let now = Utc::now();

        // Re-enabling auto refresh clears the failure state so the
        // scheduler picks the shipment up again.
        let result = sqlx::query(
            "UPDATE shipments SET
                description = COALESCE($1, description),
                auto_refresh_enabled = COALESCE($2, auto_refresh_enabled),
                auto_refresh_fail_count = CASE WHEN $2 = 1 THEN 0
                    ELSE auto_refresh_fail_count END,
                auto_refresh_error = CASE WHEN $2 = 1 THEN NULL
                    ELSE auto_refresh_error END,
                updated_at = $3
             WHERE id = $4",
        )
        .bind(&req.description)
        .bind(req.auto_refresh_enabled)
        .bind(now)
        .bind(id)
        .execute(self.store.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("shipment {id}")));
        }

        self.find_by_id(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("shipment {id}")))
    }

    /// Delete a shipment; events, cache rows and email links cascade
    pub async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM shipments WHERE id = $1")
            .bind(id)
            .execute(self.store.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("shipment {id}")));
        }
        Ok(())
    }

    /// Apply a successful refresh in one transaction: insert the deduplicated
    /// events, then update the shipment row (status, delivery fields, refresh
    /// bookkeeping, failure-state reset).
    ///
    /// Returns (events_added, total_events).
    pub async fn apply_refresh(
        &self,
        shipment_id: i64,
        update: &RefreshUpdate,
        events: &[TrackingEvent],
    ) -> Result<(i64, i64)> {
        let mut tx = self.store.pool().begin().await?;

        let added = insert_events_dedup(&mut tx, shipment_id, events).await?;

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tracking_events WHERE shipment_id = $1")
                .bind(shipment_id)
                .fetch_one(&mut *tx)
                .await?;

        let delivered = update.status.is_delivered();
        let result = sqlx::query(
            "UPDATE shipments SET
                status = $1,
                is_delivered = $2,
                expected_delivery = COALESCE($3, expected_delivery),
                updated_at = $4,
                last_manual_refresh = $4,
                manual_refresh_count = manual_refresh_count + 1,
                auto_refresh_fail_count = 0,
                auto_refresh_error = NULL
             WHERE id = $5",
        )
        .bind(update.status.as_str())
        .bind(delivered)
        .bind(update.expected_delivery)
        .bind(update.refreshed_at)
        .bind(shipment_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("shipment {shipment_id}")));
        }

        tx.commit().await?;
        Ok((added, total))
    }

    /// Record a failed refresh: bump the consecutive-failure counter and
    /// store the truncated error. Returns the new counter value.
    pub async fn record_refresh_failure(
        &self,
        shipment_id: i64,
        error_message: &str,
    ) -> Result<i64> {
        let now = Utc::now();
        let count: Option<i64> = sqlx::query_scalar(
            "UPDATE shipments SET
                auto_refresh_fail_count = auto_refresh_fail_count + 1,
                auto_refresh_error = $1,
                updated_at = $2
             WHERE id = $3
             RETURNING auto_refresh_fail_count",
        )
        .bind(error_message)
        .bind(now)
        .bind(shipment_id)
        .fetch_optional(self.store.pool())
        .await?;

        count.ok_or_else(|| StoreError::NotFound(format!("shipment {shipment_id}")))
    }

    /// Clear a stale auto-refresh error without touching the counters.
    /// Used when the scheduler serves a shipment from cache.
    pub async fn clear_refresh_error(&self, shipment_id: i64) -> Result<()> {
        sqlx::query("UPDATE shipments SET auto_refresh_error = NULL WHERE id = $1")
            .bind(shipment_id)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }
}

fn row_to_shipment(row: &SqliteRow) -> Result<Shipment> {
    let carrier: String = row.try_get("carrier")?;
    let status: String = row.try_get("status")?;

    Ok(Shipment {
        id: row.try_get("id")?,
        tracking_number: row.try_get("tracking_number")?,
        carrier: carrier
            .parse()
            .map_err(|_| StoreError::InvalidRow(format!("carrier '{carrier}'")))?,
        description: row.try_get("description")?,
        status: ShipmentStatus::parse(&status),
        is_delivered: row.try_get("is_delivered")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        expected_delivery: row.try_get("expected_delivery")?,
        last_manual_refresh: row.try_get("last_manual_refresh")?,
        manual_refresh_count: row.try_get("manual_refresh_count")?,
        auto_refresh_enabled: row.try_get("auto_refresh_enabled")?,
        auto_refresh_fail_count: row.try_get("auto_refresh_fail_count")?,
        auto_refresh_error: row.try_get("auto_refresh_error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn create_req(carrier: Carrier, tracking: &str) -> CreateShipmentRequest {
        CreateShipmentRequest {
            tracking_number: tracking.to_string(),
            carrier,
            description: Some("laptop".to_string()),
        }
    }

    fn event(ts: DateTime<Utc>, status: ShipmentStatus, description: &str) -> TrackingEvent {
        TrackingEvent {
            id: 0,
            shipment_id: 0,
            timestamp: ts,
            location: "Louisville, KY".to_string(),
            status,
            description: description.to_string(),
            created_at: ts,
        }
    }

    #[tokio::test]
    async fn test_create_and_fetch() {
        let store = Store::connect_in_memory().await.unwrap();
        let repo = ShipmentRepository::new(&store);

        let shipment = repo
            .create(&create_req(Carrier::Ups, "1Z999AA10123456784"))
            .await
            .unwrap();
        assert_eq!(shipment.status, ShipmentStatus::Pending);
        assert!(!shipment.is_delivered);
        assert_eq!(shipment.manual_refresh_count, 0);
        assert!(shipment.auto_refresh_enabled);

        let found = repo
            .find_by_tracking(Carrier::Ups, "1Z999AA10123456784")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, shipment.id);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = Store::connect_in_memory().await.unwrap();
        let repo = ShipmentRepository::new(&store);

        repo.create(&create_req(Carrier::Usps, "9400100000000000000000"))
            .await
            .unwrap();
        let err = repo
            .create(&create_req(Carrier::Usps, "9400100000000000000000"))
            .await
            .unwrap_err();
        assert!(err.is_duplicate());

        // Same number on a different carrier is a distinct shipment
        repo.create(&create_req(Carrier::Dhl, "9400100000000000000000"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_apply_refresh_dedups_events() {
        let store = Store::connect_in_memory().await.unwrap();
        let repo = ShipmentRepository::new(&store);
        let shipment = repo
            .create(&create_req(Carrier::Ups, "1Z999AA10123456784"))
            .await
            .unwrap();

        let t1: DateTime<Utc> = "2026-03-01T08:00:00Z".parse().unwrap();
        let t2: DateTime<Utc> = "2026-03-01T12:00:00Z".parse().unwrap();
        let update = RefreshUpdate {
            status: ShipmentStatus::InTransit,
            expected_delivery: None,
            refreshed_at: Utc::now(),
        };

        let (added, total) = repo
            .apply_refresh(
                shipment.id,
                &update,
                &[event(t1, ShipmentStatus::InTransit, "Origin scan")],
            )
            .await
            .unwrap();
        assert_eq!((added, total), (1, 1));

        // Re-delivering the same tuple plus one new event adds exactly one
        let (added, total) = repo
            .apply_refresh(
                shipment.id,
                &update,
                &[
                    event(t1, ShipmentStatus::InTransit, "Origin scan"),
                    event(t2, ShipmentStatus::InTransit, "Departed facility"),
                ],
            )
            .await
            .unwrap();
        assert_eq!((added, total), (1, 2));

        let after = repo.find_by_id(shipment.id).await.unwrap().unwrap();
        assert_eq!(after.manual_refresh_count, 2);
        assert_eq!(after.auto_refresh_fail_count, 0);
        assert!(after.last_manual_refresh.is_some());
    }

    #[tokio::test]
    async fn test_refresh_delivered_sets_flag() {
        let store = Store::connect_in_memory().await.unwrap();
        let repo = ShipmentRepository::new(&store);
        let shipment = repo
            .create(&create_req(Carrier::Fedex, "449044304137821"))
            .await
            .unwrap();

        let delivered_at: DateTime<Utc> = "2026-03-02T16:30:00Z".parse().unwrap();
        repo.apply_refresh(
            shipment.id,
            &RefreshUpdate {
                status: ShipmentStatus::Delivered,
                expected_delivery: Some(delivered_at),
                refreshed_at: Utc::now(),
            },
            &[event(delivered_at, ShipmentStatus::Delivered, "Delivered")],
        )
        .await
        .unwrap();

        let after = repo.find_by_id(shipment.id).await.unwrap().unwrap();
        assert!(after.is_delivered);
        assert_eq!(after.status, ShipmentStatus::Delivered);
        assert_eq!(after.expected_delivery, Some(delivered_at));
    }

    #[tokio::test]
    async fn test_record_failure_increments_and_success_resets() {
        let store = Store::connect_in_memory().await.unwrap();
        let repo = ShipmentRepository::new(&store);
        let shipment = repo
            .create(&create_req(Carrier::Dhl, "1234567890"))
            .await
            .unwrap();

        assert_eq!(
            repo.record_refresh_failure(shipment.id, "timeout").await.unwrap(),
            1
        );
        assert_eq!(
            repo.record_refresh_failure(shipment.id, "timeout").await.unwrap(),
            2
        );

        repo.apply_refresh(
            shipment.id,
            &RefreshUpdate {
                status: ShipmentStatus::InTransit,
                expected_delivery: None,
                refreshed_at: Utc::now(),
            },
            &[],
        )
        .await
        .unwrap();

        let after = repo.find_by_id(shipment.id).await.unwrap().unwrap();
        assert_eq!(after.auto_refresh_fail_count, 0);
        assert_eq!(after.auto_refresh_error, None);
    }

    #[tokio::test]
    async fn test_eligibility_threshold_is_strict() {
        let store = Store::connect_in_memory().await.unwrap();
        let repo = ShipmentRepository::new(&store);
        let shipment = repo
            .create(&create_req(Carrier::Usps, "9400100000000000000001"))
            .await
            .unwrap();

        for _ in 0..10 {
            repo.record_refresh_failure(shipment.id, "carrier down")
                .await
                .unwrap();
        }

        let cutoff = Utc::now() - TimeDelta::days(30);
        let eligible = repo
            .find_eligible_for_auto_update(Carrier::Usps, cutoff, 10, 100)
            .await
            .unwrap();
        assert!(eligible.is_empty());

        // One below the threshold is still eligible
        let eligible = repo
            .find_eligible_for_auto_update(Carrier::Usps, cutoff, 11, 100)
            .await
            .unwrap();
        assert_eq!(eligible.len(), 1);
    }

    #[tokio::test]
    async fn test_update_reenabling_auto_refresh_resets_failures() {
        let store = Store::connect_in_memory().await.unwrap();
        let repo = ShipmentRepository::new(&store);
        let shipment = repo
            .create(&create_req(Carrier::Ups, "1Z999AA10123456784"))
            .await
            .unwrap();
        repo.record_refresh_failure(shipment.id, "boom").await.unwrap();

        let updated = repo
            .update(
                shipment.id,
                &UpdateShipmentRequest {
                    description: Some("new desc".to_string()),
                    auto_refresh_enabled: Some(true),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.description, "new desc");
        assert_eq!(updated.auto_refresh_fail_count, 0);
        assert_eq!(updated.auto_refresh_error, None);

        // A description-only update leaves failure state alone
        repo.record_refresh_failure(shipment.id, "boom").await.unwrap();
        let updated = repo
            .update(
                shipment.id,
                &UpdateShipmentRequest {
                    description: Some("again".to_string()),
                    auto_refresh_enabled: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.auto_refresh_fail_count, 1);
    }

    #[tokio::test]
    async fn test_delete_cascades_events() {
        let store = Store::connect_in_memory().await.unwrap();
        let repo = ShipmentRepository::new(&store);
        let shipment = repo
            .create(&create_req(Carrier::Ups, "1Z999AA10123456784"))
            .await
            .unwrap();

        let t1: DateTime<Utc> = "2026-03-01T08:00:00Z".parse().unwrap();
        repo.apply_refresh(
            shipment.id,
            &RefreshUpdate {
                status: ShipmentStatus::InTransit,
                expected_delivery: None,
                refreshed_at: Utc::now(),
            },
            &[event(t1, ShipmentStatus::InTransit, "Origin scan")],
        )
        .await
        .unwrap();

        repo.delete(shipment.id).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tracking_events")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);

        assert!(matches!(
            repo.delete(shipment.id).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
