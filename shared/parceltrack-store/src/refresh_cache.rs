//! Persisted tier of the refresh cache.
//!
//! Keys are opaque text: `shipment:<id>` for refresh responses bound to a
//! shipment, `validation:<carrier>:<number>` for email-validation lookups.
//! The key spaces are disjoint so validation entries never collide with
//! shipment entries.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::Result;
use crate::store::Store;

/// One persisted cache row
#[derive(Debug, Clone)]
pub struct PersistedCacheEntry {
    pub cache_key: String,
    pub shipment_id: Option<i64>,
    /// Serialized RefreshResponse, stored verbatim
    pub response: String,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Repository for the persisted cache tier
pub struct RefreshCacheRepository<'a> {
    store: &'a Store,
}

impl<'a> RefreshCacheRepository<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Insert or replace the entry for a key (at most one row per key)
    pub async fn upsert(&self, entry: &PersistedCacheEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO refresh_cache
                (cache_key, shipment_id, response, cached_at, expires_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (cache_key) DO UPDATE SET
                shipment_id = excluded.shipment_id,
                response = excluded.response,
                cached_at = excluded.cached_at,
                expires_at = excluded.expires_at",
        )
        .bind(&entry.cache_key)
        .bind(entry.shipment_id)
        .bind(&entry.response)
        .bind(entry.cached_at)
        .bind(entry.expires_at)
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    /// Fetch the entry for a key if it is still live at `now`
    pub async fn get_live(
        &self,
        cache_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PersistedCacheEntry>> {
        let row = sqlx::query(
            "SELECT * FROM refresh_cache WHERE cache_key = $1 AND expires_at > $2",
        )
        .bind(cache_key)
        .bind(now)
        .fetch_optional(self.store.pool())
        .await?;

        row.map(|r| row_to_entry(&r)).transpose()
    }

    /// When the key was last written, regardless of expiry. The validation
    /// path uses this as its rate-limit reference point.
    pub async fn get_cached_at(&self, cache_key: &str) -> Result<Option<DateTime<Utc>>> {
        let cached_at =
            sqlx::query_scalar("SELECT cached_at FROM refresh_cache WHERE cache_key = $1")
                .bind(cache_key)
                .fetch_optional(self.store.pool())
                .await?;
        Ok(cached_at)
    }

    pub async fn delete(&self, cache_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM refresh_cache WHERE cache_key = $1")
            .bind(cache_key)
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        sqlx::query("DELETE FROM refresh_cache")
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    /// Remove entries whose expiry has passed; returns the number removed
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_cache WHERE expires_at <= $1")
            .bind(now)
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_entry(row: &SqliteRow) -> Result<PersistedCacheEntry> {
    Ok(PersistedCacheEntry {
        cache_key: row.try_get("cache_key")?,
        shipment_id: row.try_get("shipment_id")?,
        response: row.try_get("response")?,
        cached_at: row.try_get("cached_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn entry(key: &str, shipment_id: Option<i64>, expires_in: TimeDelta) -> PersistedCacheEntry {
        let now = Utc::now();
        PersistedCacheEntry {
            cache_key: key.to_string(),
            shipment_id,
            response: "{\"events\":[]}".to_string(),
            cached_at: now,
            expires_at: now + expires_in,
        }
    }

    #[tokio::test]
    async fn test_upsert_replaces_single_row() {
        let store = Store::connect_in_memory().await.unwrap();
        let repo = RefreshCacheRepository::new(&store);

        repo.upsert(&entry("shipment:1", Some(1), TimeDelta::minutes(5)))
            .await
            .unwrap();
        repo.upsert(&entry("shipment:1", Some(1), TimeDelta::minutes(10)))
            .await
            .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM refresh_cache")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_not_live() {
        let store = Store::connect_in_memory().await.unwrap();
        let repo = RefreshCacheRepository::new(&store);

        repo.upsert(&entry("shipment:2", Some(2), TimeDelta::seconds(-1)))
            .await
            .unwrap();
        assert!(repo.get_live("shipment:2", Utc::now()).await.unwrap().is_none());

        // Still physically present until purged
        let purged = repo.purge_expired(Utc::now()).await.unwrap();
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn test_validation_keys_do_not_collide() {
        let store = Store::connect_in_memory().await.unwrap();
        let repo = RefreshCacheRepository::new(&store);

        repo.upsert(&entry("shipment:3", Some(3), TimeDelta::minutes(5)))
            .await
            .unwrap();
        repo.upsert(&entry("validation:ups:1Z999AA10123456784", None, TimeDelta::minutes(5)))
            .await
            .unwrap();

        assert!(repo.get_live("shipment:3", Utc::now()).await.unwrap().is_some());
        assert!(repo
            .get_live("validation:ups:1Z999AA10123456784", Utc::now())
            .await
            .unwrap()
            .is_some());
    }
}
