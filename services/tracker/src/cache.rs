//! Two-tier refresh cache.
//!
//! Tier one is an in-process concurrent map; tier two is the persisted
//! `refresh_cache` table. Writes go through to both tiers, reads hit
//! memory first and fall back to (and re-populate from) the store. A
//! background sweeper removes expired entries from both tiers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parceltrack_core::carrier::Carrier;
use parceltrack_core::domain::RefreshResponse;
use parceltrack_store::{PersistedCacheEntry, RefreshCacheRepository, Store};

/// Sweep period for expired entries
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Cache key spaces: shipment-bound refreshes and pre-shipment validation
/// lookups are disjoint by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Shipment(i64),
    Validation(Carrier, String),
}

impl CacheKey {
    /// Text form used as the persisted primary key
    pub fn storage_key(&self) -> String {
        match self {
            CacheKey::Shipment(id) => format!("shipment:{id}"),
            CacheKey::Validation(carrier, number) => format!("validation:{carrier}:{number}"),
        }
    }

    fn shipment_id(&self) -> Option<i64> {
        match self {
            CacheKey::Shipment(id) => Some(*id),
            CacheKey::Validation(..) => None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    response: RefreshResponse,
    cached_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

pub struct CacheManager {
    store: Store,
    memory: DashMap<CacheKey, MemoryEntry>,
    ttl: TimeDelta,
    disabled: bool,
}

impl CacheManager {
    pub fn new(store: Store, ttl: Duration, disabled: bool) -> Self {
        Self {
            store,
            memory: DashMap::new(),
            ttl: TimeDelta::from_std(ttl).unwrap_or_else(|_| TimeDelta::seconds(300)),
            disabled,
        }
    }

    /// Look up a live entry. Misses on the memory tier fall back to the
    /// persisted row and re-populate memory.
    pub async fn get(&self, key: &CacheKey) -> Option<RefreshResponse> {
        if self.disabled {
            return None;
        }
        let now = Utc::now();

        if let Some(entry) = self.memory.get(key) {
            if now < entry.expires_at {
                return Some(entry.response.clone());
            }
            drop(entry);
            self.memory.remove(key);
        }

        let repo = RefreshCacheRepository::new(&self.store);
        let persisted = match repo.get_live(&key.storage_key(), now).await {
            Ok(persisted) => persisted?,
            Err(e) => {
                warn!(key = %key, "Persisted cache read failed: {e}");
                return None;
            }
        };

        let response: RefreshResponse = match serde_json::from_str(&persisted.response) {
            Ok(response) => response,
            Err(e) => {
                warn!(key = %key, "Discarding undecodable cache row: {e}");
                let _ = repo.delete(&key.storage_key()).await;
                return None;
            }
        };

        self.memory.insert(
            key.clone(),
            MemoryEntry {
                response: response.clone(),
                cached_at: persisted.cached_at,
                expires_at: persisted.expires_at,
            },
        );
        Some(response)
    }

    /// Store a response in both tiers. No-op while the cache is disabled.
    pub async fn set(&self, key: &CacheKey, response: &RefreshResponse, cached_at: DateTime<Utc>) {
        if self.disabled {
            return;
        }
        let expires_at = cached_at + self.ttl;

        self.memory.insert(
            key.clone(),
            MemoryEntry {
                response: response.clone(),
                cached_at,
                expires_at,
            },
        );

        let serialized = match serde_json::to_string(response) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!(key = %key, "Refresh response not serializable: {e}");
                return;
            }
        };
        let repo = RefreshCacheRepository::new(&self.store);
        if let Err(e) = repo
            .upsert(&PersistedCacheEntry {
                cache_key: key.storage_key(),
                shipment_id: key.shipment_id(),
                response: serialized,
                cached_at,
                expires_at,
            })
            .await
        {
            warn!(key = %key, "Persisted cache write failed: {e}");
        }
    }

    /// Instant of the last carrier call recorded for this key, live or
    /// expired. The validation path rate-limits against this.
    pub async fn last_refreshed_at(&self, key: &CacheKey) -> Option<DateTime<Utc>> {
        if let Some(entry) = self.memory.get(key) {
            return Some(entry.cached_at);
        }
        let repo = RefreshCacheRepository::new(&self.store);
        match repo.get_cached_at(&key.storage_key()).await {
            Ok(cached_at) => cached_at,
            Err(e) => {
                warn!(key = %key, "Cache timestamp read failed: {e}");
                None
            }
        }
    }

    /// Remove one key from both tiers
    pub async fn invalidate(&self, key: &CacheKey) {
        self.memory.remove(key);
        let repo = RefreshCacheRepository::new(&self.store);
        if let Err(e) = repo.delete(&key.storage_key()).await {
            warn!(key = %key, "Cache invalidation failed: {e}");
        }
    }

    pub async fn invalidate_shipment(&self, shipment_id: i64) {
        self.invalidate(&CacheKey::Shipment(shipment_id)).await;
    }

    /// Drop everything from both tiers
    pub async fn clear(&self) {
        self.memory.clear();
        let repo = RefreshCacheRepository::new(&self.store);
        if let Err(e) = repo.clear().await {
            warn!("Cache clear failed: {e}");
        }
    }

    /// Remove expired entries from both tiers; called by the sweeper and
    /// once at startup before the service takes traffic.
    pub async fn purge_expired(&self) -> u64 {
        let now = Utc::now();
        self.memory.retain(|_, entry| now < entry.expires_at);

        let repo = RefreshCacheRepository::new(&self.store);
        match repo.purge_expired(now).await {
            Ok(purged) => purged,
            Err(e) => {
                warn!("Persisted cache purge failed: {e}");
                0
            }
        }
    }

    pub fn entry_count(&self) -> usize {
        self.memory.len()
    }

    /// Background sweeper, one pass per minute until cancelled
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired().await;
                        if purged > 0 {
                            debug!(purged, "Cache sweep removed expired entries");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parceltrack_core::domain::RefreshResponse;

    fn response(shipment_id: i64) -> RefreshResponse {
        RefreshResponse {
            shipment_id,
            updated_at: Utc::now(),
            events_added: 1,
            total_events: 1,
            events: vec![],
        }
    }

    async fn manager(ttl_secs: u64, disabled: bool) -> CacheManager {
        let store = Store::connect_in_memory().await.unwrap();
        CacheManager::new(store, Duration::from_secs(ttl_secs), disabled)
    }

    #[tokio::test]
    async fn test_set_then_get_round_trips() {
        let cache = manager(300, false).await;
        let key = CacheKey::Shipment(1);

        let stored = response(1);
        cache.set(&key, &stored, Utc::now()).await;
        let got = cache.get(&key).await.unwrap();
        assert_eq!(got, stored);
    }

    #[tokio::test]
    async fn test_memory_miss_falls_back_to_store() {
        let store = Store::connect_in_memory().await.unwrap();
        let writer = CacheManager::new(store.clone(), Duration::from_secs(300), false);
        let key = CacheKey::Shipment(2);
        writer.set(&key, &response(2), Utc::now()).await;

        // Fresh manager over the same store simulates a process restart
        let reader = CacheManager::new(store, Duration::from_secs(300), false);
        assert_eq!(reader.entry_count(), 0);
        assert!(reader.get(&key).await.is_some());
        // Read-through re-populated the memory tier
        assert_eq!(reader.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_misses() {
        let cache = manager(0, false).await;
        let key = CacheKey::Shipment(3);
        cache.set(&key, &response(3), Utc::now()).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_cache_is_inert() {
        let cache = manager(300, true).await;
        let key = CacheKey::Shipment(4);
        cache.set(&key, &response(4), Utc::now()).await;
        assert!(cache.get(&key).await.is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_removes_both_tiers() {
        let cache = manager(300, false).await;
        let key = CacheKey::Shipment(5);
        cache.set(&key, &response(5), Utc::now()).await;

        cache.invalidate(&key).await;
        assert!(cache.get(&key).await.is_none());
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_validation_and_shipment_keys_disjoint() {
        let cache = manager(300, false).await;
        let shipment_key = CacheKey::Shipment(6);
        let validation_key = CacheKey::Validation(Carrier::Ups, "1Z999AA1234567890".to_string());

        cache.set(&shipment_key, &response(6), Utc::now()).await;
        cache.set(&validation_key, &response(-1), Utc::now()).await;

        cache.invalidate(&shipment_key).await;
        assert!(cache.get(&validation_key).await.is_some());
    }

    #[tokio::test]
    async fn test_purge_expired_sweeps_both_tiers() {
        let cache = manager(0, false).await;
        let key = CacheKey::Shipment(7);
        cache.set(&key, &response(7), Utc::now()).await;

        let purged = cache.purge_expired().await;
        assert_eq!(purged, 1);
        assert_eq!(cache.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_last_refreshed_at_survives_expiry() {
        let cache = manager(0, false).await;
        let key = CacheKey::Validation(Carrier::Dhl, "1234567890".to_string());
        let cached_at = Utc::now();
        cache.set(&key, &response(-1), cached_at).await;

        // Entry is expired for reads but still dates the last carrier call
        assert!(cache.get(&key).await.is_none());
        let last = cache.last_refreshed_at(&key).await.unwrap();
        assert!((last - cached_at).num_seconds().abs() < 2);
    }
}
