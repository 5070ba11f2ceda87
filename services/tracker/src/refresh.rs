//! Refresh engine: fetches the latest carrier state for one shipment and
//! reconciles it into the store.
//!
//! The engine owns the cache lookup, the rate-limit gate, client dispatch,
//! the event diff and the atomic persistence step. The scheduler and the
//! email pipeline both drive it rather than talking to carriers directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use parceltrack_carriers::{
    CarrierError, ClientFactory, SelectedClient, TrackingRequest, TrackingResponse as CarrierResponse,
};
use parceltrack_core::carrier::Carrier;
use parceltrack_core::config::Config;
use parceltrack_core::domain::{
    truncate_refresh_error, RefreshResponse, TrackingEvent, VALIDATION_SHIPMENT_ID,
};
use parceltrack_core::rate_limit::check_refresh_rate_limit;
use parceltrack_store::{RefreshUpdate, ShipmentRepository, Store};

use crate::cache::{CacheKey, CacheManager};
use crate::error::{Error, Result};

/// Client dispatch seam; the factory implements it in production and tests
/// substitute canned clients.
pub trait ClientProvider: Send + Sync {
    fn client_for(&self, carrier: Carrier) -> SelectedClient;
}

impl ClientProvider for ClientFactory {
    fn client_for(&self, carrier: Carrier) -> SelectedClient {
        self.select(carrier).clone()
    }
}

pub struct RefreshEngine {
    store: Store,
    cache: Arc<CacheManager>,
    clients: Arc<dyn ClientProvider>,
    config: Arc<Config>,
}

impl RefreshEngine {
    pub fn new(
        store: Store,
        cache: Arc<CacheManager>,
        clients: Arc<dyn ClientProvider>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            cache,
            clients,
            config,
        }
    }

    /// Refresh one shipment.
    ///
    /// With `force == false` a live cache entry is served unchanged and the
    /// rate-limit gate applies; `force == true` bypasses both and always
    /// reaches the carrier.
    pub async fn refresh(&self, shipment_id: i64, force: bool) -> Result<RefreshResponse> {
        let shipments = ShipmentRepository::new(&self.store);
        let shipment = shipments
            .find_by_id(shipment_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("shipment {shipment_id}")))?;

        let key = CacheKey::Shipment(shipment_id);
        if !force {
            if let Some(cached) = self.cache.get(&key).await {
                debug!(shipment_id, "Refresh served from cache");
                return Ok(cached);
            }
        }

        let decision = check_refresh_rate_limit(
            self.config.rate_limit.disabled,
            self.config.rate_limit.window(),
            shipment.last_manual_refresh,
            Utc::now(),
            force,
        );
        if decision.should_block {
            debug!(shipment_id, reason = decision.reason, "Refresh rate limited");
            return Err(Error::RateLimited {
                remaining_seconds: decision.remaining.as_secs() as i64,
            });
        }

        let selected = self.clients.client_for(shipment.carrier);
        let timeout = Duration::from_secs(self.config.auto_update.individual_timeout_secs);
        let request = TrackingRequest::single(shipment.carrier, shipment.tracking_number.clone());

        let outcome = self.call_carrier(&selected, &request, timeout).await;
        let tracked = match outcome {
            Ok(tracked) => tracked,
            Err(carrier_err) => {
                return Err(self
                    .record_failure(&shipments, shipment_id, carrier_err)
                    .await);
            }
        };

        // An empty result set means the carrier has no record of the number
        let Some(info) = tracked
            .results
            .iter()
            .find(|result| result.tracking_number == shipment.tracking_number)
            .or_else(|| tracked.results.first())
        else {
            let err = CarrierError::not_found(format!(
                "{} returned no results for {}",
                shipment.carrier, shipment.tracking_number
            ));
            return Err(self.record_failure(&shipments, shipment_id, err).await);
        };

        let now = Utc::now();
        let events = carrier_events_to_domain(shipment_id, &info.events, now);
        let expected_delivery = if info.status.is_delivered() {
            info.actual_delivery.or(info.estimated_delivery)
        } else {
            info.estimated_delivery
        };

        let (events_added, total_events) = shipments
            .apply_refresh(
                shipment_id,
                &RefreshUpdate {
                    status: info.status,
                    expected_delivery,
                    refreshed_at: now,
                },
                &events,
            )
            .await?;

        info!(
            shipment_id,
            carrier = %shipment.carrier,
            transport = %selected.transport,
            events_added,
            status = %info.status,
            "Refresh complete"
        );

        let response = RefreshResponse {
            shipment_id,
            updated_at: now,
            events_added,
            total_events,
            events,
        };
        self.cache.set(&key, &response, now).await;
        Ok(response)
    }

    /// Validate a candidate tracking number by asking its carrier.
    ///
    /// Structurally a refresh keyed on (carrier, number) because no
    /// shipment exists yet: same cache TTL, same rate-limit window. The
    /// returned events carry the sentinel shipment id and are never
    /// persisted. A candidate is valid iff the carrier reports at least
    /// one event.
    pub async fn validate(&self, carrier: Carrier, tracking_number: &str) -> Result<RefreshResponse> {
        let key = CacheKey::Validation(carrier, tracking_number.to_string());
        if let Some(cached) = self.cache.get(&key).await {
            debug!(%carrier, tracking_number, "Validation served from cache");
            return Ok(cached);
        }

        let last_attempt = self.cache.last_refreshed_at(&key).await;
        let decision = check_refresh_rate_limit(
            self.config.rate_limit.disabled,
            self.config.rate_limit.window(),
            last_attempt,
            Utc::now(),
            false,
        );
        if decision.should_block {
            return Err(Error::RateLimited {
                remaining_seconds: decision.remaining.as_secs() as i64,
            });
        }

        let selected = self.clients.client_for(carrier);
        let timeout = Duration::from_secs(self.config.email.validation_timeout_secs);
        let request = TrackingRequest::single(carrier, tracking_number.to_string());

        let tracked = self.call_carrier(&selected, &request, timeout).await?;
        let info = tracked
            .results
            .first()
            .filter(|info| !info.events.is_empty())
            .ok_or_else(|| {
                Error::Carrier(CarrierError::not_found(format!(
                    "{carrier} reported no events for {tracking_number}"
                )))
            })?;

        let now = Utc::now();
        let events = carrier_events_to_domain(VALIDATION_SHIPMENT_ID, &info.events, now);
        let response = RefreshResponse {
            shipment_id: VALIDATION_SHIPMENT_ID,
            updated_at: now,
            events_added: events.len() as i64,
            total_events: events.len() as i64,
            events,
        };
        self.cache.set(&key, &response, now).await;
        Ok(response)
    }

    async fn call_carrier(
        &self,
        selected: &SelectedClient,
        request: &TrackingRequest,
        timeout: Duration,
    ) -> std::result::Result<CarrierResponse, CarrierError> {
        match tokio::time::timeout(timeout, selected.client.track(request)).await {
            Ok(result) => result,
            Err(_) => Err(CarrierError::timeout(format!(
                "carrier call exceeded {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Persist the failure against the shipment, then surface the error
    async fn record_failure(
        &self,
        shipments: &ShipmentRepository<'_>,
        shipment_id: i64,
        carrier_err: CarrierError,
    ) -> Error {
        let message = truncate_refresh_error(&carrier_err.message);
        match shipments.record_refresh_failure(shipment_id, &message).await {
            Ok(fail_count) => {
                warn!(
                    shipment_id,
                    fail_count,
                    kind = ?carrier_err.kind,
                    "Refresh failed: {message}"
                );
            }
            Err(store_err) => {
                warn!(shipment_id, "Recording refresh failure failed: {store_err}");
            }
        }
        Error::Carrier(carrier_err)
    }
}

fn carrier_events_to_domain(
    shipment_id: i64,
    events: &[parceltrack_carriers::CarrierEvent],
    now: DateTime<Utc>,
) -> Vec<TrackingEvent> {
    events
        .iter()
        .map(|event| TrackingEvent {
            id: 0,
            shipment_id,
            timestamp: event.timestamp,
            location: event.location.clone(),
            status: event.status,
            description: event.description.clone(),
            created_at: now,
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use parceltrack_carriers::{
        CarrierError, SelectedClient, TrackingClient, TrackingRequest, TrackingResponse, Transport,
    };
    use parceltrack_core::carrier::Carrier;

    use super::ClientProvider;
    use std::sync::Arc;

    /// Canned client: pops one scripted outcome per track() call, repeating
    /// the last one when the script runs out.
    pub struct ScriptedClient {
        outcomes: Mutex<Vec<Result<TrackingResponse, CarrierError>>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedClient {
        pub fn new(outcomes: Vec<Result<TrackingResponse, CarrierError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TrackingClient for ScriptedClient {
        async fn track(
            &self,
            _request: &TrackingRequest,
        ) -> Result<TrackingResponse, CarrierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().expect("script lock");
            if outcomes.len() > 1 {
                outcomes.remove(0)
            } else {
                outcomes
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Err(CarrierError::unknown("script exhausted")))
            }
        }

        fn validate_tracking_number(&self, _tracking_number: &str) -> bool {
            true
        }

        fn carrier_name(&self) -> &'static str {
            "scripted"
        }
    }

    pub struct ScriptedProvider {
        pub client: Arc<ScriptedClient>,
    }

    impl ClientProvider for ScriptedProvider {
        fn client_for(&self, _carrier: Carrier) -> SelectedClient {
            SelectedClient {
                client: self.client.clone(),
                transport: Transport::Api,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{ScriptedClient, ScriptedProvider};
    use super::*;
    use parceltrack_carriers::{CarrierEvent, TrackingInfo};
    use parceltrack_core::carrier::ShipmentStatus;
    use parceltrack_core::domain::CreateShipmentRequest;

    struct Harness {
        store: Store,
        engine: RefreshEngine,
        client: Arc<ScriptedClient>,
    }

    async fn harness(outcomes: Vec<std::result::Result<CarrierResponse, CarrierError>>) -> Harness {
        let store = Store::connect_in_memory().await.unwrap();
        let config = Arc::new(Config::from_env().unwrap());
        let cache = Arc::new(CacheManager::new(
            store.clone(),
            config.cache.ttl(),
            config.cache.disabled,
        ));
        let client = Arc::new(ScriptedClient::new(outcomes));
        let provider = Arc::new(ScriptedProvider {
            client: client.clone(),
        });
        let engine = RefreshEngine::new(store.clone(), cache, provider, config);
        Harness {
            store,
            engine,
            client,
        }
    }

    fn in_transit_response(tracking_number: &str) -> CarrierResponse {
        let mut info = TrackingInfo::new(tracking_number, ShipmentStatus::InTransit);
        info.events = vec![CarrierEvent {
            timestamp: "2026-03-01T08:00:00Z".parse().unwrap(),
            status: ShipmentStatus::InTransit,
            description: "Origin scan".to_string(),
            location: "Louisville, KY".to_string(),
            details: None,
        }];
        CarrierResponse {
            results: vec![info],
        }
    }

    async fn create_shipment(store: &Store, tracking: &str) -> i64 {
        ShipmentRepository::new(store)
            .create(&CreateShipmentRequest {
                tracking_number: tracking.to_string(),
                carrier: Carrier::Ups,
                description: None,
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_happy_path_manual_refresh() {
        let harness = harness(vec![Ok(in_transit_response("1Z999AA1234567890"))]).await;
        let id = create_shipment(&harness.store, "1Z999AA1234567890").await;

        let response = harness.engine.refresh(id, false).await.unwrap();
        assert_eq!(response.events_added, 1);
        assert_eq!(response.total_events, 1);
        assert_eq!(response.events[0].status, ShipmentStatus::InTransit);

        let shipment = ShipmentRepository::new(&harness.store)
            .find_by_id(id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shipment.status, ShipmentStatus::InTransit);
        assert_eq!(shipment.manual_refresh_count, 1);
        assert!(shipment.last_manual_refresh.is_some());
    }

    #[tokio::test]
    async fn test_second_refresh_is_cache_hit() {
        let harness = harness(vec![Ok(in_transit_response("1Z999AA1234567890"))]).await;
        let id = create_shipment(&harness.store, "1Z999AA1234567890").await;

        let first = harness.engine.refresh(id, false).await.unwrap();
        let second = harness.engine.refresh(id, false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(harness.client.call_count(), 1);

        // Cached responses must not count as manual refreshes
        let shipment = ShipmentRepository::new(&harness.store)
            .find_by_id(id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shipment.manual_refresh_count, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_after_cache_invalidation() {
        let harness = harness(vec![Ok(in_transit_response("1Z999AA1234567890"))]).await;
        let id = create_shipment(&harness.store, "1Z999AA1234567890").await;

        harness.engine.refresh(id, false).await.unwrap();
        harness.engine.cache.invalidate_shipment(id).await;

        let err = harness.engine.refresh(id, false).await.unwrap_err();
        match err {
            Error::RateLimited { remaining_seconds } => {
                assert!(remaining_seconds > 0 && remaining_seconds <= 300);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_force_bypasses_cache_and_rate_limit() {
        let harness = harness(vec![
            Ok(in_transit_response("1Z999AA1234567890")),
            Ok(in_transit_response("1Z999AA1234567890")),
        ])
        .await;
        let id = create_shipment(&harness.store, "1Z999AA1234567890").await;

        harness.engine.refresh(id, false).await.unwrap();
        harness.engine.refresh(id, true).await.unwrap();
        assert_eq!(harness.client.call_count(), 2);

        let shipment = ShipmentRepository::new(&harness.store)
            .find_by_id(id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shipment.manual_refresh_count, 2);
    }

    #[tokio::test]
    async fn test_transport_failure_increments_fail_count() {
        let harness = harness(vec![Err(CarrierError::transport("connection reset"))]).await;
        let id = create_shipment(&harness.store, "1Z999AA1234567890").await;

        let err = harness.engine.refresh(id, false).await.unwrap_err();
        assert!(matches!(err, Error::Carrier(_)));

        let shipment = ShipmentRepository::new(&harness.store)
            .find_by_id(id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shipment.auto_refresh_fail_count, 1);
        assert_eq!(shipment.auto_refresh_error.as_deref(), Some("connection reset"));
        // A failed refresh never bumps the manual counter
        assert_eq!(shipment.manual_refresh_count, 0);
    }

    #[tokio::test]
    async fn test_empty_results_is_not_found_with_fail_count() {
        let harness = harness(vec![Ok(CarrierResponse { results: vec![] })]).await;
        let id = create_shipment(&harness.store, "1Z999AA1234567890").await;

        let err = harness.engine.refresh(id, false).await.unwrap_err();
        match err {
            Error::Carrier(carrier) => {
                assert_eq!(carrier.kind, parceltrack_carriers::CarrierErrorKind::NotFound);
            }
            other => panic!("expected Carrier error, got {other:?}"),
        }

        let shipment = ShipmentRepository::new(&harness.store)
            .find_by_id(id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shipment.auto_refresh_fail_count, 1);
    }

    #[tokio::test]
    async fn test_missing_shipment_is_not_found() {
        let harness = harness(vec![]).await;
        let err = harness.engine.refresh(404, false).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(harness.client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_validate_success_and_cache() {
        let harness = harness(vec![Ok(in_transit_response("1Z999AA1234567890"))]).await;

        let response = harness
            .engine
            .validate(Carrier::Ups, "1Z999AA1234567890")
            .await
            .unwrap();
        assert_eq!(response.shipment_id, VALIDATION_SHIPMENT_ID);
        assert_eq!(response.events.len(), 1);

        // Second validation of the same pair is served from cache
        harness
            .engine
            .validate(Carrier::Ups, "1Z999AA1234567890")
            .await
            .unwrap();
        assert_eq!(harness.client.call_count(), 1);

        // No event rows were persisted for the sentinel
        let count = parceltrack_store::TrackingEventRepository::new(&harness.store)
            .count_for_shipment(VALIDATION_SHIPMENT_ID)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_validate_no_events_is_invalid() {
        let mut info = TrackingInfo::new("INVALID123", ShipmentStatus::Unknown);
        info.events.clear();
        let harness = harness(vec![Ok(CarrierResponse { results: vec![info] })]).await;

        let err = harness.engine.validate(Carrier::Ups, "INVALID123").await.unwrap_err();
        assert!(matches!(err, Error::Carrier(_)));
    }

}
