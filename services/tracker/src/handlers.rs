//! HTTP handlers for the tracker API

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use parceltrack_carriers::{ClientFactory, Transport};
use parceltrack_core::carrier::Carrier;
use parceltrack_core::domain::{
    CreateShipmentRequest, RefreshResponse, Shipment, TrackingEvent, UpdateShipmentRequest,
};
use parceltrack_store::{ShipmentRepository, TrackingEventRepository};

use crate::{AppState, Error, Result};

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub database: bool,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = state.store.ping().await;
    Json(HealthResponse {
        status: if database { "healthy" } else { "degraded" }.to_string(),
        service: "tracker".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database,
    })
}

// ============================================
// Shipment Handlers
// ============================================

pub async fn list_shipments(State(state): State<AppState>) -> Result<Json<Vec<Shipment>>> {
    let repo = ShipmentRepository::new(&state.store);
    let shipments = repo.find_all().await?;
    Ok(Json(shipments))
}

pub async fn create_shipment(
    State(state): State<AppState>,
    Json(req): Json<CreateShipmentRequest>,
) -> Result<(StatusCode, Json<Shipment>)> {
    req.validate()
        .map_err(|e| Error::Validation(e.to_string()))?;

    let repo = ShipmentRepository::new(&state.store);
    let shipment = repo.create(&req).await?;
    Ok((StatusCode::CREATED, Json(shipment)))
}

pub async fn get_shipment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Shipment>> {
    let repo = ShipmentRepository::new(&state.store);
    let shipment = repo
        .find_by_id(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("shipment {id}")))?;
    Ok(Json(shipment))
}

pub async fn update_shipment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateShipmentRequest>,
) -> Result<Json<Shipment>> {
    let repo = ShipmentRepository::new(&state.store);
    let shipment = repo.update(id, &req).await?;

    // An edited shipment must not serve a stale cached refresh
    state.cache.invalidate_shipment(id).await;

    Ok(Json(shipment))
}

pub async fn delete_shipment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    let repo = ShipmentRepository::new(&state.store);
    repo.delete(id).await?;

    state.cache.invalidate_shipment(id).await;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_shipment_events(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<TrackingEvent>>> {
    let shipments = ShipmentRepository::new(&state.store);
    if shipments.find_by_id(id).await?.is_none() {
        return Err(Error::NotFound(format!("shipment {id}")));
    }

    let events = TrackingEventRepository::new(&state.store)
        .list_for_shipment(id)
        .await?;
    Ok(Json(events))
}

// ============================================
// Refresh Handler
// ============================================

#[derive(Debug, Default, Deserialize)]
pub struct RefreshQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn refresh_shipment(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<RefreshQuery>,
) -> Result<Json<RefreshResponse>> {
    let response = state.engine.refresh(id, query.force).await?;
    Ok(Json(response))
}

// ============================================
// Carrier Handlers
// ============================================

#[derive(Debug, Default, Deserialize)]
pub struct CarrierListQuery {
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct CarrierInfo {
    pub code: &'static str,
    pub name: &'static str,
    pub transport: Transport,
    /// Whether API credentials are configured for this carrier
    pub active: bool,
    pub auto_update_enabled: bool,
    pub sample_formats: &'static [&'static str],
}

fn sample_formats(carrier: Carrier) -> &'static [&'static str] {
    match carrier {
        Carrier::Ups => &["1Z9999999999999999"],
        Carrier::Usps => &["9400100000000000000000", "EC123456789US"],
        Carrier::Fedex => &["999999999999", "999999999999999"],
        Carrier::Dhl => &["9999999999", "99999999999"],
    }
}

pub async fn list_carriers(
    State(state): State<AppState>,
    Query(query): Query<CarrierListQuery>,
) -> Json<Vec<CarrierInfo>> {
    let carriers = Carrier::ALL
        .into_iter()
        .map(|carrier| CarrierInfo {
            code: carrier.as_str(),
            name: carrier.display_name(),
            transport: state.factory.transport(carrier),
            active: ClientFactory::has_api_credentials(carrier, state.config.carriers.get(carrier)),
            auto_update_enabled: state.config.carrier_auto_update_enabled(carrier),
            sample_formats: sample_formats(carrier),
        })
        .filter(|info| !query.active || info.active)
        .collect();
    Json(carriers)
}
