//! Router configuration for the tracker API

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::{admin, handlers, AppState};

/// Create the main router with all routes
pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route("/api/admin/tracking-updater/status", get(admin::updater_status))
        .route("/api/admin/tracking-updater/pause", post(admin::updater_pause))
        .route("/api/admin/tracking-updater/resume", post(admin::updater_resume))
        .route("/api/admin/email-ingest/status", get(admin::email_status))
        .route("/api/admin/email-ingest/pause", post(admin::email_pause))
        .route("/api/admin/email-ingest/resume", post(admin::email_resume))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            admin::require_admin,
        ));

    Router::new()
        // Health
        .route("/api/health", get(handlers::health))
        // Shipments
        .route(
            "/api/shipments",
            get(handlers::list_shipments).post(handlers::create_shipment),
        )
        .route(
            "/api/shipments/{id}",
            get(handlers::get_shipment)
                .put(handlers::update_shipment)
                .delete(handlers::delete_shipment),
        )
        .route("/api/shipments/{id}/events", get(handlers::get_shipment_events))
        .route("/api/shipments/{id}/refresh", post(handlers::refresh_shipment))
        // Carriers
        .route("/api/carriers", get(handlers::list_carriers))
        // Admin
        .merge(admin_routes)
        .with_state(state)
}
