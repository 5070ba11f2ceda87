//! Embedded relational store for the ParcelTrack platform.
//!
//! One SQLite file owns all persistent state: shipments, tracking events,
//! the persisted refresh-cache tier, processed emails and email-shipment
//! links. The schema is created and migrated on startup.

mod emails;
mod error;
mod events;
mod refresh_cache;
mod shipments;
mod store;

pub use emails::{NewProcessedEmail, ProcessedEmailRepository};
pub use error::{Result, StoreError};
pub use events::TrackingEventRepository;
pub use refresh_cache::{PersistedCacheEntry, RefreshCacheRepository};
pub use shipments::{RefreshUpdate, ShipmentRepository};
pub use store::Store;
