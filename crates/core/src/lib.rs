//! Core persistence, geospatial and streaming engine for geodb: a
//! log-structured object store, a geofence evaluator, a fan-out streaming
//! hub and a geocoding cache, grounded throughout on `spatio`'s storage,
//! persistence and service layers.

pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod geo;
pub mod geofence;
pub mod hub;
pub mod kv;
pub mod store;

pub use cache::{GeocodingCache, MapsProvider, NullProvider};
pub use config::Config;
pub use error::{Error, Result};
pub use geofence::GeofenceEvaluator;
pub use hub::{Bus, EventBus, ObjectBus, DEFAULT_QUEUE_DEPTH};
pub use kv::{Entry, ReadTxn, Substrate, WriteTxn};
pub use store::ObjectStore;
