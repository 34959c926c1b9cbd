//! Protocol definitions for the geodb RPC facade, grounded on
//! `spatio-server::protocol`'s `#[tarpc::service]` trait shape: plain data
//! types plus one service trait, every method taking `tarpc::context::Context`
//! first and returning a [`crate::error::Error`] the caller can map onto one
//! of the five typed statuses via `.status()`.

use std::collections::HashMap;

use geodb_types::{Bound, EventBatch, Object, ObjectDetail, Point};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Filter for a streaming subscription. `All` carries no predicate.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub enum StreamFilter {
    #[default]
    All,
    Keys(Vec<String>),
    Prefix(String),
    Regex(String),
}

#[tarpc::service]
pub trait GeodbService {
    /// Liveness probe.
    async fn ping() -> Result<(), Error>;

    async fn set(objects: HashMap<String, Object>) -> Result<HashMap<String, ObjectDetail>, Error>;

    async fn get(keys: Vec<String>) -> Result<HashMap<String, ObjectDetail>, Error>;

    async fn get_prefix(prefix: String) -> Result<HashMap<String, ObjectDetail>, Error>;

    async fn get_regex(pattern: String) -> Result<HashMap<String, ObjectDetail>, Error>;

    async fn get_keys() -> Result<Vec<String>, Error>;

    async fn get_prefix_keys(prefix: String) -> Result<Vec<String>, Error>;

    async fn get_regex_keys(pattern: String) -> Result<Vec<String>, Error>;

    async fn scan_bound(bound: Bound, keys: Option<Vec<String>>) -> Result<HashMap<String, ObjectDetail>, Error>;

    async fn scan_prefix_bound(bound: Bound, prefix: String) -> Result<HashMap<String, ObjectDetail>, Error>;

    async fn scan_regex_bound(bound: Bound, pattern: String) -> Result<HashMap<String, ObjectDetail>, Error>;

    async fn delete(keys: Vec<String>) -> Result<(), Error>;

    /// Forward-geocodes `address` into a [`Point`] via the geocoding cache.
    async fn get_point(address: String) -> Result<Point, Error>;

    /// Registers a subscription against the object bus and returns its id.
    /// The actual message delivery rides a separate streaming connection
    /// keyed by that id; the listener that multiplexes request/response and
    /// streaming traffic is out of scope, this is the facade contract a
    /// listener wires up.
    async fn subscribe_objects(client_id: Option<String>, filter: StreamFilter) -> String;

    async fn subscribe_events(client_id: Option<String>, filter: StreamFilter) -> String;

    async fn unsubscribe_objects(client_id: String);

    async fn unsubscribe_events(client_id: String);
}

/// True iff `detail`'s key (as recorded on its `object.key`) passes `filter`.
pub fn object_passes(detail: &ObjectDetail, filter: &StreamFilter) -> bool {
    match filter {
        StreamFilter::All => true,
        StreamFilter::Keys(keys) => keys.iter().any(|k| k == &detail.object.key),
        StreamFilter::Prefix(prefix) => detail.object.key.starts_with(prefix.as_str()),
        StreamFilter::Regex(pattern) => regex::Regex::new(pattern)
            .map(|re| re.is_match(&detail.object.key))
            .unwrap_or(false),
    }
}

/// True iff `batch`'s trigger key passes `filter`.
pub fn event_passes(batch: &EventBatch, filter: &StreamFilter) -> bool {
    match filter {
        StreamFilter::All => true,
        StreamFilter::Keys(keys) => keys.iter().any(|k| k == &batch.trigger.key),
        StreamFilter::Prefix(prefix) => batch.trigger.key.starts_with(prefix.as_str()),
        StreamFilter::Regex(pattern) => regex::Regex::new(pattern)
            .map(|re| re.is_match(&batch.trigger.key))
            .unwrap_or(false),
    }
}
