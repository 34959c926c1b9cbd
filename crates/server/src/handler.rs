//! Handler implementation for the geodb RPC service, grounded on
//! `spatio-server::handler`'s `Handler { write_tx, reader }` split: writes go
//! through the background writer's channel, reads run directly against a
//! cloned handle since the substrate's read path never blocks a tokio worker
//! for long.

use std::collections::HashMap;
use std::sync::Arc;

use geodb_types::{Bound, EventBatch, Object, ObjectDetail, Point};
use tarpc::context;
use tokio::sync::mpsc;

use geodb_core::{EventBus, GeocodingCache, ObjectBus, ObjectStore};

use crate::error::Error;
use crate::protocol::{GeodbService, StreamFilter};
use crate::writer::{self, WriteOp};

/// Checks a request's credential against `GEODB_PASSWORD`. The listener
/// that extracts the credential from request
/// metadata and calls this in front of every dispatch is out of scope; this
/// is the hook it wires up.
pub fn check_auth(configured: Option<&str>, provided: Option<&str>) -> Result<(), Error> {
    match configured {
        None => Ok(()),
        Some(expected) if provided == Some(expected) => Ok(()),
        Some(_) => Err(Error::unauthenticated()),
    }
}

#[derive(Clone)]
pub struct Handler {
    store: Arc<ObjectStore>,
    write_tx: mpsc::Sender<WriteOp>,
    object_bus: Arc<ObjectBus>,
    event_bus: Arc<EventBus>,
    cache: Option<Arc<GeocodingCache>>,
}

impl Handler {
    pub fn new(
        store: Arc<ObjectStore>,
        write_tx: mpsc::Sender<WriteOp>,
        object_bus: Arc<ObjectBus>,
        event_bus: Arc<EventBus>,
        cache: Option<Arc<GeocodingCache>>,
    ) -> Self {
        Self {
            store,
            write_tx,
            object_bus,
            event_bus,
            cache,
        }
    }

    /// Drains `client_id`'s object-bus subscription into `sink` until the
    /// stream is cancelled or the subscriber lags out of existence. A
    /// listener's streaming transport calls this once it has resolved a
    /// `subscribe_objects` id to a connection.
    pub async fn pump_object_stream<F>(&self, client_id: &str, filter: StreamFilter, mut sink: F)
    where
        F: FnMut(ObjectDetail) -> bool,
    {
        let Some(mut rx) = self.object_bus.get_stream(client_id) else {
            return;
        };
        loop {
            match rx.recv().await {
                Ok(detail) if crate::protocol::object_passes(&detail, &filter) => {
                    if !sink(detail) {
                        break;
                    }
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub async fn pump_event_stream<F>(&self, client_id: &str, filter: StreamFilter, mut sink: F)
    where
        F: FnMut(EventBatch) -> bool,
    {
        let Some(mut rx) = self.event_bus.get_stream(client_id) else {
            return;
        };
        loop {
            match rx.recv().await {
                Ok(batch) if crate::protocol::event_passes(&batch, &filter) => {
                    if !sink(batch) {
                        break;
                    }
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Attaches the address/timezone side-tables a `Set`'s `get_address`/
    /// `get_timezone` flags requested, writing the updated
    /// detail back and republishing it on the object bus. A provider
    /// failure is logged and the detail is left without that side-table;
    /// `Set` itself already succeeded.
    async fn attach_side_tables(&self, cache: &Arc<GeocodingCache>, detail: &mut ObjectDetail) {
        let mut changed = false;

        if detail.object.get_address && detail.address.is_none() {
            match cache.address(detail.object.point).await {
                Ok(address) => {
                    detail.address = Some(address);
                    changed = true;
                }
                Err(e) => log::error!("geodb: address lookup for {} failed: {e}", detail.object.key),
            }
        }

        if detail.object.get_timezone && detail.timezone.is_none() {
            match cache.timezone(detail.object.point).await {
                Ok(tz) => {
                    detail.timezone = Some(tz);
                    changed = true;
                }
                Err(e) => log::error!("geodb: timezone lookup for {} failed: {e}", detail.object.key),
            }
        }

        if changed {
            if let Err(e) = writer::submit_put_detail(&self.write_tx, detail.clone()).await {
                log::error!("geodb: failed to persist side-tables for {}: {e}", detail.object.key);
            }
        }
    }
}

impl GeodbService for Handler {
    async fn ping(self, _: context::Context) -> Result<(), Error> {
        Ok(())
    }

    async fn set(
        self,
        _: context::Context,
        objects: HashMap<String, Object>,
    ) -> Result<HashMap<String, ObjectDetail>, Error> {
        let mut details = writer::submit_set(&self.write_tx, objects).await.map_err(Error::from)?;
        if let Some(cache) = self.cache.clone() {
            for detail in details.values_mut() {
                self.attach_side_tables(&cache, detail).await;
            }
        }
        Ok(details)
    }

    async fn get(self, _: context::Context, keys: Vec<String>) -> Result<HashMap<String, ObjectDetail>, Error> {
        self.store.get(&keys).map_err(Error::from)
    }

    async fn get_prefix(self, _: context::Context, prefix: String) -> Result<HashMap<String, ObjectDetail>, Error> {
        self.store.get_prefix(&prefix).map_err(Error::from)
    }

    async fn get_regex(self, _: context::Context, pattern: String) -> Result<HashMap<String, ObjectDetail>, Error> {
        self.store.get_regex(&pattern).map_err(Error::from)
    }

    async fn get_keys(self, _: context::Context) -> Result<Vec<String>, Error> {
        self.store.get_keys().map_err(Error::from)
    }

    async fn get_prefix_keys(self, _: context::Context, prefix: String) -> Result<Vec<String>, Error> {
        self.store.get_prefix_keys(&prefix).map_err(Error::from)
    }

    async fn get_regex_keys(self, _: context::Context, pattern: String) -> Result<Vec<String>, Error> {
        self.store.get_regex_keys(&pattern).map_err(Error::from)
    }

    async fn scan_bound(
        self,
        _: context::Context,
        bound: Bound,
        keys: Option<Vec<String>>,
    ) -> Result<HashMap<String, ObjectDetail>, Error> {
        self.store.scan_bound(bound, keys.as_deref()).map_err(Error::from)
    }

    async fn scan_prefix_bound(
        self,
        _: context::Context,
        bound: Bound,
        prefix: String,
    ) -> Result<HashMap<String, ObjectDetail>, Error> {
        self.store.scan_prefix_bound(bound, &prefix).map_err(Error::from)
    }

    async fn scan_regex_bound(
        self,
        _: context::Context,
        bound: Bound,
        pattern: String,
    ) -> Result<HashMap<String, ObjectDetail>, Error> {
        self.store.scan_regex_bound(bound, &pattern).map_err(Error::from)
    }

    async fn delete(self, _: context::Context, keys: Vec<String>) -> Result<(), Error> {
        writer::submit_delete(&self.write_tx, keys).await.map_err(Error::from)
    }

    async fn get_point(self, _: context::Context, address: String) -> Result<Point, Error> {
        match &self.cache {
            Some(cache) => cache.coordinates(&address).await.map_err(Error::from),
            None => Err(Error::Unimplemented(
                "geocoding cache is not configured".to_string(),
            )),
        }
    }

    async fn subscribe_objects(self, _: context::Context, client_id: Option<String>, _filter: StreamFilter) -> String {
        self.object_bus.subscribe(client_id)
    }

    async fn subscribe_events(self, _: context::Context, client_id: Option<String>, _filter: StreamFilter) -> String {
        self.event_bus.subscribe(client_id)
    }

    async fn unsubscribe_objects(self, _: context::Context, client_id: String) {
        self.object_bus.unsubscribe(&client_id);
    }

    async fn unsubscribe_events(self, _: context::Context, client_id: String) {
        self.event_bus.unsubscribe(&client_id);
    }
}
