//! The geofence evaluator, grounded on
//! `original_source/geofence/geo.go`'s inside-only event emission, dispatched
//! off the mutation's critical path through a bounded worker pool so a
//! detached task per `Set` stays bounded rather than unbounded.

use std::collections::HashMap;
use std::sync::Arc;

use geodb_types::{Directions, Event, EventBatch, Object, Tag, Tracker, event_batch_key};
use tokio::sync::{Mutex, Semaphore};

use crate::cache::GeocodingCache;
use crate::codec;
use crate::error::Result;
use crate::geo;
use crate::hub::EventBus;
use crate::store::ObjectStore;

/// Evaluates geofence relations for a trigger object against every peer,
/// persists the resulting [`EventBatch`] and publishes it on the event bus.
///
/// Evaluations of distinct triggers may run concurrently; evaluations of the
/// *same* trigger key are serialized via a per-key mutex, created on demand
/// and dropped once nobody holds it, so two concurrent `Set`s of one key
/// never race on its event-batch record.
pub struct GeofenceEvaluator {
    store: Arc<ObjectStore>,
    event_bus: Arc<EventBus>,
    cache: Option<Arc<GeocodingCache>>,
    trigger_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    dispatch_limit: Arc<Semaphore>,
    runtime: tokio::runtime::Handle,
}

impl GeofenceEvaluator {
    /// Must be called from within a Tokio runtime context: `dispatch` is
    /// invoked from the background writer's plain OS thread, which has no
    /// runtime of its own, so the handle captured here at construction time
    /// (on the async side, where `new` is called) is what `dispatch` spawns
    /// evaluations onto.
    pub fn new(store: Arc<ObjectStore>, event_bus: Arc<EventBus>, worker_pool_size: usize) -> Self {
        Self {
            store,
            event_bus,
            cache: None,
            trigger_locks: Mutex::new(HashMap::new()),
            dispatch_limit: Arc::new(Semaphore::new(worker_pool_size.max(1))),
            runtime: tokio::runtime::Handle::current(),
        }
    }

    /// Enables directions/ETA/distance attachment for tracked peers. Without
    /// a cache, trackers are still honored at the
    /// `Tracking`/`Tracker` data-model level but no `Directions` are ever
    /// attached to an event.
    pub fn with_cache(mut self, cache: Arc<GeocodingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Spawns an off-critical-path evaluation of `trigger` on the bounded
    /// worker pool. The caller's `Set` does not wait for this to complete.
    /// Spawned via the captured runtime handle rather than bare
    /// `tokio::spawn`, since this is called from the background writer's
    /// plain OS thread, which has no ambient Tokio context of its own.
    pub fn dispatch(self: &Arc<Self>, trigger: Object) {
        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            let _permit = match this.dispatch_limit.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if let Err(e) = this.evaluate(trigger).await {
                log::error!("geodb: geofence evaluation failed: {e}");
            }
        });
    }

    async fn per_trigger_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.trigger_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops `key`'s lock slot once nobody else holds it. `lock` is the
    /// caller's own clone, so a strong count of 2 means only the map's copy
    /// and this one are left — no other evaluation is waiting on it.
    async fn release_trigger_lock(&self, key: &str, lock: &Arc<Mutex<()>>) {
        let mut locks = self.trigger_locks.lock().await;
        if let Some(entry) = locks.get(key) {
            if Arc::strong_count(entry) <= 2 {
                locks.remove(key);
            }
        }
    }

    pub async fn evaluate(&self, trigger: Object) -> Result<EventBatch> {
        let key = trigger.key.clone();
        let lock = self.per_trigger_lock(&key).await;

        let result = async {
            let _guard = lock.lock().await;

            let store = Arc::clone(&self.store);
            let trigger_clone = trigger.clone();
            let mut events = tokio::task::spawn_blocking(move || compute_events_sync(&store, &trigger_clone))
                .await
                .map_err(|e| crate::error::Error::internal(format!("evaluator task panicked: {e}")))??;

            self.attach_directions(&trigger, &mut events).await;

            let store = Arc::clone(&self.store);
            let trigger_clone = trigger.clone();
            tokio::task::spawn_blocking(move || persist_batch_sync(&store, trigger_clone, events))
                .await
                .map_err(|e| crate::error::Error::internal(format!("evaluator task panicked: {e}")))?
        }
        .await;

        self.release_trigger_lock(&key, &lock).await;

        let batch = result?;
        self.event_bus.publish(batch.clone());
        Ok(batch)
    }

    /// For every event whose peer is named by one of `trigger`'s trackers,
    /// fetches routing directions and populates only the fields the
    /// tracker's flags request. A provider/cache failure is logged and that
    /// event's directions are left unset; it never fails the batch, since
    /// directions are a best-effort attachment.
    async fn attach_directions(&self, trigger: &Object, events: &mut [Event]) {
        let (Some(cache), Some(tracking)) = (&self.cache, &trigger.tracking) else {
            return;
        };
        if tracking.trackers.is_empty() {
            return;
        }

        for event in events.iter_mut() {
            let Some(tracker) = tracking.trackers.iter().find(|t: &&Tracker| t.target_key == event.object.key) else {
                continue;
            };
            if !(tracker.track_directions || tracker.track_eta || tracker.track_distance) {
                continue;
            }
            match cache.directions(trigger.point, event.object.point, tracking.travel_mode).await {
                Ok(route) => {
                    event.directions = Some(Directions {
                        html_directions: if tracker.track_directions { route.html_directions } else { String::new() },
                        eta_minutes: if tracker.track_eta { route.eta_minutes } else { 0 },
                        distance_m: if tracker.track_distance { route.distance_m } else { 0 },
                    });
                }
                Err(e) => {
                    log::error!("geodb: directions lookup for tracker {} -> {} failed: {e}", trigger.key, event.object.key);
                }
            }
        }
    }
}

fn compute_events_sync(store: &ObjectStore, trigger: &Object) -> Result<Vec<Event>> {
    let read = store.substrate().begin_read();
    let mut events = Vec::new();

    for (key, entry) in read.iter_all(Some(Tag::ObjectDetail.as_u8())) {
        if key.as_ref() == trigger.key.as_bytes() {
            continue;
        }
        let detail: geodb_types::ObjectDetail = match codec::decode(&entry.value) {
            Ok(d) => d,
            Err(e) => {
                log::error!("geodb: skipping unreadable peer {key:?}: {e}");
                continue;
            }
        };
        let peer = detail.object;
        let distance_m = geo::distance_m(trigger.point, peer.point);
        let inside = distance_m <= (trigger.radius_m + peer.radius_m) as f64;
        if !inside {
            continue;
        }
        events.push(Event {
            object: peer,
            distance_m,
            inside: true,
            timestamp_unix: trigger.updated_unix,
            directions: None,
        });
    }

    Ok(events)
}

fn persist_batch_sync(store: &ObjectStore, trigger: Object, events: Vec<Event>) -> Result<EventBatch> {
    let batch = EventBatch { trigger, events };

    let bytes = codec::encode(&batch)?;
    let mut txn = store.substrate().begin_write();
    txn.set(
        event_batch_key(&batch.trigger.key),
        bytes,
        Tag::EventBatch.as_u8(),
        batch.trigger.expires_unix,
    );
    txn.commit()?;

    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Substrate;
    use geodb_types::Point;
    use std::collections::HashMap;

    fn obj(key: &str, lat: f64, lon: f64, radius_m: i64) -> Object {
        Object {
            key: key.to_string(),
            point: Point::new(lat, lon),
            radius_m,
            metadata: HashMap::new(),
            updated_unix: 1000,
            expires_unix: 0,
            tracking: None,
            get_address: false,
            get_timezone: false,
        }
    }

    #[tokio::test]
    async fn inside_peer_is_emitted_with_distance() {
        let (substrate, _dir) = Substrate::open_temp();
        let store = Arc::new(ObjectStore::new(Arc::new(substrate)));

        let mut objects = HashMap::new();
        objects.insert("trigger".to_string(), obj("trigger", 39.7559, -104.9942, 2000));
        objects.insert("peer".to_string(), obj("peer", 39.7487, -105.0077, 0));
        store.set(objects).unwrap();

        let event_bus = Arc::new(EventBus::new(16));
        let evaluator = GeofenceEvaluator::new(Arc::clone(&store), event_bus, 4);

        let trigger = store.get(&["trigger".to_string()]).unwrap()["trigger"].object.clone();
        let batch = evaluator.evaluate(trigger).await.unwrap();

        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].object.key, "peer");
        assert!(batch.events[0].inside);
        assert!(batch.events[0].distance_m > 1000.0 && batch.events[0].distance_m < 2000.0);
    }

    #[tokio::test]
    async fn outside_peer_is_not_emitted() {
        let (substrate, _dir) = Substrate::open_temp();
        let store = Arc::new(ObjectStore::new(Arc::new(substrate)));

        let mut objects = HashMap::new();
        objects.insert("trigger".to_string(), obj("trigger", 39.7559, -104.9942, 10));
        objects.insert("peer".to_string(), obj("peer", 39.7487, -105.0077, 0));
        store.set(objects).unwrap();

        let event_bus = Arc::new(EventBus::new(16));
        let evaluator = GeofenceEvaluator::new(Arc::clone(&store), event_bus, 4);

        let trigger = store.get(&["trigger".to_string()]).unwrap()["trigger"].object.clone();
        let batch = evaluator.evaluate(trigger).await.unwrap();
        assert!(batch.events.is_empty());
    }

    struct FakeProvider;

    impl crate::cache::MapsProvider for FakeProvider {
        fn directions<'a>(
            &'a self,
            _origin: Point,
            _dest: Point,
            _mode: geodb_types::TravelMode,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Directions>> + Send + 'a>> {
            Box::pin(async {
                Ok(Directions {
                    html_directions: "turn left".into(),
                    eta_minutes: 7,
                    distance_m: 500,
                })
            })
        }

        fn reverse_geocode<'a>(
            &'a self,
            _point: Point,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<geodb_types::Address>> + Send + 'a>> {
            Box::pin(async { Ok(geodb_types::Address::default()) })
        }

        fn timezone<'a>(
            &'a self,
            _point: Point,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>> {
            Box::pin(async { Ok(String::new()) })
        }

        fn geocode<'a>(
            &'a self,
            _address: &'a str,
        ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Point>> + Send + 'a>> {
            Box::pin(async { Ok(Point::new(0.0, 0.0)) })
        }
    }

    #[tokio::test]
    async fn tracked_peer_gets_only_its_flagged_direction_fields() {
        let (substrate, _dir) = Substrate::open_temp();
        let substrate = Arc::new(substrate);
        let store = Arc::new(ObjectStore::new(Arc::clone(&substrate)));

        let mut trigger = obj("trigger", 39.7559, -104.9942, 2000);
        trigger.tracking = Some(geodb_types::Tracking {
            travel_mode: geodb_types::TravelMode::Driving,
            trackers: vec![geodb_types::Tracker {
                target_key: "peer".to_string(),
                track_directions: false,
                track_eta: true,
                track_distance: false,
            }],
        });
        let mut objects = HashMap::new();
        objects.insert("trigger".to_string(), trigger);
        objects.insert("peer".to_string(), obj("peer", 39.7487, -105.0077, 0));
        store.set(objects).unwrap();

        let event_bus = Arc::new(EventBus::new(16));
        let cache = Arc::new(GeocodingCache::new(substrate, Arc::new(FakeProvider), 3600));
        let evaluator = GeofenceEvaluator::new(Arc::clone(&store), event_bus, 4).with_cache(cache);

        let trigger = store.get(&["trigger".to_string()]).unwrap()["trigger"].object.clone();
        let batch = evaluator.evaluate(trigger).await.unwrap();

        let directions = batch.events[0].directions.as_ref().expect("directions attached");
        assert_eq!(directions.eta_minutes, 7);
        assert_eq!(directions.html_directions, "");
        assert_eq!(directions.distance_m, 0);
    }

    #[tokio::test]
    async fn untracked_peer_has_no_directions() {
        let (substrate, _dir) = Substrate::open_temp();
        let substrate = Arc::new(substrate);
        let store = Arc::new(ObjectStore::new(Arc::clone(&substrate)));

        let mut objects = HashMap::new();
        objects.insert("trigger".to_string(), obj("trigger", 39.7559, -104.9942, 2000));
        objects.insert("peer".to_string(), obj("peer", 39.7487, -105.0077, 0));
        store.set(objects).unwrap();

        let event_bus = Arc::new(EventBus::new(16));
        let cache = Arc::new(GeocodingCache::new(substrate, Arc::new(FakeProvider), 3600));
        let evaluator = GeofenceEvaluator::new(Arc::clone(&store), event_bus, 4).with_cache(cache);

        let trigger = store.get(&["trigger".to_string()]).unwrap()["trigger"].object.clone();
        let batch = evaluator.evaluate(trigger).await.unwrap();

        assert!(batch.events[0].directions.is_none());
    }

    #[tokio::test]
    async fn trigger_lock_is_dropped_once_idle() {
        let (substrate, _dir) = Substrate::open_temp();
        let store = Arc::new(ObjectStore::new(Arc::new(substrate)));

        let mut objects = HashMap::new();
        objects.insert("trigger".to_string(), obj("trigger", 39.7559, -104.9942, 10));
        store.set(objects).unwrap();

        let event_bus = Arc::new(EventBus::new(16));
        let evaluator = GeofenceEvaluator::new(Arc::clone(&store), event_bus, 4);

        let trigger = store.get(&["trigger".to_string()]).unwrap()["trigger"].object.clone();
        evaluator.evaluate(trigger).await.unwrap();

        assert!(evaluator.trigger_locks.lock().await.is_empty());
    }
}
