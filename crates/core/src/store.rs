//! The object store, grounded on
//! `original_source/db/object.go` (Set/Get, tag assignment, `updated_unix`),
//! `original_source/db/keys.go` (prefix/regex key iteration) and
//! `original_source/db/scan.go` (bound-filtered spatial scan).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;

use geodb_types::{Bound, Object, ObjectDetail, Tag};

use crate::codec;
use crate::error::{Error, Result};
use crate::kv::Substrate;

static KEY_PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();

fn key_pattern() -> &'static Regex {
    KEY_PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_\-\.]+$").unwrap())
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || !key_pattern().is_match(key) {
        return Err(Error::validation(format!("invalid key: {key}")));
    }
    if key.starts_with(geodb_types::EVENTS_KEY_PREFIX) {
        return Err(Error::validation(format!(
            "key uses reserved prefix `{}`: {key}",
            geodb_types::EVENTS_KEY_PREFIX
        )));
    }
    Ok(())
}

fn validate_object(object: &Object) -> Result<()> {
    validate_key(&object.key)?;
    if !object.point.is_valid() {
        return Err(Error::validation(format!(
            "invalid point for key {}: {:?}",
            object.key, object.point
        )));
    }
    if object.radius_m < 0 {
        return Err(Error::validation(format!(
            "radius_m must be non-negative for key {}",
            object.key
        )));
    }
    Ok(())
}

/// Persistent store of [`ObjectDetail`] records over the substrate, tag=1.
pub struct ObjectStore {
    substrate: Arc<Substrate>,
}

impl ObjectStore {
    pub fn new(substrate: Arc<Substrate>) -> Self {
        Self { substrate }
    }

    pub fn substrate(&self) -> &Arc<Substrate> {
        &self.substrate
    }

    /// Sets each object in `objects`, returning the resulting
    /// [`ObjectDetail`] for every key. Per-entry side-table population
    /// (address/timezone) is left to the caller (the service facade), which
    /// has access to the geocoding cache; this method only persists what it
    /// is given.
    pub fn set(&self, mut objects: HashMap<String, Object>) -> Result<HashMap<String, ObjectDetail>> {
        for (map_key, object) in objects.iter_mut() {
            object.key = map_key.clone();
            if object.updated_unix == 0 {
                object.updated_unix = now_unix();
            }
            validate_object(object)?;
        }

        let mut txn = self.substrate.begin_write();
        let mut details = HashMap::with_capacity(objects.len());
        for (key, object) in objects {
            let detail = ObjectDetail {
                object: object.clone(),
                address: None,
                timezone: None,
                events: Vec::new(),
            };
            let bytes = codec::encode(&detail)?;
            txn.set(key.clone(), bytes, Tag::ObjectDetail.as_u8(), object.expires_unix);
            details.insert(key, detail);
        }
        txn.commit()?;
        Ok(details)
    }

    /// Overwrites a single key's stored `ObjectDetail` wholesale (used by the
    /// facade once it has attached address/timezone/events).
    pub fn put_detail(&self, detail: &ObjectDetail) -> Result<()> {
        let bytes = codec::encode(detail)?;
        let mut txn = self.substrate.begin_write();
        txn.set(
            detail.object.key.clone(),
            bytes,
            Tag::ObjectDetail.as_u8(),
            detail.object.expires_unix,
        );
        txn.commit()
    }

    /// `keys.is_empty()` or `keys == ["*"]` means "all objects". An object
    /// whose `expires_unix` has passed but hasn't yet been physically
    /// reclaimed by the background GC reads as not-found here, so the TTL
    /// invariant holds at read time, not just after compaction catches up.
    pub fn get(&self, keys: &[String]) -> Result<HashMap<String, ObjectDetail>> {
        let read = self.substrate.begin_read();
        let now = now_unix();
        if keys.is_empty() || keys == ["*"] {
            let mut out = HashMap::new();
            for (k, entry) in read.iter_all(Some(Tag::ObjectDetail.as_u8())) {
                if entry.is_expired_at(now) {
                    continue;
                }
                let detail: ObjectDetail = codec::decode(&entry.value)?;
                out.insert(String::from_utf8_lossy(k).into_owned(), detail);
            }
            return Ok(out);
        }

        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            let entry = read
                .get(key.as_bytes())
                .filter(|e| e.tag == Tag::ObjectDetail.as_u8() && !e.is_expired_at(now))
                .ok_or_else(|| Error::validation(format!("missing key: {key}")))?;
            let detail: ObjectDetail = codec::decode(&entry.value)?;
            out.insert(key.clone(), detail);
        }
        Ok(out)
    }

    pub fn get_prefix(&self, prefix: &str) -> Result<HashMap<String, ObjectDetail>> {
        let read = self.substrate.begin_read();
        let now = now_unix();
        let mut out = HashMap::new();
        for (k, entry) in read.iter_prefix(prefix.as_bytes(), Some(Tag::ObjectDetail.as_u8())) {
            if entry.is_expired_at(now) {
                continue;
            }
            let detail: ObjectDetail = codec::decode(&entry.value)?;
            out.insert(String::from_utf8_lossy(k).into_owned(), detail);
        }
        Ok(out)
    }

    pub fn get_regex(&self, pattern: &str) -> Result<HashMap<String, ObjectDetail>> {
        let re = Regex::new(pattern).map_err(|e| Error::validation(format!("bad regex: {e}")))?;
        let read = self.substrate.begin_read();
        let now = now_unix();
        let mut out = HashMap::new();
        for (k, entry) in read.iter_all(Some(Tag::ObjectDetail.as_u8())) {
            if entry.is_expired_at(now) {
                continue;
            }
            let key_str = String::from_utf8_lossy(k);
            if re.is_match(&key_str) {
                let detail: ObjectDetail = codec::decode(&entry.value)?;
                out.insert(key_str.into_owned(), detail);
            }
        }
        Ok(out)
    }

    /// `["*"]` deletes every tag=1 entry, and only tag=1 entries — an
    /// `EventBatch` is stored independently and survives a deleted trigger
    /// until its own TTL reclaims it. Deleting an absent key is not an
    /// error, matching the original source's semantics.
    pub fn delete(&self, keys: &[String]) -> Result<()> {
        let delete_all = keys == ["*"];

        let to_delete: Vec<String> = if delete_all {
            let read = self.substrate.begin_read();
            read.iter_all(Some(Tag::ObjectDetail.as_u8()))
                .map(|(k, _)| String::from_utf8_lossy(k).into_owned())
                .collect()
        } else {
            keys.to_vec()
        };

        let mut txn = self.substrate.begin_write();
        for key in &to_delete {
            txn.delete(key.clone());
        }
        txn.commit()
    }

    pub fn scan_bound(&self, bound: Bound, keys: Option<&[String]>) -> Result<HashMap<String, ObjectDetail>> {
        self.scan_with(bound, |key_str| {
            keys.is_none_or(|ks| ks.is_empty() || ks.iter().any(|k| k == key_str))
        })
    }

    pub fn scan_prefix_bound(&self, bound: Bound, prefix: &str) -> Result<HashMap<String, ObjectDetail>> {
        let prefix = prefix.to_string();
        self.scan_with(bound, move |key_str| key_str.starts_with(&prefix))
    }

    pub fn scan_regex_bound(&self, bound: Bound, pattern: &str) -> Result<HashMap<String, ObjectDetail>> {
        let re = Regex::new(pattern).map_err(|e| Error::validation(format!("bad regex: {e}")))?;
        self.scan_with(bound, move |key_str| re.is_match(key_str))
    }

    fn scan_with(&self, bound: Bound, predicate: impl Fn(&str) -> bool) -> Result<HashMap<String, ObjectDetail>> {
        let read = self.substrate.begin_read();
        let now = now_unix();
        let mut out = HashMap::new();
        for (k, entry) in read.iter_all(Some(Tag::ObjectDetail.as_u8())) {
            if entry.is_expired_at(now) {
                continue;
            }
            let key_str = String::from_utf8_lossy(k);
            if !predicate(&key_str) {
                continue;
            }
            let detail: ObjectDetail = codec::decode(&entry.value)?;
            if crate::geo::contains_bound(bound.center, bound.radius_m, detail.object.point) {
                out.insert(key_str.into_owned(), detail);
            }
        }
        Ok(out)
    }

    pub fn get_keys(&self) -> Result<Vec<String>> {
        let read = self.substrate.begin_read();
        let now = now_unix();
        Ok(read
            .iter_all(Some(Tag::ObjectDetail.as_u8()))
            .filter(|(_, e)| !e.is_expired_at(now))
            .map(|(k, _)| String::from_utf8_lossy(k).into_owned())
            .collect())
    }

    pub fn get_prefix_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let read = self.substrate.begin_read();
        let now = now_unix();
        Ok(read
            .iter_prefix(prefix.as_bytes(), Some(Tag::ObjectDetail.as_u8()))
            .filter(|(_, e)| !e.is_expired_at(now))
            .map(|(k, _)| String::from_utf8_lossy(k).into_owned())
            .collect())
    }

    pub fn get_regex_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let re = Regex::new(pattern).map_err(|e| Error::validation(format!("bad regex: {e}")))?;
        let read = self.substrate.begin_read();
        let now = now_unix();
        Ok(read
            .iter_all(Some(Tag::ObjectDetail.as_u8()))
            .filter(|(_, e)| !e.is_expired_at(now))
            .map(|(k, _)| String::from_utf8_lossy(k).into_owned())
            .filter(|k| re.is_match(k))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geodb_types::Point;

    fn obj(key: &str, lat: f64, lon: f64) -> Object {
        Object {
            key: key.to_string(),
            point: Point::new(lat, lon),
            radius_m: 100,
            metadata: HashMap::new(),
            updated_unix: 0,
            expires_unix: 0,
            tracking: None,
            get_address: false,
            get_timezone: false,
        }
    }

    fn store() -> (ObjectStore, tempfile::TempDir) {
        let (substrate, dir) = Substrate::open_temp();
        (ObjectStore::new(Arc::new(substrate)), dir)
    }

    #[test]
    fn set_then_get_single() {
        let (store, _dir) = store();
        let mut objects = HashMap::new();
        objects.insert("a".to_string(), obj("a", 39.7563, -104.9941));
        let result = store.set(objects).unwrap();
        assert!(result["a"].object.updated_unix > 0);

        let fetched = store.get(&["a".to_string()]).unwrap();
        assert_eq!(fetched["a"].object.point.lat, 39.7563);
    }

    #[test]
    fn get_missing_key_is_validation_error() {
        let (store, _dir) = store();
        let err = store.get(&["nope".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn reserved_prefix_is_rejected() {
        let (store, _dir) = store();
        let mut objects = HashMap::new();
        objects.insert("events__x".to_string(), obj("events__x", 0.0, 0.0));
        assert!(store.set(objects).is_err());
    }

    #[test]
    fn prefix_query_counts_match() {
        let (store, _dir) = store();
        let mut objects = HashMap::new();
        objects.insert("testing_1".to_string(), obj("testing_1", 1.0, 1.0));
        objects.insert("testing_2".to_string(), obj("testing_2", 1.0, 1.0));
        objects.insert("malls_1".to_string(), obj("malls_1", 1.0, 1.0));
        store.set(objects).unwrap();

        assert_eq!(store.get_prefix("testing_").unwrap().len(), 2);
        assert_eq!(store.get_prefix("malls_").unwrap().len(), 1);
    }

    #[test]
    fn spatial_scan_respects_radius() {
        let (store, _dir) = store();
        let coors = Point::new(39.7559, -104.9942);
        let pepsi = Point::new(39.7487, -105.0077);
        let mut objects = HashMap::new();
        objects.insert("coors".to_string(), obj("coors", coors.lat, coors.lon));
        objects.insert("pepsi".to_string(), obj("pepsi", pepsi.lat, pepsi.lon));
        store.set(objects).unwrap();

        let wide = store
            .scan_bound(Bound { center: coors, radius_m: 3000.0 }, None)
            .unwrap();
        assert_eq!(wide.len(), 2);

        let narrow = store
            .scan_bound(Bound { center: coors, radius_m: 500.0 }, None)
            .unwrap();
        assert_eq!(narrow.len(), 1);
        assert!(narrow.contains_key("coors"));
    }

    #[test]
    fn delete_all_clears_objects_but_not_cache_entries() {
        let (store, _dir) = store();
        let mut objects = HashMap::new();
        objects.insert("a".to_string(), obj("a", 0.0, 0.0));
        objects.insert("b".to_string(), obj("b", 0.0, 0.0));
        store.set(objects).unwrap();

        // A cache entry (different tag) should survive delete-all.
        let mut txn = store.substrate().begin_write();
        txn.set("gmaps_address_x", "cached", Tag::CacheAddress.as_u8(), 0);
        txn.commit().unwrap();

        store.delete(&["*".to_string()]).unwrap();
        assert!(store.get(&[]).unwrap().is_empty());

        let read = store.substrate().begin_read();
        assert!(read.get(b"gmaps_address_x").is_some());
    }

    #[test]
    fn delete_of_single_key_does_not_touch_its_event_batch() {
        let (store, _dir) = store();
        let mut objects = HashMap::new();
        objects.insert("a".to_string(), obj("a", 0.0, 0.0));
        store.set(objects).unwrap();

        let batch_key = geodb_types::event_batch_key("a");
        let mut txn = store.substrate().begin_write();
        txn.set(batch_key.clone(), "batch", Tag::EventBatch.as_u8(), 0);
        txn.commit().unwrap();

        store.delete(&["a".to_string()]).unwrap();
        assert!(store.get(&[]).unwrap().is_empty());

        let read = store.substrate().begin_read();
        assert!(read.get(batch_key.as_bytes()).is_some());
    }

    #[test]
    fn delete_all_does_not_touch_event_batches() {
        let (store, _dir) = store();
        let mut objects = HashMap::new();
        objects.insert("a".to_string(), obj("a", 0.0, 0.0));
        store.set(objects).unwrap();

        let batch_key = geodb_types::event_batch_key("a");
        let mut txn = store.substrate().begin_write();
        txn.set(batch_key.clone(), "batch", Tag::EventBatch.as_u8(), 0);
        txn.commit().unwrap();

        store.delete(&["*".to_string()]).unwrap();
        assert!(store.get(&[]).unwrap().is_empty());

        let read = store.substrate().begin_read();
        assert!(read.get(batch_key.as_bytes()).is_some());
    }

    #[test]
    fn delete_of_absent_key_is_not_an_error() {
        let (store, _dir) = store();
        assert!(store.delete(&["missing".to_string()]).is_ok());
    }

    #[test]
    fn expired_object_reads_as_not_found_before_gc_runs() {
        let (store, _dir) = store();
        let mut objects = HashMap::new();
        let mut expired = obj("a", 0.0, 0.0);
        expired.expires_unix = now_unix() - 1;
        objects.insert("a".to_string(), expired);
        store.set(objects).unwrap();

        assert!(store.get(&["a".to_string()]).is_err());
        assert!(store.get_keys().unwrap().is_empty());
        assert!(store.get_prefix("a").unwrap().is_empty());
    }

    #[test]
    fn invalid_regex_fails_without_side_effects() {
        let (store, _dir) = store();
        let mut objects = HashMap::new();
        objects.insert("a".to_string(), obj("a", 0.0, 0.0));
        store.set(objects).unwrap();

        assert!(store.get_regex("(").is_err());
        assert_eq!(store.get_keys().unwrap().len(), 1);
    }
}
