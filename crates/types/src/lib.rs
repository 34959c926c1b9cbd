//! Shared data model for geodb: geographic points, stored objects, geofence
//! events and the side-table payloads the geocoding cache attaches to them.
//!
//! Every type here is plain data, serde-derived the way `spatio::types::Config`
//! is: fields default away on read so the encoding stays forward-compatible
//! as fields are added (see `geodb-core::codec`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A geographic point. `lat` in `[-90, 90]`, `lon` in `[-180, 180]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lat: f64,
    pub lon: f64,
}

impl Point {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// True iff both coordinates fall within their legal ranges.
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lon)
    }
}

/// Travel mode for a tracked route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TravelMode {
    #[default]
    Driving = 0,
    Bicycling = 1,
    Transit = 2,
    Walking = 3,
}

/// One peer an object wants routing information toward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tracker {
    pub target_key: String,
    #[serde(default)]
    pub track_directions: bool,
    #[serde(default)]
    pub track_eta: bool,
    #[serde(default)]
    pub track_distance: bool,
}

/// Tracking configuration for an [`Object`]: which peers to route toward and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Tracking {
    #[serde(default)]
    pub travel_mode: TravelMode,
    #[serde(default)]
    pub trackers: Vec<Tracker>,
}

/// A named geospatial entity with a point, radius and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub key: String,
    pub point: Point,
    #[serde(default)]
    pub radius_m: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub updated_unix: i64,
    #[serde(default)]
    pub expires_unix: i64,
    #[serde(default)]
    pub tracking: Option<Tracking>,
    #[serde(default)]
    pub get_address: bool,
    #[serde(default)]
    pub get_timezone: bool,
}

impl Object {
    /// `true` when `expires_unix` is unset (no expiration).
    pub fn is_permanent(&self) -> bool {
        self.expires_unix == 0
    }
}

/// A reverse-geocoded street address, bucketed the way Google's
/// `address_components` response is walked in the original source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Address {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub county: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub zip: String,
    #[serde(default)]
    pub country: String,
}

/// Routing detail accumulated across a route's legs. Only the fields a
/// tracker's flags requested are populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Directions {
    #[serde(default)]
    pub html_directions: String,
    #[serde(default)]
    pub eta_minutes: i64,
    #[serde(default)]
    pub distance_m: i64,
}

/// One trigger-to-peer relation produced by a geofence evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub object: Object,
    pub distance_m: f64,
    pub inside: bool,
    pub timestamp_unix: i64,
    #[serde(default)]
    pub directions: Option<Directions>,
}

/// All [`Event`]s produced by one evaluation of one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub trigger: Object,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// The persisted value wrapping an [`Object`] plus derived side-tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectDetail {
    pub object: Object,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// A circular spatial query region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub center: Point,
    pub radius_m: f64,
}

/// The 1-byte type discriminator stored alongside every substrate value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Tag {
    ObjectDetail = 1,
    EventBatch = 2,
    CacheDirections = 3,
    CacheAddress = 4,
    CacheTimezone = 5,
    CacheCoordinates = 6,
}

impl Tag {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Tag::ObjectDetail),
            2 => Some(Tag::EventBatch),
            3 => Some(Tag::CacheDirections),
            4 => Some(Tag::CacheAddress),
            5 => Some(Tag::CacheTimezone),
            6 => Some(Tag::CacheCoordinates),
            _ => None,
        }
    }
}

/// Reserved key prefix for event-batch records; not a legal user object key.
pub const EVENTS_KEY_PREFIX: &str = "events__";

pub fn event_batch_key(trigger_key: &str) -> String {
    format!("{EVENTS_KEY_PREFIX}{trigger_key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_validity() {
        assert!(Point::new(39.75, -104.99).is_valid());
        assert!(!Point::new(91.0, 0.0).is_valid());
        assert!(!Point::new(0.0, 181.0).is_valid());
    }

    #[test]
    fn object_permanence() {
        let mut o = Object {
            key: "a".into(),
            point: Point::new(0.0, 0.0),
            radius_m: 0,
            metadata: HashMap::new(),
            updated_unix: 1,
            expires_unix: 0,
            tracking: None,
            get_address: false,
            get_timezone: false,
        };
        assert!(o.is_permanent());
        o.expires_unix = 123;
        assert!(!o.is_permanent());
    }

    #[test]
    fn tag_roundtrip() {
        for t in [
            Tag::ObjectDetail,
            Tag::EventBatch,
            Tag::CacheDirections,
            Tag::CacheAddress,
            Tag::CacheTimezone,
            Tag::CacheCoordinates,
        ] {
            assert_eq!(Tag::from_u8(t.as_u8()), Some(t));
        }
        assert_eq!(Tag::from_u8(0), None);
    }

    #[test]
    fn event_batch_key_uses_reserved_prefix() {
        assert_eq!(event_batch_key("booth_1"), "events__booth_1");
    }

    #[test]
    fn object_serde_roundtrip() {
        let o = Object {
            key: "a".into(),
            point: Point::new(1.0, 2.0),
            radius_m: 5,
            metadata: HashMap::new(),
            updated_unix: 10,
            expires_unix: 0,
            tracking: Some(Tracking {
                travel_mode: TravelMode::Walking,
                trackers: vec![Tracker {
                    target_key: "b".into(),
                    track_directions: true,
                    track_eta: false,
                    track_distance: false,
                }],
            }),
            get_address: false,
            get_timezone: false,
        };
        let json = serde_json::to_string(&o).unwrap();
        let back: Object = serde_json::from_str(&json).unwrap();
        assert_eq!(o, back);
    }
}
