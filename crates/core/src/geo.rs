//! Geodesic primitives: great-circle distance, radius-disk containment and
//! geohashing, built on the `geo`/`geohash` crates and re-expressed as free
//! functions.

use geo::Distance;
use geodb_types::Point;

/// Great-circle distance between two points, in meters.
pub fn distance_m(a: Point, b: Point) -> f64 {
    geo::Haversine.distance(geo::Point::new(a.lon, a.lat), geo::Point::new(b.lon, b.lat))
}

/// True iff `p` lies within `radius_m` meters of `center`.
pub fn contains_bound(center: Point, radius_m: f64, p: Point) -> bool {
    distance_m(center, p) <= radius_m
}

/// Base-32 geohash of `p` truncated to `precision` characters.
pub fn geohash(p: Point, precision: usize) -> String {
    geohash::encode(geohash::Coord { x: p.lon, y: p.lat }, precision)
        .unwrap_or_else(|_| "0".repeat(precision))
}
