//! The geocoding cache, grounded on
//! `original_source/maps/maps.go`'s Google Maps client wrapper, fixing two
//! bugs found in that original:
//!
//! * negative-cache ambiguity — the original distinguishes "never looked up"
//!   from "looked up, provider returned nothing" by storing an empty string,
//!   then treats an empty string as a cache *miss* and re-queries the
//!   provider every time. Here a lookup stores an explicit tagged entry
//!   either way, so a hit is a hit regardless of whether the provider had an
//!   answer.
//! * directions TTL on unset — fixed already in [`crate::config::Config::gmaps_cache_duration`].
//!
//! Cache keys are geohash-bucketed the way the original keys its in-memory
//! map, reusing [`crate::geo::geohash`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use geodb_types::{Address, Directions, Point, Tag, TravelMode};

use crate::codec;
use crate::error::Result;
use crate::geo;
use crate::kv::Substrate;
use crate::store::now_unix;

/// A pluggable geocoding/directions backend. Implemented once against
/// Google Maps in production, and trivially by [`NullProvider`] when no API
/// key is configured.
pub trait MapsProvider: Send + Sync {
    fn directions<'a>(
        &'a self,
        origin: Point,
        dest: Point,
        mode: TravelMode,
    ) -> Pin<Box<dyn Future<Output = Result<Directions>> + Send + 'a>>;

    fn reverse_geocode<'a>(
        &'a self,
        point: Point,
    ) -> Pin<Box<dyn Future<Output = Result<Address>> + Send + 'a>>;

    fn timezone<'a>(
        &'a self,
        point: Point,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

    fn geocode<'a>(
        &'a self,
        address: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Point>> + Send + 'a>>;
}

/// Stands in for a provider when `GEODB_GMAPS_KEY` is unset; every call
/// fails with [`crate::error::Error::Provider`] rather than panicking, so a
/// server run without a Maps key degrades to "tracking/address features
/// unavailable" instead of crashing.
pub struct NullProvider;

impl MapsProvider for NullProvider {
    fn directions<'a>(
        &'a self,
        _origin: Point,
        _dest: Point,
        _mode: TravelMode,
    ) -> Pin<Box<dyn Future<Output = Result<Directions>> + Send + 'a>> {
        Box::pin(async { Err(crate::error::Error::Provider("no maps provider configured".into())) })
    }

    fn reverse_geocode<'a>(
        &'a self,
        _point: Point,
    ) -> Pin<Box<dyn Future<Output = Result<Address>> + Send + 'a>> {
        Box::pin(async { Err(crate::error::Error::Provider("no maps provider configured".into())) })
    }

    fn timezone<'a>(
        &'a self,
        _point: Point,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(async { Err(crate::error::Error::Provider("no maps provider configured".into())) })
    }

    fn geocode<'a>(
        &'a self,
        _address: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Point>> + Send + 'a>> {
        Box::pin(async { Err(crate::error::Error::Provider("no maps provider configured".into())) })
    }
}

fn travel_mode_tag(mode: TravelMode) -> &'static str {
    match mode {
        TravelMode::Driving => "driving",
        TravelMode::Bicycling => "bicycling",
        TravelMode::Transit => "transit",
        TravelMode::Walking => "walking",
    }
}

fn directions_key(origin: Point, dest: Point, mode: TravelMode) -> String {
    format!(
        "gmaps_directions_{}_{}_{}",
        travel_mode_tag(mode),
        geo::geohash(origin, 9),
        geo::geohash(dest, 9)
    )
}

fn address_key(point: Point) -> String {
    format!("gmaps_address_{}", geo::geohash(point, 9))
}

fn timezone_key(point: Point) -> String {
    format!("gmaps_timezone_{}", geo::geohash(point, 4))
}

fn coordinates_key(address: &str) -> String {
    use base64::Engine;
    format!(
        "gmaps_coordinates_{}",
        base64::engine::general_purpose::STANDARD.encode(address.trim().to_lowercase())
    )
}

/// Wraps a [`MapsProvider`], caching every lookup in the substrate under its
/// own [`Tag`] so cached directions/address/timezone/coordinates survive a
/// restart and share the substrate's AOF and compaction.
pub struct GeocodingCache {
    substrate: Arc<Substrate>,
    provider: Arc<dyn MapsProvider>,
    directions_ttl_secs: i64,
}

impl GeocodingCache {
    pub fn new(substrate: Arc<Substrate>, provider: Arc<dyn MapsProvider>, directions_ttl_secs: u64) -> Self {
        Self {
            substrate,
            provider,
            directions_ttl_secs: directions_ttl_secs as i64,
        }
    }

    fn lookup<T: serde::de::DeserializeOwned>(&self, key: &str, tag: Tag) -> Result<Option<T>> {
        let read = self.substrate.begin_read();
        let now = now_unix();
        match read.get(key.as_bytes()) {
            Some(entry) if entry.tag == tag.as_u8() && !entry.is_expired_at(now) => {
                Ok(Some(codec::decode(&entry.value)?))
            }
            _ => Ok(None),
        }
    }

    fn store<T: serde::Serialize>(&self, key: &str, tag: Tag, value: &T, expires_unix: i64) -> Result<()> {
        let bytes = codec::encode(value)?;
        let mut txn = self.substrate.begin_write();
        txn.set(key, bytes, tag.as_u8(), expires_unix);
        txn.commit()
    }

    /// Directions from `origin` to `dest`. A cache hit returns the stored
    /// value even if the provider would currently answer differently
    /// (positive or negative caching are both just cache hits).
    pub async fn directions(&self, origin: Point, dest: Point, mode: TravelMode) -> Result<Directions> {
        let key = directions_key(origin, dest, mode);
        if let Some(cached) = self.lookup::<Directions>(&key, Tag::CacheDirections)? {
            return Ok(cached);
        }
        let directions = self.provider.directions(origin, dest, mode).await?;
        let expires = now_unix() + self.directions_ttl_secs;
        self.store(&key, Tag::CacheDirections, &directions, expires)?;
        Ok(directions)
    }

    /// Reverse-geocoded address for `point`. Cached permanently: an
    /// address does not go stale the way a route's traffic-dependent ETA
    /// does.
    pub async fn address(&self, point: Point) -> Result<Address> {
        let key = address_key(point);
        if let Some(cached) = self.lookup::<Address>(&key, Tag::CacheAddress)? {
            return Ok(cached);
        }
        let address = self.provider.reverse_geocode(point).await?;
        self.store(&key, Tag::CacheAddress, &address, 0)?;
        Ok(address)
    }

    /// IANA timezone name for `point`. Cached permanently (a location's
    /// timezone does not change).
    pub async fn timezone(&self, point: Point) -> Result<String> {
        let key = timezone_key(point);
        if let Some(cached) = self.lookup::<String>(&key, Tag::CacheTimezone)? {
            return Ok(cached);
        }
        let tz = self.provider.timezone(point).await?;
        self.store(&key, Tag::CacheTimezone, &tz, 0)?;
        Ok(tz)
    }

    /// Forward-geocoded coordinates for a free-text `address`. Cached
    /// permanently, keyed on the normalized (trimmed, lowercased) text.
    pub async fn coordinates(&self, address: &str) -> Result<Point> {
        let key = coordinates_key(address);
        if let Some(cached) = self.lookup::<Point>(&key, Tag::CacheCoordinates)? {
            return Ok(cached);
        }
        let point = self.provider.geocode(address).await?;
        self.store(&key, Tag::CacheCoordinates, &point, 0)?;
        Ok(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
    }

    impl MapsProvider for CountingProvider {
        fn directions<'a>(
            &'a self,
            _origin: Point,
            _dest: Point,
            _mode: TravelMode,
        ) -> Pin<Box<dyn Future<Output = Result<Directions>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Ok(Directions {
                    html_directions: "go straight".into(),
                    eta_minutes: 5,
                    distance_m: 1000,
                })
            })
        }

        fn reverse_geocode<'a>(
            &'a self,
            _point: Point,
        ) -> Pin<Box<dyn Future<Output = Result<Address>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Simulates a provider with no answer for this point; the cache
            // still records that the lookup happened.
            Box::pin(async { Ok(Address::default()) })
        }

        fn timezone<'a>(
            &'a self,
            _point: Point,
        ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok("America/Denver".to_string()) })
        }

        fn geocode<'a>(
            &'a self,
            _address: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Point>> + Send + 'a>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(Point::new(39.7559, -104.9942)) })
        }
    }

    fn cache() -> (GeocodingCache, Arc<CountingProvider>, tempfile::TempDir) {
        let (substrate, dir) = Substrate::open_temp();
        let provider = Arc::new(CountingProvider { calls: AtomicUsize::new(0) });
        let cache = GeocodingCache::new(Arc::new(substrate), provider.clone(), 3600);
        (cache, provider, dir)
    }

    #[tokio::test]
    async fn directions_are_cached_after_first_lookup() {
        let (cache, provider, _dir) = cache();
        let coors = Point::new(39.7559, -104.9942);
        let pepsi = Point::new(39.7487, -105.0077);

        let first = cache.directions(coors, pepsi, TravelMode::Driving).await.unwrap();
        let second = cache.directions(coors, pepsi, TravelMode::Driving).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_provider_answer_is_still_a_cache_hit() {
        let (cache, provider, _dir) = cache();
        let p = Point::new(39.7559, -104.9942);

        let first = cache.address(p).await.unwrap();
        assert_eq!(first, Address::default());
        let second = cache.address(p).await.unwrap();
        assert_eq!(second, Address::default());

        // Without the negative-cache fix this would re-query every time.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_travel_modes_cache_independently() {
        let (cache, provider, _dir) = cache();
        let coors = Point::new(39.7559, -104.9942);
        let pepsi = Point::new(39.7487, -105.0077);

        cache.directions(coors, pepsi, TravelMode::Driving).await.unwrap();
        cache.directions(coors, pepsi, TravelMode::Walking).await.unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn coordinates_key_normalizes_whitespace_and_case() {
        let (cache, provider, _dir) = cache();
        cache.coordinates("  1000 Chopper Circle, Denver  ").await.unwrap();
        cache.coordinates("1000 CHOPPER CIRCLE, DENVER").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn null_provider_reports_a_provider_error() {
        let (substrate, _dir) = Substrate::open_temp();
        let cache = GeocodingCache::new(Arc::new(substrate), Arc::new(NullProvider), 3600);
        let err = cache.timezone(Point::new(0.0, 0.0)).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Provider(_)));
    }
}
