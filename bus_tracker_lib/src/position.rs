use chrono::{DateTime, Utc};
use geo_types::{Coord, Point};
use serde::{Deserialize, Serialize};

/// Mean earth radius used by the backend for all route distances, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A coordinate in GeoJSON order. Serialized as `[longitude, latitude]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct LngLat {
    pub longitude: f64,
    pub latitude: f64,
}

impl LngLat {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self { longitude, latitude }
    }

    pub fn distance_to(&self, other: &LngLat) -> f64 {
        haversine_distance(*self, *other)
    }
}

impl From<[f64; 2]> for LngLat {
    fn from(value: [f64; 2]) -> Self {
        Self::new(value[0], value[1])
    }
}

impl From<LngLat> for [f64; 2] {
    fn from(value: LngLat) -> Self {
        [value.longitude, value.latitude]
    }
}

impl From<LngLat> for Point {
    fn from(value: LngLat) -> Self {
        Point::new(value.longitude, value.latitude)
    }
}

impl From<Coord> for LngLat {
    fn from(value: Coord) -> Self {
        Self::new(value.x, value.y)
    }
}

/// One raw reading from the location sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    pub heading: Option<f64>,
    pub accuracy: Option<f64>,
}

impl PositionSample {
    pub fn new(latitude: f64, longitude: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            timestamp,
            heading: None,
            accuracy: None,
        }
    }

    pub fn position(&self) -> LngLat {
        LngLat::new(self.longitude, self.latitude)
    }
}

/// Great-circle distance in meters.
pub fn haversine_distance(p1: LngLat, p2: LngLat) -> f64 {
    let lat1 = p1.latitude.to_radians();
    let lat2 = p2.latitude.to_radians();
    let d_lat = (p2.latitude - p1.latitude).to_radians();
    let d_lon = (p2.longitude - p1.longitude).to_radians();

    let a = f64::sin(d_lat / 2.).powi(2)
        + f64::cos(lat1) * f64::cos(lat2) * f64::sin(d_lon / 2.).powi(2);
    let c = 2. * f64::atan2(a.sqrt(), (1. - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Moves `meters` due north of `origin`. Handy for building test tracks.
pub fn offset_north(origin: LngLat, meters: f64) -> LngLat {
    let d_lat = (meters / EARTH_RADIUS_M).to_degrees();
    LngLat::new(origin.longitude, origin.latitude + d_lat)
}
