use geo_types::{coord, LineString, Rect};
use serde::{Deserialize, Serialize};

use crate::position::LngLat;

/// GeoJSON point as sent by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    #[serde(rename = "type", default = "point_type")]
    pub kind: String,
    pub coordinates: LngLat,
}

fn point_type() -> String {
    "Point".into()
}

impl GeoPoint {
    pub fn new(at: LngLat) -> Self {
        Self {
            kind: point_type(),
            coordinates: at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    #[serde(rename = "_id", default)]
    pub stop_id: String,
    pub name: String,
    pub location: GeoPoint,
    /// Cumulative distance along the route path, in the same unit as
    /// `distanceTraveled`.
    pub distance_from_start: f64,
}

impl Stop {
    pub fn new(stop_id: &str, name: &str, at: LngLat, distance_from_start: f64) -> Self {
        Self {
            stop_id: stop_id.into(),
            name: name.into(),
            location: GeoPoint::new(at),
            distance_from_start,
        }
    }

    /// The key the backend uses for this stop in `stopsReached` and `stopETAs`.
    pub fn key(&self) -> &str {
        &self.name
    }

    pub fn position(&self) -> LngLat {
        self.location.coordinates
    }
}

/// GeoJSON line string of the route geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePath {
    #[serde(rename = "type", default = "line_type")]
    pub kind: String,
    pub coordinates: Vec<LngLat>,
}

fn line_type() -> String {
    "LineString".into()
}

impl RoutePath {
    pub fn new(coordinates: Vec<LngLat>) -> Self {
        Self {
            kind: line_type(),
            coordinates,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }

    pub fn line_string(&self) -> LineString {
        self.coordinates
            .iter()
            .map(|c| (c.longitude, c.latitude))
            .collect::<Vec<_>>()
            .into()
    }

    /// Bounding box of the geometry, `None` for an empty path.
    pub fn bounds(&self) -> Option<Bounds> {
        let first = self.coordinates.first()?;
        let mut min = *first;
        let mut max = *first;
        for c in &self.coordinates[1..] {
            min.longitude = min.longitude.min(c.longitude);
            min.latitude = min.latitude.min(c.latitude);
            max.longitude = max.longitude.max(c.longitude);
            max.latitude = max.latitude.max(c.latitude);
        }
        Some(Bounds::new(min, max))
    }
}

/// Axis-aligned lng/lat box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds(pub Rect);

impl Bounds {
    pub fn new(south_west: LngLat, north_east: LngLat) -> Self {
        Bounds(Rect::new(
            coord! { x: south_west.longitude, y: south_west.latitude },
            coord! { x: north_east.longitude, y: north_east.latitude },
        ))
    }

    pub fn south_west(&self) -> LngLat {
        self.0.min().into()
    }

    pub fn north_east(&self) -> LngLat {
        self.0.max().into()
    }

    pub fn center(&self) -> LngLat {
        self.0.center().into()
    }

    /// Grows the box by `ratio` of its size on every side.
    pub fn pad(&self, ratio: f64) -> Self {
        let dx = self.0.width() * ratio;
        let dy = self.0.height() * ratio;
        let sw = self.south_west();
        let ne = self.north_east();
        Self::new(
            LngLat::new(sw.longitude - dx, sw.latitude - dy),
            LngLat::new(ne.longitude + dx, ne.latitude + dy),
        )
    }
}

/// A bus line: ordered stops plus the path the vehicle follows.
/// Immutable for the lifetime of a trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    #[serde(rename = "_id")]
    pub route_id: String,
    #[serde(default)]
    pub line_number: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub stops: Vec<Stop>,
    pub route_path: RoutePath,
}

impl Route {
    pub fn stop(&self, key: &str) -> Option<&Stop> {
        self.stops.iter().find(|s| s.key() == key)
    }

    pub fn total_length(&self) -> f64 {
        self.stops
            .iter()
            .map(|s| s.distance_from_start)
            .fold(0., f64::max)
    }
}
