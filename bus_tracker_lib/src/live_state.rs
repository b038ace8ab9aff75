use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    position::LngLat,
    route::{RoutePath, Stop},
};

/// What the viewer currently sees for one trip.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveTripState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_position: Option<LngLat>,
    /// Raw position projected onto the route by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapped_position: Option<LngLat>,
    #[serde(default)]
    pub distance_traveled: f64,
    #[serde(default)]
    pub total_route_length: f64,
    /// Stop names the backend has reported as reached. Never shrinks within a trip.
    #[serde(default)]
    pub stops_reached: BTreeSet<String>,
    /// Stop name -> minutes until arrival.
    #[serde(rename = "stopETAs", default, with = "eta_list")]
    pub stop_etas: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_path: Option<RoutePath>,
    #[serde(default)]
    pub stops: Vec<Stop>,
}

/// A pushed partial update. Absent fields leave the current value alone.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveTripPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_position: Option<LngLat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapped_position: Option<LngLat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_traveled: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_route_length: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stops_reached: Option<BTreeSet<String>>,
    #[serde(rename = "stopETAs", default, skip_serializing_if = "Option::is_none", with = "opt_eta_list")]
    pub stop_etas: Option<BTreeMap<String, u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_path: Option<RoutePath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stops: Option<Vec<Stop>>,
}

impl LiveTripPatch {
    pub fn is_empty(&self) -> bool {
        *self == LiveTripPatch::default()
    }

    /// Touches the vehicle position, which is what the camera follows.
    pub fn moves_vehicle(&self) -> bool {
        self.raw_position.is_some() || self.snapped_position.is_some()
    }
}

impl From<LiveTripState> for LiveTripPatch {
    fn from(state: LiveTripState) -> Self {
        Self {
            raw_position: state.raw_position,
            snapped_position: state.snapped_position,
            distance_traveled: Some(state.distance_traveled),
            total_route_length: Some(state.total_route_length),
            stops_reached: Some(state.stops_reached),
            stop_etas: Some(state.stop_etas),
            route_path: state.route_path,
            stops: Some(state.stops),
        }
    }
}

/// How a `distanceTraveled` smaller than the stored one is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegressionPolicy {
    /// Keep the larger value. Backward jumps count as measurement noise.
    #[default]
    Monotonic,
    /// Last write wins, including backward jumps.
    Trust,
}

impl std::str::FromStr for RegressionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "monotonic" => Ok(Self::Monotonic),
            "trust" => Ok(Self::Trust),
            other => Err(format!("unknown distance regression policy '{other}'")),
        }
    }
}

/// Field-level merge of `patch` onto `old`.
///
/// Positions, route length, ETAs and geometry are last-write-wins per field.
/// `stopsReached` is a set union so it can only grow, and with
/// [`RegressionPolicy::Monotonic`] `distanceTraveled` keeps the maximum. Both
/// choices make the merge idempotent and commutative for those fields, so
/// producers may arrive in any order.
pub fn merge(old: &LiveTripState, patch: &LiveTripPatch, policy: RegressionPolicy) -> LiveTripState {
    let mut new = old.clone();

    if let Some(raw) = patch.raw_position {
        new.raw_position = Some(raw);
    }
    if let Some(snapped) = patch.snapped_position {
        new.snapped_position = Some(snapped);
    }
    if let Some(distance) = patch.distance_traveled {
        new.distance_traveled = match policy {
            RegressionPolicy::Monotonic => {
                if distance < old.distance_traveled {
                    tracing::debug!(
                        "Ignoring distance regression {} -> {}",
                        old.distance_traveled,
                        distance
                    );
                }
                old.distance_traveled.max(distance)
            }
            RegressionPolicy::Trust => distance,
        };
    }
    if let Some(total) = patch.total_route_length {
        new.total_route_length = total;
    }
    if let Some(reached) = &patch.stops_reached {
        new.stops_reached.extend(reached.iter().cloned());
    }
    if let Some(etas) = &patch.stop_etas {
        new.stop_etas = etas.clone();
    }
    if let Some(path) = &patch.route_path {
        new.route_path = Some(path.clone());
    }
    if let Some(stops) = &patch.stops {
        new.stops = stops.clone();
    }

    new
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StopEta {
    stop_name: String,
    eta_minutes: u32,
}

// ETAs arrive as any JSON number, fractional or negative included
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireStopEta {
    stop_name: String,
    eta_minutes: f64,
}

impl WireStopEta {
    /// Rounded to whole minutes, floored at zero.
    fn into_entry(self) -> (String, u32) {
        (self.stop_name, self.eta_minutes.max(0.).round() as u32)
    }
}

// The backend sends ETAs as `[{stopName, etaMinutes}]`.
mod eta_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{StopEta, WireStopEta};

    pub fn serialize<S: Serializer>(etas: &BTreeMap<String, u32>, serializer: S) -> Result<S::Ok, S::Error> {
        etas.iter()
            .map(|(stop_name, eta_minutes)| StopEta {
                stop_name: stop_name.clone(),
                eta_minutes: *eta_minutes,
            })
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<String, u32>, D::Error> {
        let list = Vec::<WireStopEta>::deserialize(deserializer)?;
        Ok(list.into_iter().map(WireStopEta::into_entry).collect())
    }
}

mod opt_eta_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(etas: &Option<BTreeMap<String, u32>>, serializer: S) -> Result<S::Ok, S::Error> {
        match etas {
            Some(etas) => super::eta_list::serialize(etas, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<BTreeMap<String, u32>>, D::Error> {
        let list = Option::<Vec<super::WireStopEta>>::deserialize(deserializer)?;
        Ok(list.map(|list| list.into_iter().map(super::WireStopEta::into_entry).collect()))
    }
}
