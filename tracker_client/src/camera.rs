use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use bus_tracker_lib::{
    live_state::LiveTripState,
    position::LngLat,
    route::{Bounds, RoutePath},
    timeline::TripView,
};

pub type LayerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStyle {
    /// Snapped vehicle position, the follow target.
    Vehicle,
    RawGps,
    Stop { reached: bool },
}

/// Drawing primitives of a map widget.
pub trait MapWidget: Send + Sync {
    fn zoom(&self) -> f64;
    fn set_view(&mut self, center: LngLat, zoom: f64, animate: bool);
    fn fit_bounds(&mut self, bounds: Bounds);
    fn add_route(&mut self, path: &RoutePath) -> LayerId;
    fn add_marker(&mut self, at: LngLat, style: MarkerStyle, label: &str) -> LayerId;
    fn move_marker(&mut self, layer: LayerId, at: LngLat);
    fn set_marker_style(&mut self, layer: LayerId, style: MarkerStyle);
    fn remove_layer(&mut self, layer: LayerId);
}

/// Drives a [`MapWidget`] from the live trip state and owns follow mode.
///
/// While following, every vehicle move recenters the camera at the current
/// zoom. A user drag turns following off until the next recenter or trip.
/// Route bounds are fitted once per trip, when the geometry first shows up.
pub struct MapCamera {
    map: Box<dyn MapWidget>,
    padding: f64,
    following: bool,
    fitted: bool,
    route: Option<LayerId>,
    vehicle: Option<LayerId>,
    raw_gps: Option<LayerId>,
    stops: Vec<StopMarker>,
}

struct StopMarker {
    name: String,
    layer: LayerId,
    reached: bool,
}

impl MapCamera {
    pub fn new(map: Box<dyn MapWidget>, padding: f64) -> Self {
        Self {
            map,
            padding,
            following: true,
            fitted: false,
            route: None,
            vehicle: None,
            raw_gps: None,
            stops: Vec::new(),
        }
    }

    pub fn is_following(&self) -> bool {
        self.following
    }

    /// New trip: wipe everything from the previous one and follow again.
    pub fn activate(&mut self) {
        self.clear();
        self.following = true;
    }

    pub fn on_user_drag(&mut self) {
        if self.following {
            tracing::debug!("Map dragged, follow mode off");
        }
        self.following = false;
    }

    /// Turns following back on and jumps to the vehicle if there is one.
    /// Returns the new camera center.
    pub fn recenter(&mut self, state: Option<&LiveTripState>) -> Option<LngLat> {
        self.following = true;
        let target = state.and_then(follow_target)?;
        let zoom = self.map.zoom();
        self.map.set_view(target, zoom, true);
        Some(target)
    }

    /// Removes every layer and forgets the route fit.
    pub fn clear(&mut self) {
        let layers = self
            .route
            .take()
            .into_iter()
            .chain(self.vehicle.take())
            .chain(self.raw_gps.take())
            .chain(self.stops.drain(..).map(|stop| stop.layer))
            .collect::<Vec<_>>();
        for layer in layers {
            self.map.remove_layer(layer);
        }
        self.fitted = false;
    }

    /// Brings the map in line with `state`. `vehicle_moved` says whether this
    /// render comes from a position change. Returns the new center when the
    /// camera followed the vehicle.
    pub fn render(&mut self, state: &LiveTripState, view: &TripView, vehicle_moved: bool) -> Option<LngLat> {
        self.render_route(state);
        self.render_stops(state, view);

        if let Some(raw) = state.raw_position {
            self.raw_gps = Some(self.place(self.raw_gps, raw, MarkerStyle::RawGps, "GPS"));
        }

        let target = follow_target(state)?;
        self.vehicle = Some(self.place(self.vehicle, target, MarkerStyle::Vehicle, "Bus"));

        if self.following && vehicle_moved {
            let zoom = self.map.zoom();
            self.map.set_view(target, zoom, true);
            return Some(target);
        }
        None
    }

    fn render_route(&mut self, state: &LiveTripState) {
        let Some(path) = state.route_path.as_ref().filter(|path| !path.is_empty()) else {
            return;
        };

        if self.route.is_none() {
            self.route = Some(self.map.add_route(path));
        }
        if !self.fitted {
            if let Some(bounds) = path.bounds() {
                self.map.fit_bounds(bounds.pad(self.padding));
                self.fitted = true;
            }
        }
    }

    fn render_stops(&mut self, state: &LiveTripState, view: &TripView) {
        let same_stops = self.stops.len() == state.stops.len()
            && self.stops.iter().zip(&state.stops).all(|(m, s)| m.name == s.name);

        if !same_stops {
            for marker in self.stops.drain(..) {
                self.map.remove_layer(marker.layer);
            }
        }

        for (i, stop) in state.stops.iter().enumerate() {
            let reached = view
                .entry(&stop.name)
                .is_some_and(|entry| entry.reached.is_reached());
            let style = MarkerStyle::Stop { reached };

            match self.stops.get_mut(i) {
                Some(marker) if marker.reached != reached => {
                    self.map.set_marker_style(marker.layer, style);
                    marker.reached = reached;
                }
                Some(_) => {}
                None => {
                    let layer = self.map.add_marker(stop.position(), style, &stop.name);
                    self.stops.push(StopMarker {
                        name: stop.name.clone(),
                        layer,
                        reached,
                    });
                }
            }
        }
    }

    fn place(&mut self, existing: Option<LayerId>, at: LngLat, style: MarkerStyle, label: &str) -> LayerId {
        match existing {
            Some(layer) => {
                self.map.move_marker(layer, at);
                layer
            }
            None => self.map.add_marker(at, style, label),
        }
    }
}

/// The snapped position, falling back to the raw one.
fn follow_target(state: &LiveTripState) -> Option<LngLat> {
    state.snapped_position.or(state.raw_position)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Layer {
    Route(RoutePath),
    Marker {
        at: LngLat,
        style: MarkerStyle,
        label: String,
    },
}

#[derive(Debug, Default)]
pub struct MapModel {
    pub center: Option<LngLat>,
    pub zoom: f64,
    pub fitted_bounds: Vec<Bounds>,
    pub layers: BTreeMap<LayerId, Layer>,
    next_layer: LayerId,
}

impl MapModel {
    pub fn markers(&self, style: MarkerStyle) -> Vec<(&str, LngLat)> {
        self.layers
            .values()
            .filter_map(|layer| match layer {
                Layer::Marker { at, style: s, label } if *s == style => Some((label.as_str(), *at)),
                _ => None,
            })
            .collect()
    }
}

/// A map widget with no screen. Keeps the layer table and camera in memory
/// and can be cloned to look at the same map from elsewhere.
#[derive(Debug, Clone)]
pub struct HeadlessMap {
    model: Arc<Mutex<MapModel>>,
}

impl Default for HeadlessMap {
    fn default() -> Self {
        Self::new(15.)
    }
}

impl HeadlessMap {
    pub fn new(zoom: f64) -> Self {
        Self {
            model: Arc::new(Mutex::new(MapModel {
                zoom,
                ..Default::default()
            })),
        }
    }

    pub fn model(&self) -> MutexGuard<'_, MapModel> {
        // A panic mid-update leaves the table usable, so take it anyway
        self.model.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&mut self, layer: Layer) -> LayerId {
        let mut model = self.model();
        model.next_layer += 1;
        let id = model.next_layer;
        model.layers.insert(id, layer);
        id
    }
}

impl MapWidget for HeadlessMap {
    fn zoom(&self) -> f64 {
        self.model().zoom
    }

    fn set_view(&mut self, center: LngLat, zoom: f64, animate: bool) {
        tracing::trace!("Camera to {:?} zoom {} (animate: {})", center, zoom, animate);
        let mut model = self.model();
        model.center = Some(center);
        model.zoom = zoom;
    }

    fn fit_bounds(&mut self, bounds: Bounds) {
        tracing::debug!("Fitting {:?} - {:?}", bounds.south_west(), bounds.north_east());
        let mut model = self.model();
        model.center = Some(bounds.center());
        model.fitted_bounds.push(bounds);
    }

    fn add_route(&mut self, path: &RoutePath) -> LayerId {
        self.insert(Layer::Route(path.clone()))
    }

    fn add_marker(&mut self, at: LngLat, style: MarkerStyle, label: &str) -> LayerId {
        self.insert(Layer::Marker {
            at,
            style,
            label: label.into(),
        })
    }

    fn move_marker(&mut self, layer: LayerId, at: LngLat) {
        if let Some(Layer::Marker { at: current, .. }) = self.model().layers.get_mut(&layer) {
            *current = at;
        }
    }

    fn set_marker_style(&mut self, layer: LayerId, style: MarkerStyle) {
        if let Some(Layer::Marker { style: current, .. }) = self.model().layers.get_mut(&layer) {
            *current = style;
        }
    }

    fn remove_layer(&mut self, layer: LayerId) {
        self.model().layers.remove(&layer);
    }
}
