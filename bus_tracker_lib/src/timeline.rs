use std::fmt;

use crate::{live_state::LiveTripState, route::Stop};

/// Route progress for display, always within `[0, 100]`.
///
/// Traveled distance may overshoot the route length through measurement noise,
/// and a route with no length reports no progress.
pub fn progress_percent(distance_traveled: f64, total_route_length: f64) -> f64 {
    if !total_route_length.is_finite() || total_route_length <= 0. || distance_traveled.is_nan() {
        return 0.;
    }
    (distance_traveled / total_route_length * 100.).clamp(0., 100.)
}

/// How the timeline came to consider a stop reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reached {
    No,
    /// The backend reported it.
    Reported,
    /// The backend never reported it but the vehicle is past it.
    Inferred,
}

impl Reached {
    pub fn is_reached(self) -> bool {
        self != Reached::No
    }
}

/// Authoritative membership first, then the distance fallback for stops the
/// backend skipped (trip joined mid-route, position jumps).
pub fn stop_reached(state: &LiveTripState, stop: &Stop) -> Reached {
    if state.stops_reached.contains(stop.key()) {
        Reached::Reported
    } else if state.distance_traveled >= stop.distance_from_start {
        Reached::Inferred
    } else {
        Reached::No
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eta {
    Arriving,
    Minutes(u32),
}

impl From<u32> for Eta {
    fn from(minutes: u32) -> Self {
        if minutes == 0 {
            Eta::Arriving
        } else {
            Eta::Minutes(minutes)
        }
    }
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eta::Arriving => write!(f, "Arriving"),
            Eta::Minutes(m) => write!(f, "{m} min"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    /// Position along the route, 1-based.
    pub number: usize,
    pub name: String,
    pub reached: Reached,
    /// Only present for stops not yet reached.
    pub eta: Option<Eta>,
}

impl fmt::Display for TimelineEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = if self.reached.is_reached() {
            "✓".to_string()
        } else {
            self.number.to_string()
        };
        write!(f, "[{marker:>2}] {}", self.name)?;
        if let Some(eta) = self.eta {
            write!(f, "  {eta}")?;
        }
        Ok(())
    }
}

/// The rendered view of a live trip. Derived, never written back.
#[derive(Debug, Clone, PartialEq)]
pub struct TripView {
    pub progress: f64,
    pub distance_traveled: f64,
    pub total_route_length: f64,
    pub timeline: Vec<TimelineEntry>,
}

impl TripView {
    pub fn from_state(state: &LiveTripState) -> Self {
        let timeline = state
            .stops
            .iter()
            .enumerate()
            .map(|(i, stop)| {
                let reached = stop_reached(state, stop);
                let eta = if reached.is_reached() {
                    None
                } else {
                    state.stop_etas.get(stop.key()).copied().map(Eta::from)
                };
                TimelineEntry {
                    number: i + 1,
                    name: stop.name.clone(),
                    reached,
                    eta,
                }
            })
            .collect();

        Self {
            progress: progress_percent(state.distance_traveled, state.total_route_length),
            distance_traveled: state.distance_traveled,
            total_route_length: state.total_route_length,
            timeline,
        }
    }

    pub fn entry(&self, name: &str) -> Option<&TimelineEntry> {
        self.timeline.iter().find(|e| e.name == name)
    }
}

impl fmt::Display for TripView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Progress {:>5.1}%  ({:.2} / {:.2})",
            self.progress, self.distance_traveled, self.total_route_length
        )?;
        if self.timeline.is_empty() {
            return writeln!(f, "No stop data available.");
        }
        for entry in &self.timeline {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}
