use bus_tracker_lib::{
    live_state::{merge, LiveTripPatch, LiveTripState, RegressionPolicy},
    timeline::TripView,
    trip::TripId,
};

/// Single source of truth for what the viewer sees of the current trip.
///
/// Writes for any trip other than the one the store was opened for are
/// ignored.
#[derive(Debug, Default)]
pub struct LiveStateStore {
    policy: RegressionPolicy,
    trip_id: Option<TripId>,
    state: Option<LiveTripState>,
}

impl LiveStateStore {
    pub fn new(policy: RegressionPolicy) -> Self {
        Self {
            policy,
            trip_id: None,
            state: None,
        }
    }

    /// Starts an empty store for `trip_id`, dropping whatever was there.
    pub fn open(&mut self, trip_id: TripId) {
        self.state = None;
        self.trip_id = Some(trip_id);
    }

    /// Discards everything. Nothing is kept across trips.
    pub fn clear(&mut self) {
        self.trip_id = None;
        self.state = None;
    }

    pub fn trip_id(&self) -> Option<&TripId> {
        self.trip_id.as_ref()
    }

    pub fn state(&self) -> Option<&LiveTripState> {
        self.state.as_ref()
    }

    /// Rendered view with stop-reached inference applied. The authoritative
    /// state is left untouched.
    pub fn view(&self) -> Option<TripView> {
        self.state.as_ref().map(TripView::from_state)
    }

    /// Initial full snapshot. Replaces an empty store; merged as a complete
    /// patch when pushed updates got here first, so monotonic fields hold.
    pub fn seed(&mut self, trip_id: &TripId, snapshot: LiveTripState) -> bool {
        if !self.accepts(trip_id) {
            return false;
        }

        self.state = Some(match self.state.take() {
            None => snapshot,
            Some(current) => {
                tracing::debug!("Snapshot for {} arrived after live updates, merging", trip_id);
                merge(&current, &LiveTripPatch::from(snapshot), self.policy)
            }
        });
        true
    }

    /// Field-level merge of a pushed update. An update before any snapshot
    /// starts from default values.
    pub fn apply_patch(&mut self, trip_id: &TripId, patch: &LiveTripPatch) -> bool {
        if !self.accepts(trip_id) {
            return false;
        }

        let current = self.state.take().unwrap_or_default();
        self.state = Some(merge(&current, patch, self.policy));
        true
    }

    fn accepts(&self, trip_id: &TripId) -> bool {
        if self.trip_id.as_ref() == Some(trip_id) {
            true
        } else {
            tracing::debug!("Dropping live state for {} (store holds {:?})", trip_id, self.trip_id);
            false
        }
    }
}
