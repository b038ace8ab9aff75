use std::sync::Arc;

use bus_tracker_lib::{
    comms::PushEvent,
    live_state::{LiveTripPatch, LiveTripState},
    position::{LngLat, PositionSample},
    route::Route,
    timeline::TripView,
    trip::{PositionReport, StartTripRequest, TripId},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    backend::TrackerBackend,
    camera::{MapCamera, MapWidget},
    channel::{ChannelStatus, PushChannel, PushTransport},
    configuration::TrackerConfig,
    error::{BackendError, SensorError, TrackerError},
    sampler::GeoSampler,
    sensor::LocationSensor,
    store::LiveStateStore,
};

/// Counts trip activations. Producers tag their events with the generation
/// they were started under, and the loop drops anything from an older one.
pub type Generation = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Reports the vehicle position and owns the trip.
    Driver,
    /// Only watches a trip.
    Viewer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Asking the backend for a trip to resume.
    Checking,
    NoTrip,
    Active {
        trip_id: TripId,
        role: Role,
        /// Off means the trip is live but position reports are paused.
        reporting: bool,
    },
}

impl SessionState {
    pub fn trip_id(&self) -> Option<&TripId> {
        match self {
            SessionState::Active { trip_id, .. } => Some(trip_id),
            _ => None,
        }
    }
}

/// Output of the asynchronous producers feeding the session loop.
#[derive(Debug)]
pub enum ClientEvent {
    /// A sample that passed the throttle.
    Sample {
        generation: Generation,
        sample: PositionSample,
    },
    SensorFailed {
        generation: Generation,
        error: SensorError,
    },
    ReportFailed {
        generation: Generation,
        /// Reporting epoch the report was sent in. Bumped on every pause or resume.
        epoch: u64,
        error: BackendError,
    },
    Snapshot {
        generation: Generation,
        result: Result<LiveTripState, BackendError>,
    },
    Push {
        generation: Generation,
        event: PushEvent,
    },
    Channel {
        generation: Generation,
        status: ChannelStatus,
    },
}

impl ClientEvent {
    pub fn generation(&self) -> Generation {
        match self {
            ClientEvent::Sample { generation, .. }
            | ClientEvent::SensorFailed { generation, .. }
            | ClientEvent::ReportFailed { generation, .. }
            | ClientEvent::Snapshot { generation, .. }
            | ClientEvent::Push { generation, .. }
            | ClientEvent::Channel { generation, .. } => *generation,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, TrackerError>>;

pub enum Command {
    CheckSession(Reply<SessionState>),
    Start {
        route_id: String,
        /// Taken from the sensor when absent.
        initial_position: Option<PositionSample>,
        reply: Reply<TripId>,
    },
    End(Reply<()>),
    ToggleReporting(Reply<bool>),
    Watch {
        trip_id: TripId,
        reply: Reply<()>,
    },
    Recenter,
    UserDrag,
    Status(oneshot::Sender<SessionState>),
    Shutdown,
}

/// What the UI gets told.
#[derive(Debug, Clone)]
pub enum Notice {
    Session(SessionState),
    View(TripView),
    CameraMoved(LngLat),
    Channel(ChannelStatus),
    Error(TrackerError),
    TripEnded {
        trip_id: TripId,
        message: Option<String>,
    },
}

/// Owns the trip lifecycle and everything tied to it: the sampler, the push
/// channel, the live state and the camera. Runs as a single event loop, so
/// producer events and commands never interleave.
pub struct TripSessionController {
    backend: Arc<dyn TrackerBackend>,
    sensor: Arc<dyn LocationSensor>,
    sampler: GeoSampler,
    channel: PushChannel,
    store: LiveStateStore,
    camera: MapCamera,
    pause_on_report_failure: bool,

    state: SessionState,
    generation: Generation,
    reporting_epoch: u64,

    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events_rx: mpsc::UnboundedReceiver<ClientEvent>,
    notices: broadcast::Sender<Notice>,
}

impl TripSessionController {
    pub fn new(
        config: &TrackerConfig,
        backend: Arc<dyn TrackerBackend>,
        sensor: Arc<dyn LocationSensor>,
        transport: Arc<dyn PushTransport>,
        map: Box<dyn MapWidget>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(256);

        Self {
            backend,
            sampler: GeoSampler::new(sensor.clone(), config),
            sensor,
            channel: PushChannel::new(transport, config),
            store: LiveStateStore::new(config.distance_regression),
            camera: MapCamera::new(map, config.route_padding),
            pause_on_report_failure: config.pause_on_report_failure,
            state: SessionState::NoTrip,
            generation: 0,
            reporting_epoch: 0,
            events_tx,
            events_rx,
            notices,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Moves the controller onto its own task.
    pub fn spawn(self) -> (ClientHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ClientHandle {
            commands: tx,
            notices: self.notices.clone(),
        };
        (handle, tokio::spawn(self.run(rx)))
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        tracing::info!("Session loop started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }

        self.release();
        tracing::info!("Session loop stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::CheckSession(reply) => {
                let _ = reply.send(self.check_current_session().await);
            }
            Command::Start {
                route_id,
                initial_position,
                reply,
            } => {
                let _ = reply.send(self.start(&route_id, initial_position).await);
            }
            Command::End(reply) => {
                let _ = reply.send(self.end().await);
            }
            Command::ToggleReporting(reply) => {
                let _ = reply.send(self.toggle_reporting());
            }
            Command::Watch { trip_id, reply } => {
                let _ = reply.send(self.watch(trip_id));
            }
            Command::Recenter => self.recenter(),
            Command::UserDrag => self.camera.on_user_drag(),
            Command::Status(reply) => {
                let _ = reply.send(self.state.clone());
            }
            Command::Shutdown => {}
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Resumes the trip the backend still has open for us, with reporting
    /// paused until the driver turns it back on.
    pub async fn check_current_session(&mut self) -> Result<SessionState, TrackerError> {
        if matches!(self.state, SessionState::Active { .. }) {
            return Ok(self.state.clone());
        }

        self.set_state(SessionState::Checking);
        let status = match self.backend.current_session().await {
            Ok(status) => status,
            Err(err) => {
                self.set_state(SessionState::NoTrip);
                return Err(self.surface(err.into()));
            }
        };

        match status.trip_id {
            Some(trip_id) => {
                tracing::info!("Resuming trip {}", trip_id);
                self.activate(trip_id, Role::Driver, false, None);
            }
            None => self.set_state(SessionState::NoTrip),
        }
        Ok(self.state.clone())
    }

    pub async fn start(&mut self, route_id: &str, initial_position: Option<PositionSample>) -> Result<TripId, TrackerError> {
        if let Some(trip_id) = self.state.trip_id() {
            return Err(self.surface(TrackerError::TripAlreadyActive(trip_id.clone())));
        }

        let position = match initial_position {
            Some(position) => position,
            None => self
                .sensor
                .current_position()
                .await
                .map_err(|err| self.surface(err.into()))?,
        };

        let request = StartTripRequest {
            route_id: route_id.into(),
            lat: position.latitude,
            lng: position.longitude,
        };
        let response = self
            .backend
            .start_trip(&request)
            .await
            .map_err(|err| self.surface(err.into()))?;

        tracing::info!("Started trip {} on route {}", response.trip_id, route_id);
        self.activate(response.trip_id.clone(), Role::Driver, true, Some(&response.route));
        Ok(response.trip_id)
    }

    /// Viewer mode: follow a trip someone else is driving.
    pub fn watch(&mut self, trip_id: TripId) -> Result<(), TrackerError> {
        if let Some(active) = self.state.trip_id() {
            return Err(self.surface(TrackerError::TripAlreadyActive(active.clone())));
        }

        tracing::info!("Watching trip {}", trip_id);
        self.activate(trip_id, Role::Viewer, false, None);
        Ok(())
    }

    /// Ends the trip. The local trip only goes away once the backend agrees.
    /// Without an active trip this does nothing.
    pub async fn end(&mut self) -> Result<(), TrackerError> {
        let SessionState::Active { trip_id, role, .. } = self.state.clone() else {
            return Ok(());
        };

        if role == Role::Driver {
            self.backend
                .end_trip(&trip_id)
                .await
                .map_err(|err| self.surface(err.into()))?;
        }

        self.finish(None);
        Ok(())
    }

    /// Pauses or resumes position reports. Returns whether reporting is now on.
    pub fn toggle_reporting(&mut self) -> Result<bool, TrackerError> {
        let SessionState::Active { trip_id, role, reporting } = self.state.clone() else {
            return Err(TrackerError::NoActiveTrip);
        };
        if role != Role::Driver {
            return Err(TrackerError::NotDriver);
        }

        let reporting = !reporting;
        self.reporting_epoch += 1;
        if reporting {
            self.sampler.start(self.generation, self.events_tx.clone());
        } else {
            self.sampler.stop();
        }

        tracing::info!("Reporting {} for trip {}", if reporting { "resumed" } else { "paused" }, trip_id);
        self.set_state(SessionState::Active { trip_id, role, reporting });
        Ok(reporting)
    }

    pub fn recenter(&mut self) {
        if let Some(center) = self.camera.recenter(self.store.state()) {
            self.notify(Notice::CameraMoved(center));
        }
    }

    pub fn handle_event(&mut self, event: ClientEvent) {
        if event.generation() != self.generation {
            tracing::debug!("Dropping event from generation {}", event.generation());
            return;
        }
        let SessionState::Active { trip_id, role, reporting } = self.state.clone() else {
            return;
        };

        match event {
            ClientEvent::Sample { sample, .. } => {
                if role == Role::Driver && reporting {
                    self.report(trip_id, sample);
                }
            }
            ClientEvent::SensorFailed { error, .. } => {
                tracing::error!("Location sensor failed: {}", error);
                self.sampler.stop();
                self.notify(Notice::Error(error.into()));
                if reporting {
                    self.set_state(SessionState::Active { trip_id, role, reporting: false });
                }
            }
            ClientEvent::ReportFailed { epoch, error, .. } => {
                if epoch != self.reporting_epoch {
                    tracing::debug!("Ignoring report failure from before the last pause or resume: {}", error);
                    return;
                }
                tracing::warn!("Position report for trip {} failed: {}", trip_id, error);
                self.notify(Notice::Error(error.into()));
                if self.pause_on_report_failure && reporting {
                    self.sampler.stop();
                    self.set_state(SessionState::Active { trip_id, role, reporting: false });
                }
            }
            ClientEvent::Snapshot { result, .. } => match result {
                Ok(snapshot) => {
                    self.store.seed(&trip_id, snapshot);
                    self.render(false);
                }
                Err(err) => {
                    tracing::warn!("Could not load trip {}: {}", trip_id, err);
                    self.notify(Notice::Error(err.into()));
                }
            },
            ClientEvent::Push { event, .. } => match event {
                PushEvent::PositionUpdate(patch) => {
                    self.store.apply_patch(&trip_id, &patch);
                    self.render(patch.moves_vehicle());
                }
                PushEvent::TripEnded { message } => {
                    tracing::info!("Trip {} ended by server: {}", trip_id, message.as_deref().unwrap_or("no reason given"));
                    self.finish(message);
                }
            },
            ClientEvent::Channel { status, .. } => {
                self.notify(Notice::Channel(status));
            }
        }
    }

    /// Fire and forget. A failure comes back as a `ReportFailed` event.
    fn report(&self, trip_id: TripId, sample: PositionSample) {
        let backend = self.backend.clone();
        let events = self.events_tx.clone();
        let generation = self.generation;
        let epoch = self.reporting_epoch;
        let report = PositionReport {
            trip_id,
            lat: sample.latitude,
            lng: sample.longitude,
        };

        tokio::spawn(async move {
            match backend.report_position(&report).await {
                Ok(()) => tracing::debug!("Reported position {}, {}", report.lat, report.lng),
                Err(error) => {
                    let _ = events.send(ClientEvent::ReportFailed { generation, epoch, error });
                }
            }
        });
    }

    fn activate(&mut self, trip_id: TripId, role: Role, reporting: bool, route: Option<&Route>) {
        self.release();
        self.generation += 1;

        self.store.open(trip_id.clone());
        self.camera.activate();
        if let Some(route) = route {
            self.store.apply_patch(&trip_id, &route_patch(route));
            self.render(false);
        }

        self.fetch_snapshot(trip_id.clone());
        self.channel.open(trip_id.clone(), self.generation, self.events_tx.clone());
        if reporting {
            self.sampler.start(self.generation, self.events_tx.clone());
        }

        self.set_state(SessionState::Active { trip_id, role, reporting });
    }

    fn fetch_snapshot(&self, trip_id: TripId) {
        let backend = self.backend.clone();
        let events = self.events_tx.clone();
        let generation = self.generation;

        tokio::spawn(async move {
            let result = backend.trip_snapshot(&trip_id).await;
            let _ = events.send(ClientEvent::Snapshot { generation, result });
        });
    }

    fn finish(&mut self, message: Option<String>) {
        let Some(trip_id) = self.state.trip_id().cloned() else {
            return;
        };

        self.release();
        // Anything still in flight for this trip is now stale
        self.generation += 1;
        self.set_state(SessionState::NoTrip);
        self.notify(Notice::TripEnded { trip_id, message });
    }

    /// Stops the sampler, closes the channel and drops all live state and map
    /// layers.
    fn release(&mut self) {
        self.sampler.stop();
        self.channel.close();
        self.store.clear();
        self.camera.clear();
    }

    fn render(&mut self, vehicle_moved: bool) {
        let Some(state) = self.store.state() else {
            return;
        };
        let view = TripView::from_state(state);
        let center = self.camera.render(state, &view, vehicle_moved);

        if let Some(center) = center {
            self.notify(Notice::CameraMoved(center));
        }
        self.notify(Notice::View(view));
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!("Session state {:?} -> {:?}", self.state, state);
            self.state = state.clone();
            self.notify(Notice::Session(state));
        }
    }

    fn surface(&self, err: TrackerError) -> TrackerError {
        tracing::error!("{}", err);
        self.notify(Notice::Error(err.clone()));
        err
    }

    fn notify(&self, notice: Notice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }
}

/// Route geometry and stops from the start response, so the map can draw
/// before the first snapshot lands.
fn route_patch(route: &Route) -> LiveTripPatch {
    LiveTripPatch {
        route_path: Some(route.route_path.clone()),
        stops: Some(route.stops.clone()),
        total_route_length: Some(route.total_length()),
        ..Default::default()
    }
}

/// Cloneable front end to a running [`TripSessionController`].
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    notices: broadcast::Sender<Notice>,
}

impl ClientHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub async fn check_current_session(&self) -> Result<SessionState, TrackerError> {
        self.request(Command::CheckSession).await
    }

    pub async fn start(&self, route_id: &str, initial_position: Option<PositionSample>) -> Result<TripId, TrackerError> {
        let route_id = route_id.to_string();
        self.request(|reply| Command::Start {
            route_id,
            initial_position,
            reply,
        })
        .await
    }

    pub async fn end(&self) -> Result<(), TrackerError> {
        self.request(Command::End).await
    }

    pub async fn toggle_reporting(&self) -> Result<bool, TrackerError> {
        self.request(Command::ToggleReporting).await
    }

    pub async fn watch(&self, trip_id: TripId) -> Result<(), TrackerError> {
        self.request(|reply| Command::Watch { trip_id, reply }).await
    }

    pub async fn status(&self) -> Result<SessionState, TrackerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx))?;
        rx.await.map_err(|_| TrackerError::Shutdown)
    }

    pub fn recenter(&self) -> Result<(), TrackerError> {
        self.send(Command::Recenter)
    }

    pub fn user_drag(&self) -> Result<(), TrackerError> {
        self.send(Command::UserDrag)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, TrackerError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| TrackerError::Shutdown)?
    }

    fn send(&self, command: Command) -> Result<(), TrackerError> {
        self.commands.send(command).map_err(|_| TrackerError::Shutdown)
    }
}
