#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bus_tracker_lib::{
    comms::PushEvent,
    live_state::LiveTripState,
    position::{offset_north, LngLat, PositionSample},
    route::{Route, RoutePath, Stop},
    trip::{PositionReport, SessionStatus, StartTripRequest, StartTripResponse, TripId},
};
use chrono::{TimeZone, Utc};
use tokio::sync::{broadcast, mpsc};
use tracker_client::{
    backend::TrackerBackend,
    camera::HeadlessMap,
    channel::{PushSocket, PushTransport},
    error::{BackendError, ChannelError, SensorError},
    sensor::{LocationSensor, SensorReading, SensorSubscription},
    ClientHandle, Notice, TrackerConfig, TripSessionController,
};

pub const ORIGIN: LngLat = LngLat {
    longitude: -44.71,
    latitude: -23.22,
};

pub fn sample(meters_north: f64, ms: i64) -> PositionSample {
    let at = offset_north(ORIGIN, meters_north);
    let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
    PositionSample::new(at.latitude, at.longitude, t0 + chrono::Duration::milliseconds(ms))
}

pub fn route(id: &str) -> Route {
    Route {
        route_id: id.into(),
        line_number: "7".into(),
        name: format!("Line {id}"),
        stops: vec![
            Stop::new("s1", "A", ORIGIN, 0.),
            Stop::new("s2", "B", offset_north(ORIGIN, 1000.), 1000.),
            Stop::new("s3", "C", offset_north(ORIGIN, 2000.), 2000.),
        ],
        route_path: RoutePath::new(vec![ORIGIN, offset_north(ORIGIN, 2000.)]),
    }
}

#[derive(Default)]
pub struct BackendLog {
    pub open_trip: Option<TripId>,
    pub next_trip: u32,
    pub reject_start: Option<BackendError>,
    pub reject_end: Option<BackendError>,
    pub fail_reports: bool,
    pub fail_snapshot: bool,
    /// Defaults to the route geometry with no progress.
    pub snapshot: Option<LiveTripState>,
    pub starts: Vec<StartTripRequest>,
    pub reports: Vec<PositionReport>,
    pub ended: Vec<TripId>,
}

#[derive(Default, Clone)]
pub struct FakeBackend {
    pub log: Arc<Mutex<BackendLog>>,
}

impl FakeBackend {
    pub fn log(&self) -> std::sync::MutexGuard<'_, BackendLog> {
        self.log.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl TrackerBackend for FakeBackend {
    async fn current_session(&self) -> Result<SessionStatus, BackendError> {
        Ok(SessionStatus {
            message: None,
            trip_id: self.log().open_trip.clone(),
        })
    }

    async fn start_trip(&self, request: &StartTripRequest) -> Result<StartTripResponse, BackendError> {
        let mut log = self.log();
        if let Some(err) = log.reject_start.clone() {
            return Err(err);
        }
        log.starts.push(request.clone());
        log.next_trip += 1;
        let trip_id = TripId::new(format!("t-{}", log.next_trip));
        log.open_trip = Some(trip_id.clone());
        Ok(StartTripResponse {
            trip_id,
            route: route(&request.route_id),
        })
    }

    async fn report_position(&self, report: &PositionReport) -> Result<(), BackendError> {
        let mut log = self.log();
        if log.fail_reports {
            return Err(BackendError::Status {
                status: 500,
                message: "Internal Server Error".into(),
            });
        }
        log.reports.push(report.clone());
        Ok(())
    }

    async fn end_trip(&self, trip_id: &TripId) -> Result<(), BackendError> {
        let mut log = self.log();
        if let Some(err) = log.reject_end.clone() {
            return Err(err);
        }
        log.ended.push(trip_id.clone());
        log.open_trip = None;
        Ok(())
    }

    async fn trip_snapshot(&self, _trip_id: &TripId) -> Result<LiveTripState, BackendError> {
        let log = self.log();
        if log.fail_snapshot {
            return Err(BackendError::Transport("connection reset".into()));
        }
        Ok(log.snapshot.clone().unwrap_or_else(|| {
            let route = route("line");
            LiveTripState {
                total_route_length: route.total_length(),
                route_path: Some(route.route_path),
                stops: route.stops,
                ..Default::default()
            }
        }))
    }
}

/// Sensor fed by the test. Each subscription gets a fresh feed.
#[derive(Default, Clone)]
pub struct FakeSensor {
    feed: Arc<Mutex<Option<mpsc::Sender<SensorReading>>>>,
    subscriptions: Arc<Mutex<usize>>,
}

impl FakeSensor {
    pub fn subscriptions(&self) -> usize {
        *self.subscriptions.lock().unwrap()
    }

    fn feed(&self) -> Option<mpsc::Sender<SensorReading>> {
        self.feed.lock().unwrap().clone()
    }

    /// Waits for a live subscription, then hands it a reading.
    pub async fn push(&self, reading: SensorReading) {
        let feed = eventually(|| self.feed().filter(|feed| !feed.is_closed())).await;
        feed.send(reading).await.unwrap();
    }

    pub fn is_watching(&self) -> bool {
        self.feed().is_some_and(|feed| !feed.is_closed())
    }

    pub async fn wait_released(&self) {
        eventually(|| (!self.is_watching()).then_some(())).await;
    }
}

#[async_trait::async_trait]
impl LocationSensor for FakeSensor {
    async fn current_position(&self) -> Result<PositionSample, SensorError> {
        Ok(sample(0., 0))
    }

    async fn subscribe(&self) -> Result<SensorSubscription, SensorError> {
        let (tx, rx) = mpsc::channel(16);
        *self.feed.lock().unwrap() = Some(tx);
        *self.subscriptions.lock().unwrap() += 1;
        Ok(SensorSubscription::new(rx, None))
    }
}

pub struct Connection {
    pub url: String,
    /// Another connection was still up when this one was made.
    pub overlapped: bool,
    pub sent: Arc<Mutex<Vec<String>>>,
    pub to_client: mpsc::UnboundedSender<Option<String>>,
}

/// In-memory push server. Records every connection.
#[derive(Default, Clone)]
pub struct FakeTransport {
    pub connections: Arc<Mutex<Vec<Connection>>>,
}

impl FakeTransport {
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub async fn wait_connections(&self, count: usize) {
        eventually(|| (self.connection_count() >= count).then_some(())).await;
    }

    pub fn sent(&self, index: usize) -> Vec<String> {
        self.connections.lock().unwrap()[index].sent.lock().unwrap().clone()
    }

    pub fn overlapped(&self, index: usize) -> bool {
        self.connections.lock().unwrap()[index].overlapped
    }

    pub fn is_open(&self, index: usize) -> bool {
        !self.connections.lock().unwrap()[index].to_client.is_closed()
    }

    /// Sends `event` on the most recent connection.
    pub fn push(&self, event: &PushEvent) {
        self.push_text(&event.to_text());
    }

    /// Sends a raw frame on the most recent connection.
    pub fn push_text(&self, text: &str) {
        let connections = self.connections.lock().unwrap();
        let connection = connections.last().expect("no push connection");
        connection.to_client.send(Some(text.to_string())).unwrap();
    }

    /// Server-side hang up of the most recent connection.
    pub fn hang_up(&self) {
        let connections = self.connections.lock().unwrap();
        if let Some(connection) = connections.last() {
            let _ = connection.to_client.send(None);
        }
    }
}

struct FakeSocket {
    sent: Arc<Mutex<Vec<String>>>,
    from_server: mpsc::UnboundedReceiver<Option<String>>,
}

#[async_trait::async_trait]
impl PushTransport for FakeTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushSocket>, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut connections = self.connections.lock().unwrap();
        let overlapped = connections.iter().any(|c| !c.to_client.is_closed());
        connections.push(Connection {
            url: url.into(),
            overlapped,
            sent: sent.clone(),
            to_client: tx,
        });
        Ok(Box::new(FakeSocket { sent, from_server: rx }))
    }
}

#[async_trait::async_trait]
impl PushSocket for FakeSocket {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String, ChannelError>> {
        self.from_server.recv().await.flatten().map(Ok)
    }
}

pub struct Harness {
    pub client: ClientHandle,
    pub notices: broadcast::Receiver<Notice>,
    pub backend: FakeBackend,
    pub sensor: FakeSensor,
    pub transport: FakeTransport,
    pub map: HeadlessMap,
}

pub fn config() -> TrackerConfig {
    TrackerConfig {
        reconnect_initial: Duration::from_millis(5),
        reconnect_max: Duration::from_millis(20),
        ..Default::default()
    }
}

pub fn controller(config: &TrackerConfig) -> (TripSessionController, FakeBackend, FakeSensor, FakeTransport, HeadlessMap) {
    let backend = FakeBackend::default();
    let sensor = FakeSensor::default();
    let transport = FakeTransport::default();
    let map = HeadlessMap::default();
    let controller = TripSessionController::new(
        config,
        Arc::new(backend.clone()),
        Arc::new(sensor.clone()),
        Arc::new(transport.clone()),
        Box::new(map.clone()),
    );
    (controller, backend, sensor, transport, map)
}

pub fn harness(config: &TrackerConfig) -> Harness {
    let (controller, backend, sensor, transport, map) = controller(config);
    let notices = controller.subscribe();
    let (client, _task) = controller.spawn();
    Harness {
        client,
        notices,
        backend,
        sensor,
        transport,
        map,
    }
}

/// Polls `check` until it yields, failing the test after a few seconds.
pub async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Next notice matching `select`, skipping the rest.
pub async fn wait_for<T>(notices: &mut broadcast::Receiver<Notice>, mut select: impl FnMut(&Notice) -> Option<T>) -> T {
    let next = async {
        loop {
            match notices.recv().await {
                Ok(notice) => {
                    if let Some(value) = select(&notice) {
                        return value;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("notice channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), next)
        .await
        .expect("timed out waiting for notice")
}
