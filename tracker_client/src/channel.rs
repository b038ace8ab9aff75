use std::{sync::Arc, time::Duration};

use bus_tracker_lib::{
    comms::{ClientFrame, PushEvent},
    trip::TripId,
};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::{
    configuration::TrackerConfig,
    error::ChannelError,
    session::{ClientEvent, Generation},
};

/// Opens bidirectional text-frame connections to the push server.
#[async_trait::async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushSocket>, ChannelError>;
}

#[async_trait::async_trait]
pub trait PushSocket: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError>;

    /// Next text frame. `None` once the server has closed the connection.
    async fn next_text(&mut self) -> Option<Result<String, ChannelError>>;
}

/// Websocket transport.
pub struct WsTransport;

struct WsSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait::async_trait]
impl PushTransport for WsTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushSocket>, ChannelError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|err| ChannelError::Connect(err.to_string()))?;
        Ok(Box::new(WsSocket { stream }))
    }
}

#[async_trait::async_trait]
impl PushSocket for WsSocket {
    async fn send_text(&mut self, text: String) -> Result<(), ChannelError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| ChannelError::Send(err.to_string()))
    }

    async fn next_text(&mut self) -> Option<Result<String, ChannelError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => return Some(Err(ChannelError::Closed(err.to_string()))),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelStatus {
    /// Connected and joined to the trip channel.
    Connected,
    Disconnected { reason: String },
}

/// One push connection per client, joined to the channel of the active trip.
/// Reconnects with exponential backoff and joins again after every reconnect.
pub struct PushChannel {
    transport: Arc<dyn PushTransport>,
    url: String,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    joined: Option<(TripId, JoinHandle<()>)>,
    /// Aborted connection task the next one waits out before connecting.
    closing: Option<JoinHandle<()>>,
}

impl PushChannel {
    pub fn new(transport: Arc<dyn PushTransport>, config: &TrackerConfig) -> Self {
        Self {
            transport,
            url: config.push_url.clone(),
            reconnect_initial: config.reconnect_initial,
            reconnect_max: config.reconnect_max,
            joined: None,
            closing: None,
        }
    }

    /// Closes any previous connection, then connects and joins `trip_id`.
    /// Returns without waiting for the join. The new connection is only made
    /// once the old socket has been dropped.
    pub fn open(&mut self, trip_id: TripId, generation: Generation, events: mpsc::UnboundedSender<ClientEvent>) {
        self.close();
        let previous = self.closing.take();

        let task = tokio::spawn(run_channel(
            previous,
            self.transport.clone(),
            self.url.clone(),
            trip_id.clone(),
            generation,
            events,
            (self.reconnect_initial, self.reconnect_max),
        ));
        tracing::info!("Opening push channel for trip {}", trip_id);
        self.joined = Some((trip_id, task));
    }

    pub fn close(&mut self) {
        if let Some((trip_id, task)) = self.joined.take() {
            task.abort();
            self.closing = Some(task);
            tracing::info!("Closed push channel for trip {}", trip_id);
        }
    }

    pub fn trip_id(&self) -> Option<&TripId> {
        self.joined.as_ref().map(|(trip_id, _)| trip_id)
    }

    pub fn is_open(&self) -> bool {
        self.joined.is_some()
    }
}

impl Drop for PushChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_channel(
    previous: Option<JoinHandle<()>>,
    transport: Arc<dyn PushTransport>,
    url: String,
    trip_id: TripId,
    generation: Generation,
    events: mpsc::UnboundedSender<ClientEvent>,
    (initial, max): (Duration, Duration),
) {
    if let Some(previous) = previous {
        // Resolves once the aborted task, and with it the old socket, is gone
        let _ = previous.await;
    }

    let mut backoff = initial;

    loop {
        let reason = match listen(&*transport, &url, &trip_id, generation, &events).await {
            Ok(Listened::ClosedByServer) => {
                backoff = initial;
                "closed by server".to_string()
            }
            Ok(Listened::LoopGone) => return,
            Err((joined, err)) => {
                if joined {
                    backoff = initial;
                }
                err.to_string()
            }
        };

        tracing::warn!("Push channel for trip {} down ({}), retrying in {:?}", trip_id, reason, backoff);
        let status = ChannelStatus::Disconnected { reason };
        if events.send(ClientEvent::Channel { generation, status }).is_err() {
            return;
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max);
    }
}

enum Listened {
    ClosedByServer,
    /// The session loop stopped listening.
    LoopGone,
}

/// One connection attempt. The error carries whether the join had succeeded.
async fn listen(
    transport: &dyn PushTransport,
    url: &str,
    trip_id: &TripId,
    generation: Generation,
    events: &mpsc::UnboundedSender<ClientEvent>,
) -> Result<Listened, (bool, ChannelError)> {
    let mut socket = transport.connect(url).await.map_err(|err| (false, err))?;
    socket
        .send_text(ClientFrame::JoinTrip(trip_id.clone()).to_text())
        .await
        .map_err(|err| (false, err))?;

    tracing::info!("Joined push channel for trip {}", trip_id);
    let status = ChannelStatus::Connected;
    if events.send(ClientEvent::Channel { generation, status }).is_err() {
        return Ok(Listened::LoopGone);
    }

    while let Some(frame) = socket.next_text().await {
        let text = frame.map_err(|err| (true, err))?;
        let event = match PushEvent::parse(&text) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!("Ignoring push frame {:?}: {}", text, err);
                continue;
            }
        };

        if events.send(ClientEvent::Push { generation, event }).is_err() {
            return Ok(Listened::LoopGone);
        }
    }

    Ok(Listened::ClosedByServer)
}
