use serde::{Deserialize, Serialize};

use crate::{live_state::LiveTripPatch, trip::TripId};

/// Events the server pushes on a trip channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireEvent", into = "WireEvent")]
pub enum PushEvent {
    PositionUpdate(LiveTripPatch),
    TripEnded { message: Option<String> },
}

// `tripEnded` may arrive with an empty or missing payload.
#[derive(Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
enum WireEvent {
    PositionUpdate(LiveTripPatch),
    TripEnded(Option<TripEndedData>),
}

#[derive(Default, Serialize, Deserialize)]
struct TripEndedData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl From<WireEvent> for PushEvent {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::PositionUpdate(patch) => Self::PositionUpdate(patch),
            WireEvent::TripEnded(data) => Self::TripEnded {
                message: data.and_then(|data| data.message),
            },
        }
    }
}

impl From<PushEvent> for WireEvent {
    fn from(event: PushEvent) -> Self {
        match event {
            PushEvent::PositionUpdate(patch) => Self::PositionUpdate(patch),
            PushEvent::TripEnded { message } => Self::TripEnded(Some(TripEndedData { message })),
        }
    }
}

/// Frames the client sends on the push connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientFrame {
    JoinTrip(TripId),
}

impl PushEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> String {
        // Serializing plain data with string keys cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
