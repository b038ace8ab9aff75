use bus_tracker_lib::trip::TripId;
use thiserror::Error;

/// Location sensor failures. Fatal to sampling only.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SensorError {
    #[error("location sensor unavailable: {0}")]
    Unavailable(String),

    #[error("location permission denied")]
    PermissionDenied,

    #[error("location stream ended")]
    StreamEnded,

    #[error("unreadable location data: {0}")]
    Malformed(String),
}

/// Failures talking to the trip backend.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Transport(String),

    #[error("backend answered {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

/// Push connection failures. Never end a trip.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChannelError {
    #[error("could not connect to push server: {0}")]
    Connect(String),

    #[error("push connection lost: {0}")]
    Closed(String),

    #[error("could not send on push connection: {0}")]
    Send(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("line {line}: expected 'key = value'")]
    Syntax { line: usize },

    #[error("invalid value for {key}: {reason}")]
    Value { key: String, reason: String },

    #[error("could not read configuration file {path}: {reason}")]
    Io { path: String, reason: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrackerError {
    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("trip {0} is already active")]
    TripAlreadyActive(TripId),

    #[error("no active trip")]
    NoActiveTrip,

    #[error("only the driver of a trip can do that")]
    NotDriver,

    #[error("tracking client has shut down")]
    Shutdown,
}
