pub mod backend;
pub mod camera;
pub mod channel;
pub mod configuration;
pub mod error;
pub mod logging;
pub mod sampler;
pub mod sensor;
pub mod session;
pub mod store;

pub use configuration::TrackerConfig;
pub use error::TrackerError;
pub use session::{ClientHandle, Notice, SessionState, TripSessionController};
