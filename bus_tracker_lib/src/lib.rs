pub mod comms;
pub mod live_state;
pub mod position;
pub mod route;
pub mod timeline;
pub mod trip;
