//! Progress hub: per-user WebSocket connections for live job progress.
//!
//! Provides the connection registry ([`ProgressHub`]), per-connection
//! heartbeat tracking and the HTTP upgrade handler.

mod handler;
mod heartbeat;
pub mod hub;

pub use handler::ws_handler;
pub use heartbeat::{HeartbeatConfig, Liveness};
pub use hub::{ConnectionHandle, HubError, ProgressHub};
