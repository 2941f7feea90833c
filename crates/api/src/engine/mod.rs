//! Job execution engine.
//!
//! Contains the dispatcher that claims pending jobs one at a time and runs
//! them through the update pipeline, plus the progress sink that forwards
//! pipeline snapshots to the job owner's WebSocket connections.

pub mod dispatcher;
pub mod progress;

pub use dispatcher::{DispatchError, JobDispatcher};
pub use progress::HubProgressSink;
