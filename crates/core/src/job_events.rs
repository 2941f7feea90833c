//! WebSocket message type constants for the progress hub.
//!
//! Progress messages use a flat envelope (`type` plus the job counters);
//! every other notice uses the generic `{type, data, timestamp}` envelope.

/// Per-job progress snapshot sent to the job owner.
pub const MSG_TYPE_PROGRESS: &str = "progress";

/// Acknowledgment sent immediately after a connection is registered.
pub const MSG_TYPE_CONNECTED: &str = "connected";

/// Sent to every connection when the server is shutting down.
pub const MSG_TYPE_SHUTDOWN: &str = "shutdown";
