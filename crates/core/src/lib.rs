//! Domain types shared by every bulkedit crate.
//!
//! Nothing in here performs I/O: identifiers, error enums, the closed set
//! of field kinds with their conversion functions, job mapping validation
//! and the WebSocket message type constants.

pub mod error;
pub mod failures;
pub mod fields;
pub mod job_events;
pub mod mapping;
pub mod types;
