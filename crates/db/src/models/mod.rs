//! Database row models and DTOs.

pub mod job;
pub mod status;
