use std::sync::Arc;

use crate::config::ServerConfig;
use crate::engine::JobDispatcher;
use crate::ws::ProgressHub;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheap to clone; everything is behind `Arc` or already `Clone`.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool (health checks).
    pub pool: bulkedit_db::DbPool,
    pub config: Arc<ServerConfig>,
    /// Live progress connections.
    pub hub: Arc<ProgressHub>,
    /// Job lifecycle: enqueue, queries, cancellation.
    pub dispatcher: Arc<JobDispatcher>,
}
