pub mod health;
pub mod jobs;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /ws                  progress WebSocket (token query parameter)
/// /jobs                list, submit (GET, POST)
/// /jobs/{id}           get job (GET)
/// /jobs/{id}/cancel    cancel the running job (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .nest("/jobs", jobs::router())
}
