//! Bridge from pipeline progress snapshots to the progress hub.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::Message;
use bulkedit_core::types::DbId;
use bulkedit_pipeline::{ProgressSink, ProgressUpdate};

use crate::ws::ProgressHub;

/// Delivers every [`ProgressUpdate`] to the owner's live connections.
///
/// Sends never wait on clients; an owner with no connections simply
/// misses the update.
pub struct HubProgressSink {
    hub: Arc<ProgressHub>,
}

impl HubProgressSink {
    pub fn new(hub: Arc<ProgressHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl ProgressSink for HubProgressSink {
    async fn publish(&self, owner_id: DbId, update: ProgressUpdate) {
        let job_id = update.job_id;
        let message = Message::Text(update.to_envelope().to_string().into());
        let delivered = self.hub.send_to_user(owner_id, message).await;
        tracing::trace!(job_id, user_id = owner_id, delivered, "Progress update sent");
    }
}
