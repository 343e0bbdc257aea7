use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::store::{keys, StateStore};

use super::error::{AdmissionError, AdmissionResult};

/// Host hook that tears down a channel's live relay session.
#[async_trait]
pub trait ChannelLifecycle: Send + Sync {
    async fn stop_channel(&self, channel_uuid: Uuid) -> AdmissionResult<()>;
}

/// Stops a relay by publishing `channel_stop` on the channel's event topic,
/// which every relay worker subscribes to.
pub struct StoreChannelLifecycle {
    store: Arc<dyn StateStore>,
    worker_id: String,
}

impl fmt::Debug for StoreChannelLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreChannelLifecycle")
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

impl StoreChannelLifecycle {
    pub fn new(store: Arc<dyn StateStore>, worker_id: impl Into<String>) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
        }
    }
}

#[async_trait]
impl ChannelLifecycle for StoreChannelLifecycle {
    async fn stop_channel(&self, channel_uuid: Uuid) -> AdmissionResult<()> {
        let event = json!({
            "event": "channel_stop",
            "channel_id": channel_uuid.to_string(),
            "requester_worker_id": self.worker_id,
            "timestamp": Utc::now().timestamp_millis() as f64 / 1000.0,
        });
        self.store
            .publish(&keys::channel_events(&channel_uuid), &event.to_string())
            .await
            .map_err(|err| AdmissionError::Lifecycle {
                channel: channel_uuid.to_string(),
                reason: err.to_string(),
            })?;
        info!(channel = %channel_uuid, "requested relay stop");
        Ok(())
    }
}
