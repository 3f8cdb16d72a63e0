use crate::directory::SharedDirectory;
use crate::peer::types::{PeerId, PeerRecord, PeerStatus};
use std::sync::Arc;
use tracing::{debug, warn};

/// Directory node holding one presence record per participant.
pub const PEERS_NODE: &str = "peers/";

pub fn presence_key(id: &PeerId) -> String {
    format!("{PEERS_NODE}{id}")
}

/// Publishes the local participant's availability. Writes are fire-and-forget.
#[derive(Clone)]
pub struct PresenceRegistrar {
    directory: Arc<dyn SharedDirectory>,
}

impl PresenceRegistrar {
    pub fn new(directory: Arc<dyn SharedDirectory>) -> Self {
        Self { directory }
    }

    pub async fn register(&self, id: &PeerId) {
        self.refresh(id, PeerStatus::Available).await;
    }

    pub async fn mark_in_call(&self, id: &PeerId) {
        self.refresh(id, PeerStatus::InCall).await;
    }

    /// Rewrites the record with `status` and a current timestamp.
    pub async fn refresh(&self, id: &PeerId, status: PeerStatus) {
        let record = PeerRecord::new(id.clone(), status);
        match serde_json::to_value(&record) {
            Ok(value) => {
                debug!("presence {id} -> {status:?}");
                self.directory.put(&presence_key(id), Some(value)).await;
            }
            Err(e) => warn!("could not encode presence for {id}: {e}"),
        }
    }

    /// Removes the advertisement. Safe to call when already removed.
    pub async fn deregister(&self, id: &PeerId) {
        debug!("presence {id} removed");
        self.directory.put(&presence_key(id), None).await;
    }
}
