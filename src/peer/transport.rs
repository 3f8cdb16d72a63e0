use crate::error::TransportError;
use crate::peer::types::RemoteTrack;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// Session description as exchanged through the mailbox, `{"type": .., "sdp": ..}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

pub type RemoteTrackHandler = Box<dyn Fn(RemoteTrack) + Send + Sync>;

/// One negotiated media session with a single remote peer.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    /// Applies `desc` locally and returns the description to publish, which may
    /// carry more than `desc` (e.g. gathered candidates).
    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    fn on_remote_track(&self, handler: RemoteTrackHandler);

    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates a fresh transport for every call session.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn SessionTransport>, TransportError>;
}
