use crate::utils::random_token;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Participant identifier, `peer-<base36 token>`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub const PREFIX: &'static str = "peer-";

    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Fresh random id. Use [`PeerId::local`] for the process-wide one.
    pub fn generate() -> Self {
        PeerId(format!("{}{}", Self::PREFIX, random_token()))
    }

    /// The identifier assigned to this process, generated on first use.
    pub fn local() -> PeerId {
        crate::peer::state::LOCAL_ID.clone()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId(id.to_string())
    }
}

/// Advertised availability of a participant
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PeerStatus {
    Available,
    InCall,
}

/// Presence entry stored under `peers/<id>`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub id: PeerId,
    pub status: PeerStatus,
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub last_seen: DateTime<Utc>,
}

impl PeerRecord {
    pub fn new(id: PeerId, status: PeerStatus) -> Self {
        Self {
            id,
            status,
            last_seen: Utc::now(),
        }
    }
}

/// ICE server configuration
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Unknown,
}

/// A media track the remote side started sending
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}
