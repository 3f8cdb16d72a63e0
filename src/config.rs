// Application configuration.
// Logging is always on in debug builds; release builds log only when RUST_LOG is set.

use crate::error::ConfigError;
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

/// Delay between creating the local offer and picking a peer to send it to.
pub const SELECTION_DEADLINE: Duration = Duration::from_secs(10);

/// Presence records older than this are not eligible for selection.
pub const STALE_AFTER: Duration = Duration::from_secs(30);

/// How long a caller waits for an answer once its offer is out.
pub const ANSWER_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on waiting for ICE gathering before publishing a description.
pub const ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Runtime knobs for a participant. Durations are milliseconds in JSON.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    #[serde(with = "millis")]
    pub selection_deadline: Duration,
    #[serde(with = "millis")]
    pub stale_after: Duration,
    #[serde(with = "opt_millis")]
    pub answer_timeout: Option<Duration>,
    /// `None` keeps presence one-shot: written on register and on status changes only.
    #[serde(with = "opt_millis")]
    pub heartbeat_interval: Option<Duration>,
    #[serde(with = "millis")]
    pub ice_gathering_timeout: Duration,
    pub ice_servers: Vec<ServerConfig>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            selection_deadline: SELECTION_DEADLINE,
            stale_after: STALE_AFTER,
            answer_timeout: Some(ANSWER_TIMEOUT),
            heartbeat_interval: None,
            ice_gathering_timeout: ICE_GATHERING_TIMEOUT,
            ice_servers: default_ice_servers(),
        }
    }
}

impl CallConfig {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: CallConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("selection_deadline", Some(self.selection_deadline)),
            ("stale_after", Some(self.stale_after)),
            ("answer_timeout", self.answer_timeout),
            ("heartbeat_interval", self.heartbeat_interval),
            ("ice_gathering_timeout", Some(self.ice_gathering_timeout)),
        ];
        for (name, value) in durations {
            if value == Some(Duration::ZERO) {
                return Err(ConfigError::ZeroDuration(name));
            }
        }

        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::EmptyServerUrl(server.id.clone()));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::MissingTurnCredentials(server.id.clone()));
            }
        }
        Ok(())
    }
}

pub fn default_ice_servers() -> Vec<ServerConfig> {
    DEFAULT_STUN_SERVERS
        .iter()
        .enumerate()
        .map(|(i, url)| ServerConfig {
            id: format!("default-stun-{i}"),
            r#type: "stun".into(),
            url: (*url).into(),
            username: None,
            credential: None,
        })
        .collect()
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => s.serialize_some(&(v.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|v| v.map(Duration::from_millis))
    }
}
