use thiserror::Error;

/// Why a call attempt ended in a failure state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    #[error("no eligible peer was available when the selection deadline passed")]
    NoCandidateAvailable,

    #[error("malformed signaling message: {0}")]
    MalformedSignalingMessage(String),

    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("remote peer did not answer in time")]
    AnswerTimeout,
}

/// Faults returned across the participant handle.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("a call session is already active ({0})")]
    SessionBusy(crate::session::CallState),

    #[error("participant event loop has stopped")]
    ParticipantStopped,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors raised by a transport primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("transport rejected the operation: {0}")]
    Rejected(String),

    #[error("transport is closed")]
    Closed,
}

impl TransportError {
    /// Maps a transport error onto the terminal failure it causes.
    pub fn into_failure(self) -> CallFailure {
        match self {
            TransportError::InvalidDescription(reason) => {
                CallFailure::MalformedSignalingMessage(reason)
            }
            other => CallFailure::NegotiationFailed(other.to_string()),
        }
    }
}

/// Wire-level decoding errors for mailbox payloads.
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("payload is not a recognised signaling message: {0}")]
    UnknownPayload(#[source] serde_json::Error),

    #[error("session description text is not valid: {0}")]
    BadDescription(#[source] serde_json::Error),

    #[error("expected an {expected} description, got {actual}")]
    WrongDescriptionType {
        expected: &'static str,
        actual: &'static str,
    },
}

impl From<SignalingError> for CallFailure {
    fn from(err: SignalingError) -> Self {
        CallFailure::MalformedSignalingMessage(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("ICE server {0} has an empty url")]
    EmptyServerUrl(String),

    #[error("TURN server {0} requires username and credential")]
    MissingTurnCredentials(String),
}
