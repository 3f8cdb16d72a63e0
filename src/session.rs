use crate::peer::transport::{SessionDescription, SessionTransport};
use crate::peer::types::PeerId;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Sleep};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    Idle,
    NegotiatingLocal,
    AwaitingPeer,
    AwaitingAnswer,
    NegotiatingRemote,
    Connected,
    FailedNoPeer,
    Failed,
    Closed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallState::FailedNoPeer | CallState::Failed | CallState::Closed
        )
    }

    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed | Closed) => true,
            (Idle, NegotiatingLocal | NegotiatingRemote) => true,
            (NegotiatingLocal, AwaitingPeer) => true,
            (AwaitingPeer, AwaitingAnswer | Connected | FailedNoPeer) => true,
            (AwaitingAnswer, Connected | FailedNoPeer) => true,
            (NegotiatingRemote, Connected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "IDLE",
            CallState::NegotiatingLocal => "NEGOTIATING_LOCAL",
            CallState::AwaitingPeer => "AWAITING_PEER",
            CallState::AwaitingAnswer => "AWAITING_ANSWER",
            CallState::NegotiatingRemote => "NEGOTIATING_REMOTE",
            CallState::Connected => "CONNECTED",
            CallState::FailedNoPeer => "FAILED_NO_PEER",
            CallState::Failed => "FAILED",
            CallState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: CallState,
    pub to: CallState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineKind {
    /// Pick a peer and send the offer.
    Selection,
    /// Give up waiting for the answer.
    Answer,
}

/// Cancellable one-shot timer owned by a session. Dropping it cancels it.
pub struct Deadline {
    pub kind: DeadlineKind,
    sleep: Pin<Box<Sleep>>,
}

impl Deadline {
    pub fn after(kind: DeadlineKind, duration: Duration) -> Self {
        Self {
            kind,
            sleep: Box::pin(sleep(duration)),
        }
    }

    pub async fn expired(&mut self) -> DeadlineKind {
        self.sleep.as_mut().await;
        self.kind
    }
}

/// One call attempt, caller or callee side.
pub struct CallSession {
    pub local_id: PeerId,
    pub remote_id: Option<PeerId>,
    pub role: Role,
    state: CallState,
    pub transport: Arc<dyn SessionTransport>,
    pub deadline: Option<Deadline>,
    /// Description published to the remote side, once created.
    pub local_description: Option<SessionDescription>,
    /// Distinguishes this session's transport callbacks from earlier ones.
    pub generation: u64,
    /// Peers that rejected this attempt.
    pub declined: HashSet<PeerId>,
    /// Set once presence was switched to in-call for this session.
    pub marked_in_call: bool,
}

impl CallSession {
    pub fn new(
        local_id: PeerId,
        role: Role,
        transport: Arc<dyn SessionTransport>,
        generation: u64,
    ) -> Self {
        Self {
            local_id,
            remote_id: None,
            role,
            state: CallState::Idle,
            transport,
            deadline: None,
            local_description: None,
            generation,
            declined: HashSet::new(),
            marked_in_call: false,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn transition(&mut self, next: CallState) -> Result<CallState, InvalidTransition> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.state = next;
        if next.is_terminal() {
            self.deadline = None;
        }
        Ok(from)
    }

    pub fn arm(&mut self, kind: DeadlineKind, duration: Duration) {
        self.deadline = Some(Deadline::after(kind, duration));
    }

    pub fn cancel_deadline(&mut self) -> Option<DeadlineKind> {
        self.deadline.take().map(|d| d.kind)
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Whether the remote side has (or may have) an offer of ours or a live call.
    pub fn remote_engaged(&self) -> bool {
        self.remote_id.is_some()
            && matches!(
                self.state,
                CallState::AwaitingAnswer | CallState::Connected | CallState::NegotiatingRemote
            )
    }
}
