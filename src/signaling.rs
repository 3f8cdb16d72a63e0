//! Signaling messages and the per-participant mailbox.
//!
//! Every message gets its own directory key, `calls/<recipient>/<sender>/<seq>`,
//! so nothing is overwritten before the recipient reads it. The recipient
//! removes each key once consumed.
//!
//! Payloads keep the plain JSON shapes other clients already write:
//! `{"from": .., "offer": ..}` and `{"answer": ..}`, where the description is
//! itself JSON text.

use crate::directory::{SharedDirectory, Subscription};
use crate::error::SignalingError;
use crate::peer::transport::{SdpKind, SessionDescription};
use crate::peer::types::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub const CALLS_NODE: &str = "calls/";

pub fn mailbox_prefix(owner: &PeerId) -> String {
    format!("{CALLS_NODE}{owner}/")
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RejectReason {
    /// The callee already has a session.
    Busy,
    /// The callee could not negotiate the offer.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Offer,
    Answer,
    Cancel,
    Reject,
}

impl MessageKind {
    const ALL: [MessageKind; 4] = [
        MessageKind::Offer,
        MessageKind::Answer,
        MessageKind::Cancel,
        MessageKind::Reject,
    ];

    /// Field that marks this kind on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Cancel => "cancel",
            MessageKind::Reject => "reject",
        }
    }
}

/// A mailbox entry that failed to decode, with whatever the envelope still tells.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct MalformedMessage {
    pub from: Option<PeerId>,
    pub kind: Option<MessageKind>,
    #[source]
    pub error: SignalingError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Offer {
        from: PeerId,
        sdp: SessionDescription,
    },
    Answer {
        from: Option<PeerId>,
        sdp: SessionDescription,
    },
    /// Withdraws an offer or ends a connected call.
    Cancel { from: PeerId },
    Reject { from: PeerId, reason: RejectReason },
}

impl SignalingMessage {
    pub fn sender(&self) -> Option<&PeerId> {
        match self {
            SignalingMessage::Offer { from, .. }
            | SignalingMessage::Cancel { from }
            | SignalingMessage::Reject { from, .. } => Some(from),
            SignalingMessage::Answer { from, .. } => from.as_ref(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            SignalingMessage::Offer { .. } => MessageKind::Offer,
            SignalingMessage::Answer { .. } => MessageKind::Answer,
            SignalingMessage::Cancel { .. } => MessageKind::Cancel,
            SignalingMessage::Reject { .. } => MessageKind::Reject,
        }
    }

    pub fn to_value(&self) -> Value {
        let wire = match self {
            SignalingMessage::Offer { from, sdp } => WireMessage::Offer {
                from: from.clone(),
                offer: description_text(sdp),
            },
            SignalingMessage::Answer { from, sdp } => WireMessage::Answer {
                answer: description_text(sdp),
                from: from.clone(),
            },
            SignalingMessage::Cancel { from } => WireMessage::Cancel {
                from: from.clone(),
                cancel: true,
            },
            SignalingMessage::Reject { from, reason } => WireMessage::Reject {
                from: from.clone(),
                reject: *reason,
            },
        };
        // plain structs of strings and enums always serialize
        serde_json::to_value(wire).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> Result<Self, MalformedMessage> {
        let (from, kind) = envelope(&value);
        Self::decode(value).map_err(|error| MalformedMessage { from, kind, error })
    }

    fn decode(value: Value) -> Result<Self, SignalingError> {
        let wire: WireMessage =
            serde_json::from_value(value).map_err(SignalingError::UnknownPayload)?;
        Ok(match wire {
            WireMessage::Offer { from, offer } => SignalingMessage::Offer {
                from,
                sdp: parse_description(&offer, SdpKind::Offer)?,
            },
            WireMessage::Answer { answer, from } => SignalingMessage::Answer {
                from,
                sdp: parse_description(&answer, SdpKind::Answer)?,
            },
            WireMessage::Cancel { from, .. } => SignalingMessage::Cancel { from },
            WireMessage::Reject { from, reject } => SignalingMessage::Reject {
                from,
                reason: reject,
            },
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WireMessage {
    Offer {
        from: PeerId,
        offer: String,
    },
    Answer {
        answer: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
    },
    Cancel {
        from: PeerId,
        cancel: bool,
    },
    Reject {
        from: PeerId,
        reject: RejectReason,
    },
}

/// Sender and kind read loosely from a payload, for reporting failures.
fn envelope(value: &Value) -> (Option<PeerId>, Option<MessageKind>) {
    let from = value.get("from").and_then(Value::as_str).map(PeerId::from);
    let kind = MessageKind::ALL
        .into_iter()
        .find(|kind| value.get(kind.as_str()).is_some());
    (from, kind)
}

fn description_text(desc: &SessionDescription) -> String {
    serde_json::to_string(desc).unwrap_or_default()
}

fn parse_description(text: &str, expected: SdpKind) -> Result<SessionDescription, SignalingError> {
    let desc: SessionDescription =
        serde_json::from_str(text).map_err(SignalingError::BadDescription)?;
    if desc.kind != expected {
        return Err(SignalingError::WrongDescriptionType {
            expected: expected.as_str(),
            actual: desc.kind.as_str(),
        });
    }
    Ok(desc)
}

static LAST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Mailbox key suffix: wall-clock microseconds, strictly increasing within the process.
fn next_seq() -> u64 {
    let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
    let prev = LAST_SEQ
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(now);
    now.max(prev + 1)
}

/// Writes messages into other participants' mailboxes.
pub struct MailboxSender {
    directory: Arc<dyn SharedDirectory>,
    owner: PeerId,
}

impl MailboxSender {
    pub fn new(directory: Arc<dyn SharedDirectory>, owner: PeerId) -> Self {
        Self { directory, owner }
    }

    /// Best-effort delivery; the directory gives no acknowledgement.
    pub async fn send(&self, to: &PeerId, message: &SignalingMessage) {
        let seq = next_seq();
        let key = format!("{}{}/{seq:020}", mailbox_prefix(to), self.owner);
        debug!("mailbox {} -> {to}: {}", self.owner, message.kind().as_str());
        self.directory.put(&key, Some(message.to_value())).await;
    }
}

/// Consumes the local participant's mailbox.
pub struct Mailbox {
    directory: Arc<dyn SharedDirectory>,
    changes: Subscription,
    seen: HashSet<String>,
}

impl Mailbox {
    pub async fn open(directory: Arc<dyn SharedDirectory>, owner: &PeerId) -> Self {
        let changes = directory.subscribe(&mailbox_prefix(owner)).await;
        Self {
            directory,
            changes,
            seen: HashSet::new(),
        }
    }

    /// Next delivered message, removed from the directory once read.
    /// Returns `None` when the directory subscription ends. Not cancel safe:
    /// a message taken off the subscription is lost if the future is dropped.
    pub async fn recv(&mut self) -> Option<Result<SignalingMessage, MalformedMessage>> {
        loop {
            let change = self.changes.recv().await?;
            if let Some(message) = self.consume(change.key, change.value).await {
                return Some(message);
            }
        }
    }

    async fn consume(
        &mut self,
        key: String,
        value: Option<Value>,
    ) -> Option<Result<SignalingMessage, MalformedMessage>> {
        let Some(value) = value else {
            // our own tombstone, the key cannot come back
            self.seen.remove(&key);
            return None;
        };
        if !self.seen.insert(key.clone()) {
            trace!("mailbox redelivered {key}, skipping");
            return None;
        }
        self.directory.put(&key, None).await;

        let message = SignalingMessage::from_value(value);
        if let Err(e) = &message {
            warn!("unreadable mailbox entry {key}: {e}");
        }
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use serde_json::json;

    #[test]
    fn offer_wire_shape() {
        let msg = SignalingMessage::Offer {
            from: "peer-aaa".into(),
            sdp: SessionDescription::offer("X"),
        };
        assert_eq!(
            msg.to_value(),
            json!({"from": "peer-aaa", "offer": r#"{"type":"offer","sdp":"X"}"#})
        );
    }

    #[test]
    fn answer_without_sender_still_decodes() {
        let value = json!({"answer": r#"{"type":"answer","sdp":"Y"}"#});
        assert_eq!(
            SignalingMessage::from_value(value).unwrap(),
            SignalingMessage::Answer {
                from: None,
                sdp: SessionDescription::answer("Y")
            }
        );
    }

    #[test]
    fn cancel_and_reject_decode() {
        assert_eq!(
            SignalingMessage::from_value(json!({"from": "peer-a", "cancel": true})).unwrap(),
            SignalingMessage::Cancel { from: "peer-a".into() }
        );
        assert_eq!(
            SignalingMessage::from_value(json!({"from": "peer-b", "reject": "busy"})).unwrap(),
            SignalingMessage::Reject {
                from: "peer-b".into(),
                reason: RejectReason::Busy
            }
        );
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert!(matches!(
            SignalingMessage::from_value(json!({"hello": 1})),
            Err(MalformedMessage {
                from: None,
                kind: None,
                error: SignalingError::UnknownPayload(_),
            })
        ));
        assert!(matches!(
            SignalingMessage::from_value(json!({"from": "peer-a", "offer": "not json"})),
            Err(MalformedMessage {
                kind: Some(MessageKind::Offer),
                error: SignalingError::BadDescription(_),
                ..
            })
        ));
        assert!(matches!(
            SignalingMessage::from_value(
                json!({"from": "peer-a", "offer": r#"{"type":"answer","sdp":"Y"}"#})
            ),
            Err(MalformedMessage {
                error: SignalingError::WrongDescriptionType { .. },
                ..
            })
        ));
    }

    #[test]
    fn malformed_payload_keeps_its_envelope() {
        let bad = SignalingMessage::from_value(json!({"from": "peer-c", "offer": 42})).unwrap_err();
        assert_eq!(bad.from, Some(PeerId::from("peer-c")));
        assert_eq!(bad.kind, Some(MessageKind::Offer));
        assert!(matches!(bad.error, SignalingError::UnknownPayload(_)));

        let bad = SignalingMessage::from_value(json!({"answer": "{oops"})).unwrap_err();
        assert_eq!(bad.from, None);
        assert_eq!(bad.kind, Some(MessageKind::Answer));
    }

    #[tokio::test]
    async fn offer_arrives_unchanged_and_is_removed() {
        let dir = Arc::new(MemoryDirectory::new());
        let bob = PeerId::from("peer-bbb");
        let mut inbox = Mailbox::open(dir.clone(), &bob).await;
        let alice = MailboxSender::new(dir.clone(), "peer-aaa".into());

        let sent = SignalingMessage::Offer {
            from: "peer-aaa".into(),
            sdp: SessionDescription::offer("v=0 X"),
        };
        alice.send(&bob, &sent).await;

        assert_eq!(inbox.recv().await.unwrap().unwrap(), sent);
        assert!(dir.scan(&mailbox_prefix(&bob)).await.is_empty());
    }

    #[tokio::test]
    async fn consumed_keys_are_forgotten_after_their_tombstone() {
        let dir = Arc::new(MemoryDirectory::new());
        let bob = PeerId::from("peer-bbb");
        let mut inbox = Mailbox::open(dir.clone(), &bob).await;
        let alice = MailboxSender::new(dir.clone(), "peer-aaa".into());

        for _ in 0..3 {
            alice
                .send(&bob, &SignalingMessage::Cancel { from: "peer-aaa".into() })
                .await;
            inbox.recv().await.unwrap().unwrap();
        }
        // drain the pending tombstone notifications
        let idle = tokio::time::timeout(std::time::Duration::from_millis(50), inbox.recv()).await;
        assert!(idle.is_err());
        assert!(inbox.seen.is_empty());
    }

    #[tokio::test]
    async fn back_to_back_messages_are_not_lost() {
        let dir = Arc::new(MemoryDirectory::new());
        let bob = PeerId::from("peer-bbb");
        let alice = MailboxSender::new(dir.clone(), "peer-aaa".into());
        let carol = MailboxSender::new(dir.clone(), "peer-ccc".into());

        // written before bob starts listening
        alice
            .send(&bob, &SignalingMessage::Offer {
                from: "peer-aaa".into(),
                sdp: SessionDescription::offer("A"),
            })
            .await;
        alice
            .send(&bob, &SignalingMessage::Cancel { from: "peer-aaa".into() })
            .await;

        let mut inbox = Mailbox::open(dir.clone(), &bob).await;
        carol
            .send(&bob, &SignalingMessage::Offer {
                from: "peer-ccc".into(),
                sdp: SessionDescription::offer("C"),
            })
            .await;

        let mut senders = Vec::new();
        for _ in 0..3 {
            let msg = inbox.recv().await.unwrap().unwrap();
            senders.push((msg.sender().cloned().unwrap(), msg.kind()));
        }
        assert_eq!(
            senders,
            vec![
                (PeerId::from("peer-aaa"), MessageKind::Offer),
                (PeerId::from("peer-aaa"), MessageKind::Cancel),
                (PeerId::from("peer-ccc"), MessageKind::Offer),
            ]
        );
        let idle = tokio::time::timeout(std::time::Duration::from_millis(50), inbox.recv()).await;
        assert!(idle.is_err());
    }

    #[test]
    fn sequence_never_repeats() {
        let mut last = next_seq();
        for _ in 0..1000 {
            let seq = next_seq();
            assert!(seq > last);
            last = seq;
        }
    }
}
