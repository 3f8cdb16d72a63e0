#![allow(dead_code)]

use async_trait::async_trait;
use meshcall_lib::directory::{DirectoryChange, SharedDirectory, Subscription};
use meshcall_lib::error::TransportError;
use meshcall_lib::peer::transport::RemoteTrackHandler;
use meshcall_lib::peer::{
    PeerId, PeerRecord, PeerStatus, RemoteTrack, SessionDescription, SessionTransport,
    TransportFactory,
};
use meshcall_lib::presence::presence_key;
use meshcall_lib::selector::PeerSelector;
use meshcall_lib::signaling::{mailbox_prefix, MailboxSender, SignalingMessage};
use meshcall_lib::{CallConfig, CallEvent, CallState, MemoryDirectory, Participant, ParticipantHandle};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// sdp text the fake transport refuses as a remote description
pub const REJECTED_SDP: &str = "reject-me";
/// sdp text the fake transport reports as unparseable
pub const GARBAGE_SDP: &str = "garbage";

pub struct FakeTransport {
    pub index: usize,
    pub remote: Mutex<Option<SessionDescription>>,
    pub local: Mutex<Option<SessionDescription>>,
    pub closed: AtomicBool,
    handler: Mutex<Option<RemoteTrackHandler>>,
}

impl FakeTransport {
    fn new(index: usize) -> Self {
        Self {
            index,
            remote: Mutex::new(None),
            local: Mutex::new(None),
            closed: AtomicBool::new(false),
            handler: Mutex::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote(&self) -> Option<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    pub fn emit_track(&self, track: RemoteTrack) {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler(track);
        }
    }
}

#[async_trait]
impl SessionTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        Ok(SessionDescription::offer(format!("offer-{}", self.index)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.remote().is_none() {
            return Err(TransportError::Rejected("no remote offer".into()));
        }
        Ok(SessionDescription::answer("Y"))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> Result<SessionDescription, TransportError> {
        *self.local.lock().unwrap() = Some(desc.clone());
        Ok(desc)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        match desc.sdp.as_str() {
            REJECTED_SDP => Err(TransportError::Rejected("refused".into())),
            GARBAGE_SDP => Err(TransportError::InvalidDescription("bad sdp".into())),
            _ => {
                *self.remote.lock().unwrap() = Some(desc);
                Ok(())
            }
        }
    }

    fn on_remote_track(&self, handler: RemoteTrackHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    pub created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last(&self) -> Arc<FakeTransport> {
        self.created.lock().unwrap().last().cloned().expect("no transport created")
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(&self) -> Result<Arc<dyn SessionTransport>, TransportError> {
        let mut created = self.created.lock().unwrap();
        let transport = Arc::new(FakeTransport::new(created.len()));
        created.push(transport.clone());
        Ok(transport)
    }
}

/// Directory wrapper counting writes per key.
#[derive(Clone, Default)]
pub struct CountingDirectory {
    pub inner: MemoryDirectory,
    puts: Arc<Mutex<Vec<String>>>,
    pub writes: Arc<AtomicUsize>,
}

impl CountingDirectory {
    pub fn puts_to(&self, key: &str) -> usize {
        self.puts.lock().unwrap().iter().filter(|k| *k == key).count()
    }
}

#[async_trait]
impl SharedDirectory for CountingDirectory {
    async fn put(&self, key: &str, value: Option<Value>) {
        self.puts.lock().unwrap().push(key.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> Option<Value> {
        self.inner.get(key).await
    }

    async fn scan(&self, prefix: &str) -> Vec<(String, Value)> {
        self.inner.scan(prefix).await
    }

    async fn subscribe(&self, prefix: &str) -> Subscription {
        self.inner.subscribe(prefix).await
    }
}

pub fn test_config() -> CallConfig {
    CallConfig {
        ice_servers: vec![],
        ..CallConfig::default()
    }
}

pub async fn spawn_peer(
    id: &str,
    directory: &Arc<MemoryDirectory>,
    factory: &Arc<FakeFactory>,
) -> ParticipantHandle {
    spawn_peer_with(id, test_config(), directory, factory).await
}

pub async fn spawn_peer_with(
    id: &str,
    config: CallConfig,
    directory: &Arc<MemoryDirectory>,
    factory: &Arc<FakeFactory>,
) -> ParticipantHandle {
    let selector = PeerSelector::with_seed(directory.clone(), config.stale_after, 1);
    Participant::spawn_with_selector(
        PeerId::from(id),
        config,
        directory.clone(),
        factory.clone(),
        selector,
    )
    .await
}

/// Writes a presence record for `id` as if it was registered `age` ago.
pub async fn seed_presence(dir: &MemoryDirectory, id: &str, status: PeerStatus, age: Duration) {
    let mut record = PeerRecord::new(PeerId::from(id), status);
    record.last_seen -= chrono::TimeDelta::from_std(age).unwrap();
    dir.put(
        &presence_key(&record.id),
        Some(serde_json::to_value(&record).unwrap()),
    )
    .await;
}

pub async fn presence_of(dir: &MemoryDirectory, id: &str) -> Option<PeerRecord> {
    dir.get(&presence_key(&PeerId::from(id)))
        .await
        .map(|v| serde_json::from_value(v).unwrap())
}

/// Delivers `message` into `to`'s mailbox as if written by `from`.
pub async fn deliver(dir: &Arc<MemoryDirectory>, from: &str, to: &str, message: SignalingMessage) {
    MailboxSender::new(dir.clone(), PeerId::from(from))
        .send(&PeerId::from(to), &message)
        .await;
}

/// Watches `id`'s mailbox without consuming it.
pub async fn tap_mailbox(dir: &MemoryDirectory, id: &str) -> Subscription {
    dir.subscribe(&mailbox_prefix(&PeerId::from(id))).await
}

/// Next message written to a tapped mailbox, skipping removals.
pub async fn next_written(tap: &mut Subscription) -> SignalingMessage {
    loop {
        let DirectoryChange { value, .. } = tokio::time::timeout(Duration::from_secs(300), tap.recv())
            .await
            .expect("no mailbox write")
            .expect("tap closed");
        if let Some(value) = value {
            return SignalingMessage::from_value(value).expect("undecodable mailbox write");
        }
    }
}

/// Whether a tapped mailbox has seen any write so far.
pub fn nothing_written(tap: &mut Subscription) -> bool {
    while let Ok(change) = tap.try_recv() {
        if change.value.is_some() {
            return false;
        }
    }
    true
}

pub async fn wait_state(handle: &ParticipantHandle, state: CallState) {
    let mut watch = handle.watch_state();
    tokio::time::timeout(Duration::from_secs(300), watch.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("{} never reached {state}, now {}", handle.id(), handle.state()))
        .expect("participant stopped");
}

pub fn drain(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

pub fn reached(events: &[CallEvent], state: CallState) -> bool {
    events
        .iter()
        .any(|e| matches!(e, CallEvent::StateChanged { to, .. } if *to == state))
}
