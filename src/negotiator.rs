//! Per-participant event loop driving the offer/answer exchange.
//!
//! A [`Participant`] runs on its own task and owns the presence record, the
//! mailbox and at most one [`CallSession`]. Commands, mailbox deliveries, the
//! session deadline and transport callbacks are all handled from a single
//! `select!`, so handlers never interleave.

use crate::config::CallConfig;
use crate::directory::SharedDirectory;
use crate::error::{CallError, CallFailure, TransportError};
use crate::peer::transport::{SessionDescription, SessionTransport, TransportFactory};
use crate::peer::types::{PeerId, PeerStatus, RemoteTrack};
use crate::presence::PresenceRegistrar;
use crate::selector::PeerSelector;
use crate::session::{CallSession, CallState, DeadlineKind, Role};
use crate::signaling::{
    MalformedMessage, Mailbox, MailboxSender, MessageKind, RejectReason, SignalingMessage,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval};
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

/// Notifications published to the application layer.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    StateChanged {
        role: Role,
        remote: Option<PeerId>,
        from: CallState,
        to: CallState,
    },
    /// The session ended in `FAILED` or `FAILED_NO_PEER`.
    Failed {
        remote: Option<PeerId>,
        reason: CallFailure,
    },
    RemoteMediaAvailable {
        remote: Option<PeerId>,
        track: RemoteTrack,
    },
}

enum Command {
    StartCall(oneshot::Sender<Result<(), CallError>>),
    HangUp(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

type Inbound = Result<SignalingMessage, MalformedMessage>;

/// Application-side handle to a running participant.
#[derive(Clone)]
pub struct ParticipantHandle {
    id: PeerId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CallEvent>,
    state: watch::Receiver<CallState>,
}

impl ParticipantHandle {
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Creates the local offer and arms the selection deadline. Returns once
    /// the session is waiting for a peer, or has already failed.
    pub async fn start_call(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::StartCall(tx)).await?;
        rx.await.map_err(|_| CallError::ParticipantStopped)?
    }

    /// Ends the current session, if any, notifying the remote side.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::HangUp(tx)).await?;
        rx.await.map_err(|_| CallError::ParticipantStopped)
    }

    /// Hangs up, removes the presence record and stops the event loop.
    pub async fn shutdown(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx)).await?;
        rx.await.map_err(|_| CallError::ParticipantStopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.clone()
    }

    async fn send(&self, command: Command) -> Result<(), CallError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CallError::ParticipantStopped)
    }
}

pub struct Participant {
    id: PeerId,
    config: CallConfig,
    registrar: PresenceRegistrar,
    selector: PeerSelector,
    outbox: MailboxSender,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    mailbox_task: JoinHandle<()>,
    backlog: VecDeque<Inbound>,
    transports: Arc<dyn TransportFactory>,
    session: Option<CallSession>,
    generation: u64,
    media_tx: mpsc::UnboundedSender<(u64, RemoteTrack)>,
    events: broadcast::Sender<CallEvent>,
    state_tx: watch::Sender<CallState>,
}

impl Participant {
    /// Registers `id` as available, starts listening for offers and returns a handle.
    pub async fn spawn(
        id: PeerId,
        config: CallConfig,
        directory: Arc<dyn SharedDirectory>,
        transports: Arc<dyn TransportFactory>,
    ) -> ParticipantHandle {
        let selector = PeerSelector::new(directory.clone(), config.stale_after);
        Self::spawn_with_selector(id, config, directory, transports, selector).await
    }

    /// Same as [`spawn`](Self::spawn) with a caller-provided (e.g. seeded) selector.
    pub async fn spawn_with_selector(
        id: PeerId,
        config: CallConfig,
        directory: Arc<dyn SharedDirectory>,
        transports: Arc<dyn TransportFactory>,
        selector: PeerSelector,
    ) -> ParticipantHandle {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, state_rx) = watch::channel(CallState::Idle);

        let registrar = PresenceRegistrar::new(directory.clone());
        registrar.register(&id).await;
        let inbox = Mailbox::open(directory.clone(), &id).await;
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let mailbox_task = tokio::spawn(forward_mailbox(inbox, inbound_tx));
        info!("participant {id} registered and listening");

        let participant = Participant {
            id: id.clone(),
            config,
            registrar,
            selector,
            outbox: MailboxSender::new(directory, id.clone()),
            inbound,
            mailbox_task,
            backlog: VecDeque::new(),
            transports,
            session: None,
            generation: 0,
            media_tx,
            events: events.clone(),
            state_tx,
        };
        tokio::spawn(participant.run(commands_rx, media_rx));

        ParticipantHandle {
            id,
            commands: commands_tx,
            events,
            state: state_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut media: mpsc::UnboundedReceiver<(u64, RemoteTrack)>,
    ) {
        let mut heartbeat = self
            .config
            .heartbeat_interval
            .map(|period| interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                // mailbox events win over an expiring deadline in the same poll
                biased;

                command = commands.recv() => match command {
                    Some(Command::StartCall(reply)) => {
                        let result = self.start_call().await;
                        let _ = reply.send(result);
                    }
                    Some(Command::HangUp(reply)) => {
                        self.hang_up().await;
                        let _ = reply.send(());
                    }
                    Some(Command::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                inbound = next_inbound(&mut self.backlog, &mut self.inbound) => match inbound {
                    Some(message) => self.on_message(message).await,
                    None => {
                        error!("mailbox subscription for {} ended", self.id);
                        self.shutdown().await;
                        break;
                    }
                },
                Some((generation, track)) = media.recv() => self.on_remote_track(generation, track),
                kind = deadline_expired(&mut self.session) => self.on_deadline(kind).await,
                _ = tick(&mut heartbeat) => self.heartbeat().await,
            }
        }
        debug!("participant {} stopped", self.id);
    }

    // ---------- caller side ----------

    async fn start_call(&mut self) -> Result<(), CallError> {
        if let Some(session) = self.active_session() {
            warn!("{}: start_call rejected, session is {}", self.id, session.state());
            return Err(CallError::SessionBusy(session.state()));
        }

        let transport = self.transports.create().await?;
        self.open_session(Role::Caller, transport.clone());
        self.transition(CallState::NegotiatingLocal);

        let offer = match local_offer(transport.as_ref()).await {
            Ok(offer) => offer,
            Err(e) => {
                self.abort(e.into_failure(), None).await;
                return Ok(());
            }
        };

        let deadline = self.config.selection_deadline;
        if let Some(session) = self.session.as_mut() {
            session.local_description = Some(offer);
            session.arm(DeadlineKind::Selection, deadline);
        }
        self.transition(CallState::AwaitingPeer);
        info!("{}: offer ready, selecting a peer in {:?}", self.id, deadline);
        Ok(())
    }

    async fn on_deadline(&mut self, kind: DeadlineKind) {
        if let Some(session) = self.session.as_mut() {
            session.cancel_deadline();
        }
        match kind {
            DeadlineKind::Selection => self.dispatch_offer().await,
            DeadlineKind::Answer => {
                warn!("{}: no answer before timeout", self.id);
                self.notify_remote_cancel().await;
                self.finish(CallState::Failed, Some(CallFailure::AnswerTimeout))
                    .await;
            }
        }
    }

    /// Picks a candidate (skipping peers that already declined) and mails the offer.
    async fn dispatch_offer(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let excluded = session.declined.clone();
        let Some(offer) = session.local_description.clone() else {
            return;
        };

        let Some(peer) = self
            .selector
            .find_candidate_excluding(&self.id, &excluded)
            .await
        else {
            info!("{}: no eligible peer to call", self.id);
            self.finish(
                CallState::FailedNoPeer,
                Some(CallFailure::NoCandidateAvailable),
            )
            .await;
            return;
        };

        info!("{}: sending offer to {peer}", self.id);
        let message = SignalingMessage::Offer {
            from: self.id.clone(),
            sdp: offer,
        };
        self.outbox.send(&peer, &message).await;

        let answer_timeout = self.config.answer_timeout;
        let awaiting_peer = self
            .session
            .as_ref()
            .is_some_and(|s| s.state() == CallState::AwaitingPeer);
        if let Some(session) = self.session.as_mut() {
            session.remote_id = Some(peer);
            if let Some(timeout) = answer_timeout {
                session.arm(DeadlineKind::Answer, timeout);
            }
        }
        if awaiting_peer {
            self.transition(CallState::AwaitingAnswer);
        }
    }

    async fn on_answer(&mut self, from: Option<PeerId>, sdp: SessionDescription) {
        let Some(session) = self.active_session() else {
            debug!("{}: answer with no active session, ignoring", self.id);
            return;
        };
        let state = session.state();
        if session.role != Role::Caller
            || !matches!(state, CallState::AwaitingPeer | CallState::AwaitingAnswer)
        {
            warn!("{}: unexpected answer while {state}, ignoring", self.id);
            return;
        }
        if let (Some(from), Some(remote)) = (&from, &session.remote_id) {
            if from != remote {
                warn!("{}: answer from {from} but offer went to {remote}, ignoring", self.id);
                return;
            }
        }
        if state == CallState::AwaitingPeer {
            info!("{}: answer arrived before the selection deadline", self.id);
        }

        let transport = session.transport.clone();
        if let Some(session) = self.session.as_mut() {
            // must happen before the remote description is applied
            session.cancel_deadline();
            if session.remote_id.is_none() {
                session.remote_id = from;
            }
        }

        if let Err(e) = transport.set_remote_description(sdp).await {
            self.abort(e.into_failure(), None).await;
            return;
        }
        self.enter_call().await;
    }

    async fn on_reject(&mut self, from: PeerId, reason: RejectReason) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.role != Role::Caller
            || session.state() != CallState::AwaitingAnswer
            || session.remote_id.as_ref() != Some(&from)
        {
            debug!("{}: stale reject from {from}, ignoring", self.id);
            return;
        }
        info!("{}: {from} declined ({reason:?}), trying another peer", self.id);
        session.cancel_deadline();
        session.remote_id = None;
        session.declined.insert(from);
        self.dispatch_offer().await;
    }

    // ---------- callee side ----------

    async fn on_offer(&mut self, from: PeerId, sdp: SessionDescription) {
        if from == self.id {
            return;
        }
        if let Some(session) = self.active_session() {
            let glare = session.role == Role::Caller
                && session.state() == CallState::AwaitingAnswer
                && session.remote_id.as_ref() == Some(&from);
            if !glare {
                info!("{}: busy ({}), rejecting offer from {from}", self.id, session.state());
                self.reply_reject(&from, RejectReason::Busy).await;
                return;
            }
            if self.id > from {
                debug!("{}: crossed offers with {from}, keeping ours", self.id);
                return;
            }
            info!("{}: crossed offers with {from}, answering theirs", self.id);
            self.finish(CallState::Closed, None).await;
        }
        self.accept_offer(from, sdp).await;
    }

    async fn accept_offer(&mut self, from: PeerId, sdp: SessionDescription) {
        let transport = match self.transports.create().await {
            Ok(t) => t,
            Err(e) => {
                error!("{}: cannot create transport for {from}: {e}", self.id);
                self.reply_reject(&from, RejectReason::Failed).await;
                let _ = self.events.send(CallEvent::Failed {
                    remote: Some(from),
                    reason: e.into_failure(),
                });
                return;
            }
        };
        self.open_session(Role::Callee, transport.clone());
        if let Some(session) = self.session.as_mut() {
            session.remote_id = Some(from.clone());
        }
        self.transition(CallState::NegotiatingRemote);

        let answer = match remote_answer(transport.as_ref(), sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                self.abort(e.into_failure(), Some(RejectReason::Failed)).await;
                return;
            }
        };

        if self.offer_withdrawn(&from).await {
            info!("{}: {from} cancelled before we answered", self.id);
            self.finish(CallState::Closed, None).await;
            return;
        }

        let message = SignalingMessage::Answer {
            from: Some(self.id.clone()),
            sdp: answer.clone(),
        };
        self.outbox.send(&from, &message).await;
        if let Some(session) = self.session.as_mut() {
            session.local_description = Some(answer);
        }
        self.enter_call().await;
    }

    /// Pulls whatever already sits in the mailbox and reports whether it holds
    /// a cancel from `from`. Everything else is kept for the main loop.
    async fn offer_withdrawn(&mut self, from: &PeerId) -> bool {
        // let the mailbox forwarder catch up with anything already delivered
        tokio::task::yield_now().await;
        while let Ok(message) = self.inbound.try_recv() {
            self.backlog.push_back(message);
        }
        let position = self.backlog.iter().position(
            |m| matches!(m, Ok(SignalingMessage::Cancel { from: sender }) if sender == from),
        );
        match position {
            Some(i) => {
                self.backlog.remove(i);
                true
            }
            None => false,
        }
    }

    // ---------- shared ----------

    async fn on_message(&mut self, inbound: Inbound) {
        let message = match inbound {
            Ok(message) => message,
            Err(bad) => return self.on_malformed(bad).await,
        };
        match message {
            SignalingMessage::Offer { from, sdp } => self.on_offer(from, sdp).await,
            SignalingMessage::Answer { from, sdp } => self.on_answer(from, sdp).await,
            SignalingMessage::Cancel { from } => self.on_cancel(from).await,
            SignalingMessage::Reject { from, reason } => self.on_reject(from, reason).await,
        }
    }

    /// Routes an undecodable entry to whoever it concerns, as its well-formed
    /// counterpart would have been.
    async fn on_malformed(&mut self, bad: MalformedMessage) {
        let MalformedMessage { from, kind, error } = bad;
        let failure = CallFailure::from(error);
        match (kind, from) {
            (Some(MessageKind::Offer), Some(from)) if from != self.id => {
                if self.active_session().is_some() {
                    info!("{}: busy, rejecting malformed offer from {from}", self.id);
                    self.reply_reject(&from, RejectReason::Busy).await;
                } else {
                    warn!("{}: unusable offer from {from}: {failure}", self.id);
                    self.reply_reject(&from, RejectReason::Failed).await;
                    let _ = self.events.send(CallEvent::Failed {
                        remote: Some(from),
                        reason: failure,
                    });
                }
            }
            (Some(MessageKind::Answer), from) if self.would_accept_answer(from.as_ref()) => {
                self.abort(failure, None).await;
            }
            (Some(MessageKind::Cancel), Some(from)) if self.is_current_remote(&from) => {
                self.abort(failure, None).await;
            }
            (_, from) => {
                let from = from.map_or_else(|| "unknown sender".to_string(), |f| f.to_string());
                warn!("{}: dropping malformed message from {from}: {failure}", self.id);
            }
        }
    }

    /// Whether an answer from `from` would be applied to the current session.
    fn would_accept_answer(&self, from: Option<&PeerId>) -> bool {
        self.active_session().is_some_and(|s| {
            s.role == Role::Caller
                && matches!(s.state(), CallState::AwaitingPeer | CallState::AwaitingAnswer)
                && match (from, s.remote_id.as_ref()) {
                    (Some(from), Some(remote)) => from == remote,
                    _ => true,
                }
        })
    }

    fn is_current_remote(&self, from: &PeerId) -> bool {
        self.active_session()
            .is_some_and(|s| s.remote_id.as_ref() == Some(from))
    }

    async fn on_cancel(&mut self, from: PeerId) {
        if !self.is_current_remote(&from) {
            debug!("{}: cancel from {from} does not match a session, ignoring", self.id);
            return;
        }
        info!("{}: {from} ended the call", self.id);
        self.finish(CallState::Closed, None).await;
    }

    fn on_remote_track(&mut self, generation: u64, track: RemoteTrack) {
        let Some(session) = self.active_session() else {
            return;
        };
        if session.generation != generation {
            return;
        }
        let _ = self.events.send(CallEvent::RemoteMediaAvailable {
            remote: session.remote_id.clone(),
            track,
        });
    }

    async fn hang_up(&mut self) {
        if self.active_session().is_none() {
            return;
        }
        self.notify_remote_cancel().await;
        self.finish(CallState::Closed, None).await;
    }

    async fn shutdown(&mut self) {
        self.hang_up().await;
        self.registrar.deregister(&self.id).await;
        self.mailbox_task.abort();
        info!("participant {} shut down", self.id);
    }

    async fn heartbeat(&mut self) {
        let status = match self.active_session() {
            Some(s) if s.marked_in_call => PeerStatus::InCall,
            _ => PeerStatus::Available,
        };
        self.registrar.refresh(&self.id, status).await;
    }

    fn active_session(&self) -> Option<&CallSession> {
        self.session.as_ref().filter(|s| s.is_active())
    }

    fn open_session(&mut self, role: Role, transport: Arc<dyn SessionTransport>) {
        self.generation += 1;
        let generation = self.generation;
        let media_tx = self.media_tx.clone();
        transport.on_remote_track(Box::new(move |track| {
            let _ = media_tx.send((generation, track));
        }));
        self.session = Some(CallSession::new(self.id.clone(), role, transport, generation));
    }

    fn transition(&mut self, next: CallState) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        match session.transition(next) {
            Ok(from) => {
                info!("{}: {from} -> {next}", self.id);
                self.state_tx.send_replace(next);
                let _ = self.events.send(CallEvent::StateChanged {
                    role: session.role,
                    remote: session.remote_id.clone(),
                    from,
                    to: next,
                });
                true
            }
            Err(e) => {
                warn!("{}: {e}", self.id);
                false
            }
        }
    }

    async fn enter_call(&mut self) {
        self.registrar.mark_in_call(&self.id).await;
        if let Some(session) = self.session.as_mut() {
            session.marked_in_call = true;
        }
        self.transition(CallState::Connected);
    }

    /// Fails the session; the callee side also tells the offerer when `reject` is set.
    async fn abort(&mut self, failure: CallFailure, reject: Option<RejectReason>) {
        error!("{}: call aborted: {failure}", self.id);
        if let Some(reason) = reject {
            if let Some(remote) = self.active_session().and_then(|s| s.remote_id.clone()) {
                self.reply_reject(&remote, reason).await;
            }
        }
        self.finish(CallState::Failed, Some(failure)).await;
    }

    /// Moves the session into `terminal`, reports `failure` and releases it.
    async fn finish(&mut self, terminal: CallState, failure: Option<CallFailure>) {
        if !self.transition(terminal) {
            return;
        }
        let Some(session) = self.session.take() else {
            return;
        };
        if let Some(reason) = failure {
            let _ = self.events.send(CallEvent::Failed {
                remote: session.remote_id.clone(),
                reason,
            });
        }
        if let Err(e) = session.transport.close().await {
            warn!("{}: closing transport: {e}", self.id);
        }
        if session.marked_in_call {
            self.registrar.register(&self.id).await;
        }
    }

    async fn notify_remote_cancel(&mut self) {
        let remote = self
            .active_session()
            .filter(|s| s.remote_engaged())
            .and_then(|s| s.remote_id.clone());
        if let Some(remote) = remote {
            let message = SignalingMessage::Cancel {
                from: self.id.clone(),
            };
            self.outbox.send(&remote, &message).await;
        }
    }

    async fn reply_reject(&self, to: &PeerId, reason: RejectReason) {
        let message = SignalingMessage::Reject {
            from: self.id.clone(),
            reason,
        };
        self.outbox.send(to, &message).await;
    }
}

async fn local_offer(transport: &dyn SessionTransport) -> Result<SessionDescription, TransportError> {
    let offer = transport.create_offer().await?;
    transport.set_local_description(offer).await
}

async fn remote_answer(
    transport: &dyn SessionTransport,
    offer: SessionDescription,
) -> Result<SessionDescription, TransportError> {
    transport.set_remote_description(offer).await?;
    let answer = transport.create_answer().await?;
    transport.set_local_description(answer).await
}

async fn deadline_expired(session: &mut Option<CallSession>) -> DeadlineKind {
    match session.as_mut().and_then(|s| s.deadline.as_mut()) {
        Some(deadline) => deadline.expired().await,
        None => std::future::pending().await,
    }
}

async fn next_inbound(
    backlog: &mut VecDeque<Inbound>,
    inbound: &mut mpsc::UnboundedReceiver<Inbound>,
) -> Option<Inbound> {
    match backlog.pop_front() {
        Some(message) => Some(message),
        None => inbound.recv().await,
    }
}

/// Moves mailbox deliveries onto a channel the event loop can poll without
/// losing a message when another branch wins.
async fn forward_mailbox(mut inbox: Mailbox, tx: mpsc::UnboundedSender<Inbound>) {
    while let Some(message) = inbox.recv().await {
        if tx.send(message).is_err() {
            break;
        }
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
