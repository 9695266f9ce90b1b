//! Client-side signaling orchestrator.
//!
//! The orchestrator owns the peer table and the local stream. It consumes
//! relay messages and transport events one at a time, so negotiation steps
//! for a peer never interleave: every offer/answer exchange runs to
//! completion (or failure) before the next input is looked at. Triggers that
//! arrive while a peer is mid-negotiation are coalesced into a single pending
//! renegotiation that runs once the peer is stable again.
//!
//! Negotiation failures are logged and leave the peer where it stood; they
//! never reach application code as errors.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::events::{Notifier, SessionEvent};
use crate::peer::{NegotiationState, PeerTable};
use crate::protocol::{
    CandidatePayload, ClientMessage, JoinInfo, ParticipantId, RelayMessage, SessionDescription,
};
use crate::transport::{
    LocalStream, MediaTransport, TransportEvent, TransportFactory, TransportSignal,
};

const COMMAND_CHANNEL_BUFFER: usize = 32;

const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub struct Orchestrator<F: TransportFactory> {
    config: SessionConfig,
    local_id: Option<ParticipantId>,
    peers: PeerTable<F>,
    local_stream: Option<Arc<LocalStream>>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    notifier: Notifier,
}

impl<F: TransportFactory> Orchestrator<F> {
    /// Creates an orchestrator that sends signaling messages on `outbound`.
    ///
    /// The returned receiver carries events from every transport handle the
    /// orchestrator builds; feed it back through
    /// [`handle_transport_signal`](Self::handle_transport_signal) or hand it
    /// to [`spawn`](Self::spawn).
    pub fn new(
        factory: F,
        config: SessionConfig,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<TransportSignal>) {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            config,
            local_id: None,
            peers: PeerTable::new(factory, signals_tx),
            local_stream: None,
            outbound,
            notifier: Notifier::new(),
        };
        (orchestrator, signals_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.notifier.subscribe()
    }

    /// Id the relay assigned to this client, once `initialized` has arrived.
    pub fn local_id(&self) -> Option<&str> {
        self.local_id.as_deref()
    }

    pub fn local_stream(&self) -> Option<&Arc<LocalStream>> {
        self.local_stream.as_ref()
    }

    pub fn has_peer(&self, id: &str) -> bool {
        self.peers.has(id)
    }

    pub fn peer_state(&self, id: &str) -> Option<NegotiationState> {
        self.peers.get(id).map(|entry| entry.state())
    }

    pub fn peer_ids(&self) -> Vec<ParticipantId> {
        self.peers.ids()
    }

    /// Handle generation currently bound for `id`.
    pub fn peer_generation(&self, id: &str) -> Option<u64> {
        self.peers.get(id).map(|entry| entry.generation())
    }

    pub async fn handle_relay_message(&mut self, msg: RelayMessage) {
        match msg {
            RelayMessage::Initialized(info) => {
                match info {
                    Some(JoinInfo { id }) => {
                        info!(%id, "joined room");
                        self.local_id = Some(id);
                    }
                    None => info!("joined room without an assigned id"),
                }
                self.send(ClientMessage::List);
            }
            RelayMessage::List(ids) => {
                debug!(count = ids.len(), "room membership received");
                for id in ids {
                    self.on_contact(&id).await;
                }
            }
            RelayMessage::NewConnection(id) => self.on_contact(&id).await,
            RelayMessage::Offer { sender, offer } => self.on_offer(&sender, offer).await,
            RelayMessage::Answer { sender, answer } => self.on_answer(&sender, answer).await,
            RelayMessage::IceCandidate { sender, candidate } => {
                self.on_ice_candidate(&sender, candidate).await
            }
            RelayMessage::PeerConnected { sender } => self.on_peer_connected(&sender),
            RelayMessage::StreamRemoved { sender } => self.on_stream_removed(&sender).await,
            RelayMessage::Disconnect(id) => self.on_disconnect(&id).await,
        }
    }

    pub async fn handle_transport_signal(&mut self, signal: TransportSignal) {
        let TransportSignal {
            peer_id,
            generation,
            event,
        } = signal;
        if !self.peers.is_current(&peer_id, generation) {
            trace!(peer = %peer_id, generation, ?event, "dropping event from discarded connection");
            return;
        }
        let Some(entry) = self.peers.get_mut(&peer_id) else {
            return;
        };

        match event {
            TransportEvent::IceCandidate(candidate) => {
                self.send(ClientMessage::IceCandidate {
                    target: peer_id,
                    candidate: CandidatePayload::from(candidate),
                });
            }
            TransportEvent::RemoteStreamAdded(stream) => {
                let reannounced = entry
                    .remote_stream()
                    .is_some_and(|known| known.id() == stream.id());
                let suppressed = entry.take_suppression() && reannounced;
                entry.set_remote_stream(stream.clone());
                if suppressed {
                    debug!(peer = %peer_id, stream = %stream.id(), "suppressed repeated remote stream");
                } else {
                    info!(peer = %peer_id, stream = %stream.id(), "remote stream added");
                    self.notifier
                        .emit(SessionEvent::RemoteStreamAdded { stream, peer_id });
                }
            }
            TransportEvent::RemoteStreamRemoved(stream_id) => {
                let matches = entry
                    .remote_stream()
                    .is_some_and(|stream| stream.id() == stream_id);
                if matches {
                    entry.take_remote_stream();
                    info!(peer = %peer_id, stream = %stream_id, "remote stream removed");
                    self.notifier.emit(SessionEvent::RemoteStreamRemoved(peer_id));
                } else {
                    debug!(peer = %peer_id, stream = %stream_id, "removal of unknown remote stream");
                }
            }
            TransportEvent::DataChannel(channel) => {
                self.notifier
                    .emit(SessionEvent::DataChannelAdded { channel, peer_id });
            }
        }
    }

    /// Attaches `stream` to every peer, renegotiating established ones.
    ///
    /// Fails with [`Error::LocalStreamActive`] if a stream is already attached.
    pub async fn add_local_stream(&mut self, stream: LocalStream) -> Result<()> {
        if let Some(active) = &self.local_stream {
            return Err(Error::LocalStreamActive(active.id().to_owned()));
        }
        let stream = Arc::new(stream);
        info!(stream = %stream.id(), peers = self.peers.len(), "local stream added");
        self.local_stream = Some(Arc::clone(&stream));
        self.notifier.emit(SessionEvent::LocalStreamAdded(stream));

        for id in self.peers.ids() {
            self.on_local_change(&id).await;
        }
        Ok(())
    }

    /// Detaches the local stream from every peer. No-op when none is attached.
    pub async fn remove_local_stream(&mut self) {
        let Some(stream) = self.local_stream.take() else {
            debug!("no local stream to remove");
            return;
        };
        info!(stream = %stream.id(), peers = self.peers.len(), "local stream removed");
        self.notifier.emit(SessionEvent::LocalStreamRemoved(stream));

        for id in self.peers.ids() {
            let negotiated = self
                .peers
                .get(&id)
                .is_some_and(|entry| entry.state() != NegotiationState::Created);
            if negotiated {
                self.send(ClientMessage::StreamRemoved { target: id.clone() });
            }
            self.on_local_change(&id).await;
        }
    }

    /// Re-offers, on a fresh handle, to every peer whose answer is overdue.
    pub async fn check_timeouts(&mut self, now: Instant) {
        let expired: Vec<ParticipantId> = self
            .peers
            .iter()
            .filter(|entry| entry.offer_expired(now))
            .map(|entry| entry.id().to_owned())
            .collect();
        for id in expired {
            warn!(peer = %id, "no answer before negotiation timeout, offering again");
            self.renegotiate(&id).await;
        }
    }

    /// Closes every transport handle and empties the peer table.
    pub async fn close_all(&mut self) {
        for mut entry in self.peers.drain().collect::<Vec<_>>() {
            entry.set_state(NegotiationState::Closed);
            if let Err(e) = entry.connection().close().await {
                debug!(peer = %entry.id(), "close failed: {}", e);
            }
        }
    }

    async fn on_contact(&mut self, id: &str) {
        if self.local_id.as_deref() == Some(id) {
            return;
        }
        let local = self.local_stream.clone();
        let created = match self.peers.get_or_create(id, local.as_deref()).await {
            Ok((_, created)) => created,
            Err(e) => {
                warn!(peer = %id, "failed to create peer connection: {}", e);
                return;
            }
        };
        if !created {
            return;
        }
        info!(peer = %id, "peer added");
        if local.is_some() || self.config.data_channel_label.is_some() {
            self.offer(id).await;
        }
    }

    /// Stream attach/detach trigger for one peer.
    async fn on_local_change(&mut self, id: &str) {
        let Some(entry) = self.peers.get_mut(id) else {
            return;
        };
        match entry.state() {
            NegotiationState::Created => {
                let connection = entry.connection();
                match self.local_stream.clone() {
                    Some(stream) => {
                        if let Err(e) = connection.attach_stream(&stream).await {
                            warn!(peer = %id, "failed to attach local stream: {}", e);
                            return;
                        }
                        self.offer(id).await;
                    }
                    None => {
                        self.replace_handle(id).await;
                    }
                }
            }
            NegotiationState::Stable => self.renegotiate(id).await,
            state if state.is_negotiating() => {
                debug!(peer = %id, %state, "negotiation in flight, queueing renegotiation");
                entry.mark_renegotiation_pending();
            }
            _ => {}
        }
    }

    async fn on_offer(&mut self, sender: &str, offer: SessionDescription) {
        let local = self.local_stream.clone();
        let (state, created) = match self.peers.get_or_create(sender, local.as_deref()).await {
            Ok((entry, created)) => (entry.state(), created),
            Err(e) => {
                warn!(peer = %sender, "failed to create peer connection: {}", e);
                return;
            }
        };
        if created {
            info!(peer = %sender, "peer added");
        }

        match state {
            NegotiationState::Offering => {
                let keep_local = self
                    .local_id
                    .as_deref()
                    .is_some_and(|local_id| local_id > sender);
                if keep_local {
                    info!(peer = %sender, "offer collision, keeping local offer");
                    return;
                }
                info!(peer = %sender, "offer collision, answering remote offer");
                // Our unanswered offer is discarded with the old handle.
                if !self.replace_handle(sender).await {
                    return;
                }
            }
            NegotiationState::Stable | NegotiationState::Answering => {
                if !self.replace_handle(sender).await {
                    return;
                }
            }
            _ => {}
        }
        self.answer(sender, offer).await;
    }

    #[instrument(skip(self, offer))]
    async fn answer(&mut self, sender: &str, offer: SessionDescription) {
        let Some(entry) = self.peers.get_mut(sender) else {
            return;
        };
        entry.set_state(NegotiationState::Answering);
        let connection = entry.connection();

        if let Err(e) = connection.set_remote_description(offer).await {
            warn!("failed to apply remote offer: {}", e);
            return;
        }
        let answer = match connection.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("failed to create answer: {}", e);
                return;
            }
        };
        if let Err(e) = connection.set_local_description(answer.clone()).await {
            warn!("failed to apply local answer: {}", e);
            return;
        }
        self.send(ClientMessage::Answer {
            target: sender.to_owned(),
            answer,
        });
        self.settle(sender).await;
    }

    async fn on_answer(&mut self, sender: &str, answer: SessionDescription) {
        let Some(entry) = self.peers.get(sender) else {
            warn!(peer = %sender, "answer from unknown peer, ignoring");
            return;
        };
        if entry.state() != NegotiationState::Offering {
            warn!(peer = %sender, state = %entry.state(), "answer without outstanding offer, ignoring");
            return;
        }
        let connection = entry.connection();
        if let Err(e) = connection.set_remote_description(answer).await {
            warn!(peer = %sender, "failed to apply remote answer: {}", e);
            return;
        }
        let first = self
            .peers
            .get_mut(sender)
            .is_some_and(|entry| entry.mark_connected_sent());
        if first {
            self.send(ClientMessage::PeerConnected {
                id: sender.to_owned(),
            });
        }
        self.settle(sender).await;
    }

    async fn on_ice_candidate(&mut self, sender: &str, payload: CandidatePayload) {
        let Some(candidate) = payload.decode() else {
            debug!(peer = %sender, "ignoring malformed ICE candidate");
            return;
        };
        let local = self.local_stream.clone();
        let connection = match self.peers.get_or_create(sender, local.as_deref()).await {
            Ok((entry, _)) => entry.connection(),
            Err(e) => {
                warn!(peer = %sender, "failed to create peer connection: {}", e);
                return;
            }
        };
        if let Err(e) = connection.add_ice_candidate(candidate).await {
            warn!(peer = %sender, "failed to add ICE candidate: {}", e);
        }
    }

    fn on_peer_connected(&mut self, sender: &str) {
        let Some(entry) = self.peers.get_mut(sender) else {
            debug!(peer = %sender, "peerconnected from unknown peer");
            return;
        };
        let announce = entry.mark_announced();
        let reply = entry.state() == NegotiationState::Stable && entry.mark_connected_sent();
        if reply {
            self.send(ClientMessage::PeerConnected {
                id: sender.to_owned(),
            });
        }
        if announce {
            info!(peer = %sender, "peer connected");
            self.notifier
                .emit(SessionEvent::PeerConnected(sender.to_owned()));
        }
    }

    async fn on_stream_removed(&mut self, sender: &str) {
        let Some(entry) = self.peers.get_mut(sender) else {
            debug!(peer = %sender, "streamremoved from unknown peer");
            return;
        };
        if entry.take_remote_stream().is_some() {
            info!(peer = %sender, "remote stream removed");
            self.notifier
                .emit(SessionEvent::RemoteStreamRemoved(sender.to_owned()));
        }
        if entry.state() == NegotiationState::Offering {
            // The handle carrying our offer is about to be discarded.
            entry.mark_renegotiation_pending();
        }
        if self.replace_handle(sender).await {
            if let Some(entry) = self.peers.get_mut(sender) {
                entry.set_state(NegotiationState::Renegotiating);
            }
        }
    }

    async fn on_disconnect(&mut self, id: &str) {
        let Some(mut entry) = self.peers.remove(id) else {
            debug!(peer = %id, "disconnect for unknown peer");
            return;
        };
        entry.set_state(NegotiationState::Closed);
        if let Err(e) = entry.connection().close().await {
            debug!(peer = %id, "close failed: {}", e);
        }
        if entry.take_remote_stream().is_some() {
            self.notifier
                .emit(SessionEvent::RemoteStreamRemoved(id.to_owned()));
        }
        info!(peer = %id, "peer disconnected");
        self.notifier
            .emit(SessionEvent::PeerDisconnected(id.to_owned()));
    }

    /// Moves the peer to `Stable` and runs a queued renegotiation, if any.
    async fn settle(&mut self, id: &str) {
        let pending = match self.peers.get_mut(id) {
            Some(entry) => {
                entry.set_state(NegotiationState::Stable);
                entry.take_renegotiation_pending()
            }
            None => return,
        };
        debug!(peer = %id, pending, "negotiation stable");
        if pending {
            self.renegotiate(id).await;
        }
    }

    async fn renegotiate(&mut self, id: &str) {
        if !self.replace_handle(id).await {
            return;
        }
        if let Some(entry) = self.peers.get_mut(id) {
            entry.set_state(NegotiationState::Renegotiating);
        }
        self.offer(id).await;
    }

    /// Swaps in a fresh handle carrying the current local stream.
    async fn replace_handle(&mut self, id: &str) -> bool {
        let local = self.local_stream.clone();
        match self.peers.replace_handle(id, local.as_deref()).await {
            Ok(()) => true,
            Err(e) => {
                warn!(peer = %id, "failed to replace peer connection: {}", e);
                false
            }
        }
    }

    #[instrument(skip(self))]
    async fn offer(&mut self, id: &str) {
        let deadline = self.config.negotiation_timeout.map(|t| Instant::now() + t);
        let Some(entry) = self.peers.get_mut(id) else {
            return;
        };
        entry.begin_offer(deadline);
        let connection = entry.connection();

        if let Some(label) = self.config.data_channel_label.clone() {
            match connection.open_data_channel(&label).await {
                Ok(channel) => self.notifier.emit(SessionEvent::DataChannelAdded {
                    channel,
                    peer_id: id.to_owned(),
                }),
                Err(e) => warn!(%label, "failed to open data channel: {}", e),
            }
        }

        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("failed to create offer: {}", e);
                return;
            }
        };
        if let Err(e) = connection.set_local_description(offer.clone()).await {
            warn!("failed to apply local offer: {}", e);
            return;
        }
        self.send(ClientMessage::Offer {
            target: id.to_owned(),
            offer,
        });
    }

    fn send(&self, msg: ClientMessage) {
        let kind = msg.kind();
        trace!(kind, "sending");
        if self.outbound.send(msg).is_err() {
            warn!(kind, "signaling channel closed, dropping message");
        }
    }
}

impl<F> Orchestrator<F>
where
    F: TransportFactory + 'static,
    F::Transport: 'static,
{
    /// Runs the orchestrator on its own task, fed by `inbound` relay messages
    /// and the transport `signals` returned from [`Orchestrator::new`].
    ///
    /// The task ends when the relay channel closes, on shutdown, or when every
    /// handle has been dropped; it closes all peer connections on the way out.
    pub fn spawn(
        self,
        signals: mpsc::UnboundedReceiver<TransportSignal>,
        inbound: mpsc::Receiver<RelayMessage>,
    ) -> (OrchestratorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let handle = OrchestratorHandle {
            sender,
            notifier: self.notifier.clone(),
        };
        let task = tokio::spawn(self.run(signals, inbound, receiver));
        (handle, task)
    }

    async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<TransportSignal>,
        mut inbound: mpsc::Receiver<RelayMessage>,
        mut commands: mpsc::Receiver<OrchestratorCommand>,
    ) {
        let mut timeout_check = tokio::time::interval(TIMEOUT_CHECK_INTERVAL);
        timeout_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let check_timeouts = self.config.negotiation_timeout.is_some();

        loop {
            tokio::select! {
                biased;

                msg = inbound.recv() => match msg {
                    Some(msg) => self.handle_relay_message(msg).await,
                    None => {
                        info!("signaling channel closed");
                        break;
                    }
                },
                Some(signal) = signals.recv() => self.handle_transport_signal(signal).await,
                command = commands.recv() => match command {
                    Some(OrchestratorCommand::AddLocalStream { stream, respond_to }) => {
                        let result = self.add_local_stream(stream).await;
                        let _ = respond_to.send(result);
                    }
                    Some(OrchestratorCommand::RemoveLocalStream { respond_to }) => {
                        self.remove_local_stream().await;
                        let _ = respond_to.send(());
                    }
                    Some(OrchestratorCommand::PeerStates { respond_to }) => {
                        let states = self
                            .peers
                            .iter()
                            .map(|entry| (entry.id().to_owned(), entry.state()))
                            .collect();
                        let _ = respond_to.send(states);
                    }
                    Some(OrchestratorCommand::Shutdown) | None => break,
                },
                _ = timeout_check.tick(), if check_timeouts => {
                    self.check_timeouts(Instant::now()).await;
                }
            }
        }

        info!(peers = self.peers.len(), "orchestrator stopping");
        self.close_all().await;
    }
}

enum OrchestratorCommand {
    AddLocalStream {
        stream: LocalStream,
        respond_to: oneshot::Sender<Result<()>>,
    },
    RemoveLocalStream {
        respond_to: oneshot::Sender<()>,
    },
    PeerStates {
        respond_to: oneshot::Sender<Vec<(ParticipantId, NegotiationState)>>,
    },
    Shutdown,
}

/// Handle to a running orchestrator task.
#[derive(Clone)]
pub struct OrchestratorHandle {
    sender: mpsc::Sender<OrchestratorCommand>,
    notifier: Notifier,
}

impl OrchestratorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.notifier.subscribe()
    }

    pub async fn add_local_stream(&self, stream: LocalStream) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(OrchestratorCommand::AddLocalStream {
                stream,
                respond_to: tx,
            })
            .await
            .map_err(|_| Error::OrchestratorClosed)?;
        rx.await.map_err(|_| Error::OrchestratorClosed)?
    }

    pub async fn remove_local_stream(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(OrchestratorCommand::RemoveLocalStream { respond_to: tx })
            .await
            .map_err(|_| Error::OrchestratorClosed)?;
        rx.await.map_err(|_| Error::OrchestratorClosed)
    }

    pub async fn peer_states(&self) -> Result<Vec<(ParticipantId, NegotiationState)>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(OrchestratorCommand::PeerStates { respond_to: tx })
            .await
            .map_err(|_| Error::OrchestratorClosed)?;
        rx.await.map_err(|_| Error::OrchestratorClosed)
    }

    /// Asks the task to close every peer connection and stop.
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(OrchestratorCommand::Shutdown)
            .await
            .map_err(|_| Error::OrchestratorClosed)
    }
}
