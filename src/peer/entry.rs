use std::sync::Arc;

use tokio::time::Instant;

use crate::protocol::ParticipantId;
use crate::transport::RemoteStream;

use super::state::NegotiationState;

/// One remote participant: its negotiation state and the transport handle
/// currently used to reach it.
///
/// The handle is swapped wholesale on renegotiation; the id and the
/// suppression flag survive the swap.
pub struct PeerEntry<T> {
    id: ParticipantId,
    connection: Arc<T>,
    generation: u64,
    state: NegotiationState,
    suppress_next_remote_stream: bool,
    remote_stream: Option<RemoteStream>,
    renegotiation_pending: bool,
    announced_connected: bool,
    sent_connected: bool,
    offer_deadline: Option<Instant>,
}

impl<T> PeerEntry<T> {
    pub fn new(id: ParticipantId, connection: Arc<T>, generation: u64) -> Self {
        Self {
            id,
            connection,
            generation,
            state: NegotiationState::Created,
            suppress_next_remote_stream: false,
            remote_stream: None,
            renegotiation_pending: false,
            announced_connected: false,
            sent_connected: false,
            offer_deadline: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection(&self) -> Arc<T> {
        Arc::clone(&self.connection)
    }

    /// Generation of the current handle. Events tagged with any other
    /// generation come from a discarded handle.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn set_state(&mut self, state: NegotiationState) {
        self.state = state;
        if state != NegotiationState::Offering {
            self.offer_deadline = None;
        }
    }

    /// Enters `Offering`, optionally with a deadline for the answer.
    pub fn begin_offer(&mut self, deadline: Option<Instant>) {
        self.state = NegotiationState::Offering;
        self.offer_deadline = deadline;
    }

    pub fn offer_deadline(&self) -> Option<Instant> {
        self.offer_deadline
    }

    pub fn offer_expired(&self, now: Instant) -> bool {
        self.state == NegotiationState::Offering
            && self.offer_deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Swaps in a freshly built handle and returns the old one, which the
    /// caller must close.
    ///
    /// A fresh handle re-announces a remote stream that is still live, so the
    /// next added-stream event is suppressed exactly when one is recorded.
    pub fn replace_connection(&mut self, connection: Arc<T>, generation: u64) -> Arc<T> {
        self.suppress_next_remote_stream = self.remote_stream.is_some();
        self.generation = generation;
        std::mem::replace(&mut self.connection, connection)
    }

    pub fn suppresses_next_remote_stream(&self) -> bool {
        self.suppress_next_remote_stream
    }

    /// Clears the suppression flag, returning whether it was set.
    pub fn take_suppression(&mut self) -> bool {
        std::mem::take(&mut self.suppress_next_remote_stream)
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn set_remote_stream(&mut self, stream: RemoteStream) {
        self.remote_stream = Some(stream);
    }

    /// Forgets the remote stream. Nothing is left to re-announce, so a
    /// pending suppression is dropped with it.
    pub fn take_remote_stream(&mut self) -> Option<RemoteStream> {
        self.suppress_next_remote_stream = false;
        self.remote_stream.take()
    }

    pub fn mark_renegotiation_pending(&mut self) {
        self.renegotiation_pending = true;
    }

    pub fn take_renegotiation_pending(&mut self) -> bool {
        std::mem::take(&mut self.renegotiation_pending)
    }

    /// Records that `peerconnected` was sent to this peer. Returns `true` the
    /// first time only.
    pub fn mark_connected_sent(&mut self) -> bool {
        !std::mem::replace(&mut self.sent_connected, true)
    }

    /// Records that application code was told this peer is connected.
    /// Returns `true` the first time only.
    pub fn mark_announced(&mut self) -> bool {
        !std::mem::replace(&mut self.announced_connected, true)
    }

    pub fn is_announced(&self) -> bool {
        self.announced_connected
    }
}
