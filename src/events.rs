//! Session lifecycle notifications for application code.
//!
//! Events fan out over a tokio broadcast channel: any number of subscribers,
//! each sees every event emitted after it subscribed. Emitting with no
//! subscribers is not an error.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::protocol::ParticipantId;
use crate::transport::{DataChannel, LocalStream, RemoteStream};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    LocalStreamAdded(Arc<LocalStream>),
    LocalStreamRemoved(Arc<LocalStream>),
    RemoteStreamAdded {
        stream: RemoteStream,
        peer_id: ParticipantId,
    },
    RemoteStreamRemoved(ParticipantId),
    PeerConnected(ParticipantId),
    PeerDisconnected(ParticipantId),
    DataChannelAdded {
        channel: DataChannel,
        peer_id: ParticipantId,
    },
}

impl SessionEvent {
    /// Event name as seen by application code.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::LocalStreamAdded(_) => "localStreamAdded",
            SessionEvent::LocalStreamRemoved(_) => "localStreamRemoved",
            SessionEvent::RemoteStreamAdded { .. } => "remoteStreamAdded",
            SessionEvent::RemoteStreamRemoved(_) => "remoteStreamRemoved",
            SessionEvent::PeerConnected(_) => "peerConnected",
            SessionEvent::PeerDisconnected(_) => "peerDisconnected",
            SessionEvent::DataChannelAdded { .. } => "dataChannelAdded",
        }
    }

    /// The remote peer the event concerns, if any.
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            SessionEvent::LocalStreamAdded(_) | SessionEvent::LocalStreamRemoved(_) => None,
            SessionEvent::RemoteStreamAdded { peer_id, .. }
            | SessionEvent::DataChannelAdded { peer_id, .. } => Some(peer_id),
            SessionEvent::RemoteStreamRemoved(id)
            | SessionEvent::PeerConnected(id)
            | SessionEvent::PeerDisconnected(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<SessionEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: SessionEvent) {
        trace!(event = event.name(), peer = ?event.peer_id(), "session event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        Notifier::new().emit(SessionEvent::PeerConnected("b".into()));
    }

    #[test]
    fn test_every_subscriber_sees_event() {
        let notifier = Notifier::new();
        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();

        notifier.emit(SessionEvent::PeerDisconnected("b".into()));

        for rx in [&mut first, &mut second] {
            let event = rx.try_recv().unwrap();
            assert_eq!(event.name(), "peerDisconnected");
            assert_eq!(event.peer_id(), Some("b"));
        }
    }

    #[test]
    fn test_local_events_have_no_peer() {
        let event = SessionEvent::LocalStreamAdded(Arc::new(LocalStream::new("mic")));
        assert_eq!(event.peer_id(), None);
        assert_eq!(event.name(), "localStreamAdded");
    }
}
