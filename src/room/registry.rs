use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::protocol::{ParticipantId, RelayMessage};

/// Outbound half of one client's channel, as seen by the relay.
#[derive(Debug, Clone)]
pub struct RelayChannel {
    id: ParticipantId,
    tx: mpsc::Sender<RelayMessage>,
}

impl RelayChannel {
    pub fn new(id: ParticipantId, tx: mpsc::Sender<RelayMessage>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queues a message for delivery. Returns `false` if the connection is gone.
    ///
    /// A client that stops reading loses messages once its queue is full; the
    /// relay never waits on it.
    pub fn send(&self, msg: RelayMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                warn!(id = %self.id, kind = msg.kind(), "client queue full, dropping message");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Channels currently joined to one named room.
///
/// Membership is kept in join order so `list_others` is stable.
#[derive(Debug)]
pub struct RoomRegistry {
    name: String,
    order: Vec<ParticipantId>,
    channels: HashMap<ParticipantId, RelayChannel>,
}

impl RoomRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            order: Vec::new(),
            channels: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds the channel. Joining twice with the same id keeps the original
    /// position and returns `false`.
    pub fn join(&mut self, channel: RelayChannel) -> bool {
        if self.channels.contains_key(channel.id()) {
            debug!(room = %self.name, id = %channel.id(), "channel already joined");
            return false;
        }
        self.order.push(channel.id.clone());
        self.channels.insert(channel.id.clone(), channel);
        true
    }

    pub fn leave(&mut self, id: &str) -> Option<RelayChannel> {
        let channel = self.channels.remove(id)?;
        self.order.retain(|member| member != id);
        Some(channel)
    }

    pub fn find(&self, id: &str) -> Option<&RelayChannel> {
        self.channels.get(id)
    }

    /// Every member except `excluding`, in join order.
    pub fn list_others(&self, excluding: &str) -> Vec<ParticipantId> {
        self.order
            .iter()
            .filter(|id| id.as_str() != excluding)
            .cloned()
            .collect()
    }

    /// Sends `msg` to every member except `excluding`.
    pub fn broadcast(&self, excluding: &str, msg: &RelayMessage) {
        for id in self.order.iter().filter(|id| id.as_str() != excluding) {
            if let Some(channel) = self.channels.get(id) {
                if !channel.send(msg.clone()) {
                    debug!(room = %self.name, %id, "broadcast to closed channel");
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
