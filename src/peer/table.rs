use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::ParticipantId;
use crate::transport::{
    LocalStream, MediaTransport, TransportBinding, TransportFactory, TransportSignal,
};

use super::entry::PeerEntry;

/// Every peer this client is negotiating with, keyed by participant id.
///
/// The table owns the factory, so it is the only place handles are built.
/// Each handle gets a generation number that is unique for the table's
/// lifetime; its events arrive on the shared signal channel tagged with it.
pub struct PeerTable<F: TransportFactory> {
    entries: HashMap<ParticipantId, PeerEntry<F::Transport>>,
    factory: F,
    signals: mpsc::UnboundedSender<TransportSignal>,
    next_generation: u64,
}

impl<F: TransportFactory> PeerTable<F> {
    pub fn new(factory: F, signals: mpsc::UnboundedSender<TransportSignal>) -> Self {
        Self {
            entries: HashMap::new(),
            factory,
            signals,
            next_generation: 0,
        }
    }

    /// Returns the entry for `id`, creating it in `Created` state with a fresh
    /// handle if absent. The flag is `true` when the entry was just created.
    pub async fn get_or_create(
        &mut self,
        id: &str,
        local: Option<&LocalStream>,
    ) -> Result<(&mut PeerEntry<F::Transport>, bool)> {
        let created = if self.entries.contains_key(id) {
            false
        } else {
            let (connection, generation) = self.connect(id, local).await?;
            self.entries
                .insert(id.to_owned(), PeerEntry::new(id.to_owned(), connection, generation));
            debug!(peer = %id, generation, "peer entry created");
            true
        };
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::UnknownPeer(id.to_owned()))?;
        Ok((entry, created))
    }

    /// Builds a fresh handle for `id`, swaps it into the entry and closes the
    /// old one. On failure the entry keeps its current handle.
    pub async fn replace_handle(&mut self, id: &str, local: Option<&LocalStream>) -> Result<()> {
        if !self.entries.contains_key(id) {
            return Err(Error::UnknownPeer(id.to_owned()));
        }
        let (connection, generation) = self.connect(id, local).await?;
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::UnknownPeer(id.to_owned()))?;
        let old = entry.replace_connection(connection, generation);
        debug!(
            peer = %id,
            generation,
            suppress = entry.suppresses_next_remote_stream(),
            "peer connection replaced"
        );
        if let Err(e) = old.close().await {
            warn!(peer = %id, "failed to close replaced connection: {}", e);
        }
        Ok(())
    }

    async fn connect(
        &mut self,
        id: &str,
        local: Option<&LocalStream>,
    ) -> Result<(Arc<F::Transport>, u64)> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let binding = TransportBinding::new(id.to_owned(), generation, self.signals.clone());
        let connection = self.factory.create(binding).await?;
        if let Some(stream) = local {
            connection.attach_stream(stream).await?;
        }
        Ok((Arc::new(connection), generation))
    }

    pub fn has(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&PeerEntry<F::Transport>> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PeerEntry<F::Transport>> {
        self.entries.get_mut(id)
    }

    /// `true` if `generation` is the current handle of `id`.
    pub fn is_current(&self, id: &str, generation: u64) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| entry.generation() == generation)
    }

    pub fn remove(&mut self, id: &str) -> Option<PeerEntry<F::Transport>> {
        self.entries.remove(id)
    }

    /// Snapshot of the ids, for iterating while mutating entries.
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerEntry<F::Transport>> {
        self.entries.values()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PeerEntry<F::Transport>> + '_ {
        self.entries.drain().map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
