//! Scripted media transport and an in-process mesh harness.
//!
//! The mock encodes its media state in the SDP text, for example
//! `mock-offer streams=cam channels=chat`. Applying a remote description
//! diffs the announced streams against the ones already seen and reports the
//! difference the way a real connection would.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use webrtc_mesh::config::SessionConfig;
use webrtc_mesh::relay::CLIENT_QUEUE_SIZE;
use webrtc_mesh::protocol::{ClientMessage, IceCandidate, ParticipantId, RelayMessage, SessionDescription};
use webrtc_mesh::transport::{
    DataChannel, LocalStream, MediaTransport, RemoteStream, TransportBinding, TransportEvent,
    TransportFactory, TransportSignal,
};
use webrtc_mesh::{Error, Orchestrator, RelayRouter, Result, SessionEvent};

pub struct MockTransport {
    binding: TransportBinding,
    attached: Mutex<Vec<String>>,
    channels: Mutex<Vec<String>>,
    remote_streams: Mutex<HashSet<String>>,
    announced_channels: Mutex<HashSet<String>>,
    candidate_sent: AtomicBool,
    shared: Arc<FactoryState>,
}

impl MockTransport {
    fn describe(&self, kind: &str) -> String {
        let attached = self.attached.lock().unwrap().join(",");
        let channels = self.channels.lock().unwrap().join(",");
        format!("mock-{} streams={} channels={}", kind, attached, channels)
    }

    fn record(&self, what: &str) {
        self.shared.log.lock().unwrap().push(format!(
            "{}#{} {}",
            self.binding.peer_id(),
            self.binding.generation(),
            what
        ));
    }
}

fn field<'a>(sdp: &'a str, key: &str) -> Vec<&'a str> {
    sdp.split_whitespace()
        .filter_map(|token| token.strip_prefix(key))
        .flat_map(|value| value.split(','))
        .filter(|value| !value.is_empty())
        .collect()
}

#[async_trait]
impl MediaTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(self.describe("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::answer(self.describe("answer")))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(&format!("set_local {}", desc.sdp));
        if !self.candidate_sent.swap(true, Ordering::SeqCst) {
            self.binding.emit(TransportEvent::IceCandidate(IceCandidate {
                candidate: format!(
                    "candidate:1 1 udp 2122260223 10.0.0.{} 5000 typ host",
                    self.binding.generation()
                ),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if self.shared.fail_remote.load(Ordering::SeqCst) {
            return Err(Error::Transport("remote description rejected".into()));
        }
        self.record(&format!("set_remote {}", desc.sdp));

        let announced: HashSet<String> =
            field(&desc.sdp, "streams=").into_iter().map(str::to_owned).collect();
        let mut known = self.remote_streams.lock().unwrap();
        let gone: Vec<String> = known.difference(&announced).cloned().collect();
        for id in gone {
            known.remove(&id);
            self.binding.emit(TransportEvent::RemoteStreamRemoved(id));
        }
        for id in announced {
            if known.insert(id.clone()) {
                self.binding
                    .emit(TransportEvent::RemoteStreamAdded(RemoteStream::new(id, vec![])));
            }
        }

        let mut channels = self.announced_channels.lock().unwrap();
        for label in field(&desc.sdp, "channels=") {
            // A channel the far side opened, announced to this side once.
            let opened_here = self.channels.lock().unwrap().iter().any(|l| l == label);
            if !opened_here && channels.insert(label.to_owned()) {
                self.binding
                    .emit(TransportEvent::DataChannel(DataChannel::new(label, None)));
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(&format!("ice {}", candidate.candidate));
        Ok(())
    }

    async fn attach_stream(&self, stream: &LocalStream) -> Result<()> {
        self.attached.lock().unwrap().push(stream.id().to_owned());
        Ok(())
    }

    async fn open_data_channel(&self, label: &str) -> Result<DataChannel> {
        self.channels.lock().unwrap().push(label.to_owned());
        Ok(DataChannel::new(label, None))
    }

    async fn close(&self) -> Result<()> {
        self.record("close");
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
        for id in self.remote_streams.lock().unwrap().drain() {
            self.binding.emit(TransportEvent::RemoteStreamRemoved(id));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FactoryState {
    pub created: AtomicUsize,
    pub closed: AtomicUsize,
    pub fail_remote: AtomicBool,
    pub log: Mutex<Vec<String>>,
}

/// Builds [`MockTransport`]s. Clones share counters and the call log.
#[derive(Clone, Default)]
pub struct MockFactory {
    pub state: Arc<FactoryState>,
}

impl MockFactory {
    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn fail_remote_descriptions(&self, fail: bool) {
        self.state.fail_remote.store(fail, Ordering::SeqCst);
    }

    pub fn log(&self) -> Vec<String> {
        self.state.log.lock().unwrap().clone()
    }

    pub fn log_matching(&self, needle: &str) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|line| line.contains(needle))
            .collect()
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    type Transport = MockTransport;

    async fn create(&self, binding: TransportBinding) -> Result<MockTransport> {
        self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockTransport {
            binding,
            attached: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            remote_streams: Mutex::new(HashSet::new()),
            announced_channels: Mutex::new(HashSet::new()),
            candidate_sent: AtomicBool::new(false),
            shared: Arc::clone(&self.state),
        })
    }
}

/// One orchestrator with every channel around it exposed.
pub struct Peer {
    pub orchestrator: Orchestrator<MockFactory>,
    pub signals: mpsc::UnboundedReceiver<TransportSignal>,
    pub outbound: mpsc::UnboundedReceiver<ClientMessage>,
    pub events: broadcast::Receiver<SessionEvent>,
    pub factory: MockFactory,
}

impl Peer {
    pub fn new(config: SessionConfig) -> Self {
        let factory = MockFactory::default();
        let (outbound_tx, outbound) = mpsc::unbounded_channel();
        let (orchestrator, signals) = Orchestrator::new(factory.clone(), config, outbound_tx);
        let events = orchestrator.subscribe();
        Self {
            orchestrator,
            signals,
            outbound,
            events,
            factory,
        }
    }

    /// Delivers a relay message and then every transport event it caused.
    pub async fn relay(&mut self, msg: RelayMessage) {
        self.orchestrator.handle_relay_message(msg).await;
        self.drain_signals().await;
    }

    /// Returns `true` if any signal was handled.
    pub async fn drain_signals(&mut self) -> bool {
        let mut progressed = false;
        while let Ok(signal) = self.signals.try_recv() {
            self.orchestrator.handle_transport_signal(signal).await;
            progressed = true;
        }
        progressed
    }

    pub fn take_outbound(&mut self) -> Vec<ClientMessage> {
        let mut sent = Vec::new();
        while let Ok(msg) = self.outbound.try_recv() {
            sent.push(msg);
        }
        sent
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn event_names(events: &[SessionEvent]) -> Vec<&'static str> {
    events.iter().map(SessionEvent::name).collect()
}

pub fn count_events(events: &[SessionEvent], name: &str) -> usize {
    events.iter().filter(|event| event.name() == name).count()
}

/// A member of the in-process mesh.
pub struct Member {
    pub id: ParticipantId,
    pub peer: Peer,
    pub inbox: mpsc::Receiver<RelayMessage>,
}

/// Orchestrators wired to each other through a real [`RelayRouter`], pumped
/// deterministically until quiet.
pub struct Mesh {
    pub router: RelayRouter,
    pub members: Vec<Member>,
    /// Every message routed through the relay, as `(sender, kind)`.
    pub routed: Vec<(ParticipantId, &'static str)>,
}

impl Mesh {
    pub fn new() -> Self {
        Self {
            router: RelayRouter::new("default"),
            members: Vec::new(),
            routed: Vec::new(),
        }
    }

    /// Joins a new member to `room` and returns its index.
    pub fn join(&mut self, room: &str, config: SessionConfig) -> usize {
        let (tx, inbox) = mpsc::channel(CLIENT_QUEUE_SIZE);
        let id = self.router.join(room, tx);
        self.members.push(Member {
            id,
            peer: Peer::new(config),
            inbox,
        });
        self.members.len() - 1
    }

    pub fn id(&self, index: usize) -> ParticipantId {
        self.members[index].id.clone()
    }

    pub fn peer(&mut self, index: usize) -> &mut Peer {
        &mut self.members[index].peer
    }

    /// Closes a member's channel: the relay drops it and tells the rest.
    pub fn leave(&mut self, index: usize) {
        let id = self.id(index);
        self.router.leave(&id);
    }

    /// Pumps every member until no message or transport event is left.
    pub async fn settle(&mut self) {
        loop {
            let mut progressed = false;
            for member in &mut self.members {
                while let Ok(msg) = member.inbox.try_recv() {
                    member.peer.relay(msg).await;
                    progressed = true;
                }
                if member.peer.drain_signals().await {
                    progressed = true;
                }
                for msg in member.peer.take_outbound() {
                    self.routed.push((member.id.clone(), msg.kind()));
                    self.router.route(&member.id, msg);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }
    }

    pub fn routed_count(&self, sender: &str, kind: &str) -> usize {
        self.routed
            .iter()
            .filter(|(from, k)| from == sender && *k == kind)
            .count()
    }
}
