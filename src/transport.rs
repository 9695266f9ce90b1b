//! Media-transport capability used by the orchestrator.
//!
//! A [`MediaTransport`] is one peer connection handle. Handles are built by a
//! [`TransportFactory`] and report asynchronous happenings (gathered ICE
//! candidates, remote streams, data channels) through the [`TransportBinding`]
//! they were created with. The binding tags every event with the peer id and
//! the handle generation, so events from a replaced handle can be told apart.

use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::data_channel::RTCDataChannel;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;
use crate::protocol::{IceCandidate, ParticipantId, SessionDescription};

#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Adds every track of `stream` to the connection.
    async fn attach_stream(&self, stream: &LocalStream) -> Result<()>;

    async fn open_data_channel(&self, label: &str) -> Result<DataChannel>;

    /// Releases the handle. It is never used again afterwards.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    type Transport: MediaTransport;

    /// Builds a fresh handle whose events are reported through `binding`.
    async fn create(&self, binding: TransportBinding) -> Result<Self::Transport>;
}

#[derive(Clone)]
pub enum TransportEvent {
    IceCandidate(IceCandidate),
    RemoteStreamAdded(RemoteStream),
    RemoteStreamRemoved(String),
    DataChannel(DataChannel),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::IceCandidate(c) => write!(f, "IceCandidate({})", c.candidate),
            TransportEvent::RemoteStreamAdded(s) => write!(f, "RemoteStreamAdded({})", s.id()),
            TransportEvent::RemoteStreamRemoved(id) => write!(f, "RemoteStreamRemoved({})", id),
            TransportEvent::DataChannel(ch) => write!(f, "DataChannel({})", ch.label()),
        }
    }
}

/// An event tagged with the handle that produced it.
#[derive(Debug, Clone)]
pub struct TransportSignal {
    pub peer_id: ParticipantId,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Event sink handed to a transport at construction.
#[derive(Debug, Clone)]
pub struct TransportBinding {
    peer_id: ParticipantId,
    generation: u64,
    events: mpsc::UnboundedSender<TransportSignal>,
}

impl TransportBinding {
    pub fn new(
        peer_id: ParticipantId,
        generation: u64,
        events: mpsc::UnboundedSender<TransportSignal>,
    ) -> Self {
        Self {
            peer_id,
            generation,
            events,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reports an event. Events emitted after the orchestrator has gone are dropped.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(TransportSignal {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        });
    }
}

/// The local media capture, shared by reference with every connection.
#[derive(Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<dyn TrackLocal + Send + Sync>>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        self.tracks.push(track);
        self
    }

    /// A stream with a single Opus audio track. Samples are written by the
    /// caller through the returned track.
    pub fn opus_audio(id: impl Into<String>) -> (Self, Arc<TrackLocalStaticSample>) {
        let id = id.into();
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            id.clone(),
        ));
        let stream = Self::new(id).with_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>);
        (stream, audio_track)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<dyn TrackLocal + Send + Sync>] {
        &self.tracks
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Track list shared between clones, so tracks that arrive after a stream
/// was announced reach every holder of it.
pub(crate) struct TrackList<T>(Arc<RwLock<Vec<Arc<T>>>>);

impl<T> TrackList<T> {
    pub(crate) fn new(tracks: Vec<Arc<T>>) -> Self {
        Self(Arc::new(RwLock::new(tracks)))
    }

    pub(crate) fn push(&self, track: Arc<T>) {
        self.0
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(track);
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.0
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl<T> Clone for TrackList<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

/// A stream announced by the far side of a connection.
///
/// Audio and video of one stream arrive as separate tracks; tracks that show
/// up after the stream was first reported are added to it in place.
#[derive(Clone)]
pub struct RemoteStream {
    id: String,
    tracks: TrackList<TrackRemote>,
}

impl RemoteStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<TrackRemote>>) -> Self {
        Self::with_tracks(id, TrackList::new(tracks))
    }

    pub(crate) fn with_tracks(id: impl Into<String>, tracks: TrackList<TrackRemote>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Tracks received so far.
    pub fn tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.tracks.snapshot()
    }
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks.snapshot().len())
            .finish()
    }
}

#[derive(Clone)]
pub struct DataChannel {
    label: String,
    inner: Option<Arc<RTCDataChannel>>,
}

impl DataChannel {
    pub fn new(label: impl Into<String>, inner: Option<Arc<RTCDataChannel>>) -> Self {
        Self {
            label: label.into(),
            inner,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The underlying webrtc data channel, when backed by one.
    pub fn channel(&self) -> Option<&Arc<RTCDataChannel>> {
        self.inner.as_ref()
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel").field("label", &self.label).finish()
    }
}
