//! [`MediaTransport`] backed by a webrtc-rs `RTCPeerConnection`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::transport::{
    DataChannel, LocalStream, MediaTransport, RemoteStream, TrackList, TransportBinding,
    TransportEvent, TransportFactory,
};

/// Builds webrtc-rs peer connections sharing one media engine.
pub struct RtcTransportFactory {
    api: API,
    config: RTCConfiguration,
}

impl RtcTransportFactory {
    pub fn new(ice_servers: &[String]) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        Ok(Self { api, config })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    type Transport = RtcTransport;

    async fn create(&self, binding: TransportBinding) -> Result<RtcTransport> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        let transport = RtcTransport {
            peer_connection,
            binding,
            remote_streams: Arc::new(Mutex::new(StreamGroups::default())),
            pending_candidates: Mutex::new(Vec::new()),
        };
        transport.bind_handlers();
        Ok(transport)
    }
}

pub struct RtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    binding: TransportBinding,
    remote_streams: Arc<Mutex<StreamGroups<TrackRemote>>>,
    /// Candidates received before any remote description was applied.
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

impl RtcTransport {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    fn bind_handlers(&self) {
        let binding = self.binding.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let binding = binding.clone();
                Box::pin(async move {
                    // `None` marks the end of gathering; nothing is sent for it.
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => binding.emit(TransportEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        })),
                        Err(e) => warn!(peer = %binding.peer_id(), "failed to serialize ICE candidate: {}", e),
                    }
                })
            }));

        let binding = self.binding.clone();
        let remote_streams = Arc::clone(&self.remote_streams);
        self.peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let binding = binding.clone();
                let remote_streams = Arc::clone(&remote_streams);
                Box::pin(async move {
                    let stream_id = track.stream_id();
                    debug!(peer = %binding.peer_id(), %stream_id, kind = %track.kind(), "remote track");
                    // A stream with audio and video fires once per track.
                    let first = remote_streams.lock().await.add(&stream_id, track);
                    if let Some(tracks) = first {
                        binding.emit(TransportEvent::RemoteStreamAdded(RemoteStream::with_tracks(
                            stream_id, tracks,
                        )));
                    }
                })
            },
        ));

        let binding = self.binding.clone();
        self.peer_connection
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let binding = binding.clone();
                Box::pin(async move {
                    let label = channel.label().to_owned();
                    info!(peer = %binding.peer_id(), %label, "data channel announced");
                    binding.emit(TransportEvent::DataChannel(DataChannel::new(label, Some(channel))));
                })
            }));

        let peer_id = self.binding.peer_id().to_owned();
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                debug!(peer = %peer_id, "Peer Connection State has changed: {}", s);
                Box::pin(async {})
            }));

        let peer_id = self.binding.peer_id().to_owned();
        self.peer_connection
            .on_signaling_state_change(Box::new(move |s: RTCSignalingState| {
                debug!(peer = %peer_id, "Signaling State has changed: {}", s);
                Box::pin(async {})
            }));

        let peer_id = self.binding.peer_id().to_owned();
        self.peer_connection
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                debug!(peer = %peer_id, "ICE Connection State has changed: {}", s);
                Box::pin(async {})
            }));
    }

    /// Reports streams that the latest remote description no longer carries.
    async fn reconcile_remote_streams(&self, sdp: &str) {
        let announced = announced_stream_ids(sdp);
        let gone = self.remote_streams.lock().await.retain_announced(&announced);
        for id in gone {
            self.binding.emit(TransportEvent::RemoteStreamRemoved(id));
        }
    }
}

/// Remote tracks grouped by the stream that carries them.
struct StreamGroups<T> {
    streams: HashMap<String, TrackList<T>>,
}

impl<T> Default for StreamGroups<T> {
    fn default() -> Self {
        Self {
            streams: HashMap::new(),
        }
    }
}

impl<T> StreamGroups<T> {
    /// Files `track` under `stream_id`. Returns the stream's track list when
    /// this is its first track, `None` when the track joined a known stream.
    fn add(&mut self, stream_id: &str, track: Arc<T>) -> Option<TrackList<T>> {
        if let Some(tracks) = self.streams.get(stream_id) {
            tracks.push(track);
            return None;
        }
        let tracks = TrackList::new(vec![track]);
        self.streams.insert(stream_id.to_owned(), tracks.clone());
        Some(tracks)
    }

    /// Drops streams missing from `announced` and returns their ids.
    fn retain_announced(&mut self, announced: &HashSet<&str>) -> Vec<String> {
        let gone: Vec<String> = self
            .streams
            .keys()
            .filter(|id| !announced.contains(id.as_str()))
            .cloned()
            .collect();
        for id in &gone {
            self.streams.remove(id);
        }
        gone
    }

    fn drain_ids(&mut self) -> Vec<String> {
        self.streams.drain().map(|(id, _)| id).collect()
    }
}

#[async_trait]
impl MediaTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.peer_connection.get_transceivers().await.is_empty() {
            // Nothing to send: still ask for the far side's media.
            for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
                self.peer_connection
                    .add_transceiver_from_kind(
                        kind,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Recvonly,
                            send_encodings: vec![],
                        }),
                    )
                    .await?;
            }
        }
        let offer = self.peer_connection.create_offer(None).await?;
        Ok(to_session_description(&offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await?;
        Ok(to_session_description(&answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_local_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let sdp = desc.sdp.clone();
        self.peer_connection
            .set_remote_description(to_rtc_description(desc)?)
            .await?;

        let pending: Vec<RTCIceCandidateInit> = std::mem::take(&mut *self.pending_candidates.lock().await);
        for candidate in pending {
            if let Err(e) = self.peer_connection.add_ice_candidate(candidate).await {
                warn!(peer = %self.binding.peer_id(), "buffered ICE candidate rejected: {}", e);
            }
        }

        self.reconcile_remote_streams(&sdp).await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        if self.peer_connection.remote_description().await.is_none() {
            debug!(peer = %self.binding.peer_id(), "holding ICE candidate until remote description");
            self.pending_candidates.lock().await.push(init);
            return Ok(());
        }
        self.peer_connection.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn attach_stream(&self, stream: &LocalStream) -> Result<()> {
        for track in stream.tracks() {
            self.peer_connection.add_track(Arc::clone(track)).await?;
        }
        Ok(())
    }

    async fn open_data_channel(&self, label: &str) -> Result<DataChannel> {
        let channel = self.peer_connection.create_data_channel(label, None).await?;
        Ok(DataChannel::new(label, Some(channel)))
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection.close().await?;
        let streams = self.remote_streams.lock().await.drain_ids();
        for id in streams {
            self.binding.emit(TransportEvent::RemoteStreamRemoved(id));
        }
        Ok(())
    }
}

fn to_session_description(desc: &RTCSessionDescription) -> SessionDescription {
    let kind = match desc.sdp_type {
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        _ => SdpKind::Offer,
    };
    SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpKind::Rollback => {
            return Err(Error::Transport("rollback descriptions are not supported".to_owned()))
        }
    };
    Ok(rtc)
}

/// Stream ids announced through `a=msid:<stream> <track>` lines.
fn announced_stream_ids(sdp: &str) -> HashSet<&str> {
    sdp.lines()
        .filter_map(|line| line.trim_end().strip_prefix("a=msid:"))
        .filter_map(|rest| rest.split_whitespace().next())
        .filter(|id| *id != "-")
        .collect()
}
