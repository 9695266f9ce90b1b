//! Signaling wire protocol shared by the relay and its clients.
//!
//! Every message travels as one JSON text frame of the form
//! `{"type": <name>, "data": <payload>}`. Clients address messages with a
//! `target`; the relay rewrites them to carry the `sender` before forwarding.
//! Unknown fields are ignored on decode.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifier the relay assigns to each connected channel.
pub type ParticipantId = String;

/// How deep a legacy multiply-wrapped candidate is unwrapped before giving up.
const MAX_CANDIDATE_NESTING: usize = 4;

/// Messages a client sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Ask for the ids of every other member of the room.
    List,
    Offer {
        target: ParticipantId,
        offer: SessionDescription,
    },
    Answer {
        target: ParticipantId,
        answer: SessionDescription,
    },
    IceCandidate {
        target: ParticipantId,
        candidate: CandidatePayload,
    },
    /// Confirms the negotiation with `id` completed on this side.
    PeerConnected {
        id: ParticipantId,
    },
    StreamRemoved {
        target: ParticipantId,
    },
}

/// Messages the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum RelayMessage {
    /// Join acknowledgment. Relays that assign visible ids send them along;
    /// a bare `{"type": "initialized"}` is accepted too.
    Initialized(Option<JoinInfo>),
    /// Other members of the room, in join order.
    List(Vec<ParticipantId>),
    NewConnection(ParticipantId),
    Offer {
        sender: ParticipantId,
        offer: SessionDescription,
    },
    Answer {
        sender: ParticipantId,
        answer: SessionDescription,
    },
    IceCandidate {
        sender: ParticipantId,
        candidate: CandidatePayload,
    },
    PeerConnected {
        sender: ParticipantId,
    },
    StreamRemoved {
        sender: ParticipantId,
    },
    Disconnect(ParticipantId),
}

/// Payload of [`RelayMessage::Initialized`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinInfo {
    pub id: ParticipantId,
}

impl RelayMessage {
    /// Join acknowledgment carrying the assigned id.
    pub fn initialized(id: impl Into<ParticipantId>) -> Self {
        RelayMessage::Initialized(Some(JoinInfo { id: id.into() }))
    }

    /// Wire name of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::Initialized(_) => "initialized",
            RelayMessage::List(_) => "list",
            RelayMessage::NewConnection(_) => "newconnection",
            RelayMessage::Offer { .. } => "offer",
            RelayMessage::Answer { .. } => "answer",
            RelayMessage::IceCandidate { .. } => "icecandidate",
            RelayMessage::PeerConnected { .. } => "peerconnected",
            RelayMessage::StreamRemoved { .. } => "streamremoved",
            RelayMessage::Disconnect(_) => "disconnect",
        }
    }

    /// Id carried by an `initialized` message, if any.
    pub fn assigned_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Initialized(Some(info)) => Some(&info.id),
            _ => None,
        }
    }
}

impl ClientMessage {
    /// Rewrites a targeted message into the form delivered to its target.
    ///
    /// Returns the target id and the message stamped with `sender`, or `None`
    /// for messages the relay answers itself.
    pub fn into_forward(self, sender: &str) -> Option<(ParticipantId, RelayMessage)> {
        let sender = sender.to_owned();
        match self {
            ClientMessage::List => None,
            ClientMessage::Offer { target, offer } => {
                Some((target, RelayMessage::Offer { sender, offer }))
            }
            ClientMessage::Answer { target, answer } => {
                Some((target, RelayMessage::Answer { sender, answer }))
            }
            ClientMessage::IceCandidate { target, candidate } => {
                Some((target, RelayMessage::IceCandidate { sender, candidate }))
            }
            ClientMessage::PeerConnected { id } => Some((id, RelayMessage::PeerConnected { sender })),
            ClientMessage::StreamRemoved { target } => {
                Some((target, RelayMessage::StreamRemoved { sender }))
            }
        }
    }

    /// Wire name of the message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::List => "list",
            ClientMessage::Offer { .. } => "offer",
            ClientMessage::Answer { .. } => "answer",
            ClientMessage::IceCandidate { .. } => "icecandidate",
            ClientMessage::PeerConnected { .. } => "peerconnected",
            ClientMessage::StreamRemoved { .. } => "streamremoved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description in the browser `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Candidate payload as carried on the wire.
///
/// The relay forwards it untouched. Receivers call [`CandidatePayload::decode`],
/// which accepts the canonical single nesting as well as the legacy
/// `candidate.candidate.candidate` wrapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidatePayload(Value);

impl CandidatePayload {
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    /// Extracts a usable candidate, or `None` if the payload is malformed or
    /// carries an empty (end-of-candidates) candidate string.
    pub fn decode(&self) -> Option<IceCandidate> {
        let mut current = &self.0;
        for _ in 0..MAX_CANDIDATE_NESTING {
            match current.get("candidate")? {
                Value::String(candidate) if candidate.is_empty() => return None,
                Value::String(_) => {
                    return serde_json::from_value::<IceCandidate>(current.clone()).ok();
                }
                nested @ Value::Object(_) => current = nested,
                _ => return None,
            }
        }
        None
    }
}

impl From<IceCandidate> for CandidatePayload {
    fn from(candidate: IceCandidate) -> Self {
        Self(serde_json::to_value(candidate).unwrap_or(Value::Null))
    }
}
