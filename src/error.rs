use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    Ws(#[from] Box<WsError>),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Only one local stream may be attached at a time.
    #[error("Local stream already attached: {0}")]
    LocalStreamActive(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Relay is no longer running")]
    RelayClosed,

    #[error("Orchestrator is no longer running")]
    OrchestratorClosed,
}

impl From<WsError> for Error {
    fn from(err: WsError) -> Self {
        Error::Ws(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
