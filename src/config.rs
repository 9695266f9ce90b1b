//! Command-line and environment configuration.
//!
//! Every flag can also be supplied through the environment variable named in
//! its `env` attribute.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::error::{Error, Result};

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

pub const DEFAULT_ROOM: &str = "default";

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8080";

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Parser, Debug)]
#[command(author, version, about = "Room-scoped WebRTC signaling relay and mesh client", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the signaling relay
    Relay(RelayArgs),
    /// Join a room as a headless peer and log session events
    Join(JoinArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Address the WebSocket listener binds to
    #[arg(long, default_value = DEFAULT_BIND_ADDRESS, env = "MESH_RELAY_BIND")]
    pub bind: SocketAddr,

    /// Room joined by connections whose path names none
    #[arg(long, default_value = DEFAULT_ROOM, env = "MESH_DEFAULT_ROOM")]
    pub default_room: String,
}

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    /// Relay address, without the room suffix
    #[arg(long, default_value = DEFAULT_SERVER_URL, env = "MESH_SERVER_URL")]
    pub server: String,

    /// Room to join
    #[arg(default_value = DEFAULT_ROOM)]
    pub room: String,

    /// STUN/TURN server URLs (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = DEFAULT_STUN_SERVER)]
    pub stun_servers: Vec<String>,

    /// Re-offer when an answer has not arrived after this many seconds
    #[arg(long, env = "MESH_NEGOTIATION_TIMEOUT_SECS")]
    pub negotiation_timeout_secs: Option<u64>,

    /// Open a data channel with this label on every offer
    #[arg(long)]
    pub data_channel: Option<String>,

    /// Attach an Opus audio track as the local stream
    #[arg(long, default_value_t = false)]
    pub publish_audio: bool,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_address: SocketAddr,
    pub default_room: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            default_room: DEFAULT_ROOM.to_owned(),
        }
    }
}

impl From<RelayArgs> for RelayConfig {
    fn from(args: RelayArgs) -> Self {
        Self {
            bind_address: args.bind,
            default_room: args.default_room,
        }
    }
}

/// Per-client negotiation settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ice_servers: Vec<String>,
    /// `None` leaves an unanswered offer pending indefinitely.
    pub negotiation_timeout: Option<Duration>,
    pub data_channel_label: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_owned()],
            negotiation_timeout: None,
            data_channel_label: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub room: String,
    pub publish_audio: bool,
    pub session: SessionConfig,
}

impl ClientConfig {
    /// Channel address for the room: server address plus room name.
    pub fn room_url(&self) -> Result<String> {
        let server = self.server_url.trim_end_matches('/');
        if !(server.starts_with("ws://") || server.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "server url must use ws:// or wss://, got {}",
                self.server_url
            )));
        }
        if self.room.is_empty() || self.room.contains('/') {
            return Err(Error::Config(format!("invalid room name: {:?}", self.room)));
        }
        Ok(format!("{}/{}", server, self.room))
    }
}

impl From<JoinArgs> for ClientConfig {
    fn from(args: JoinArgs) -> Self {
        Self {
            server_url: args.server,
            room: args.room,
            publish_audio: args.publish_audio,
            session: SessionConfig {
                ice_servers: args.stun_servers,
                negotiation_timeout: args.negotiation_timeout_secs.map(Duration::from_secs),
                data_channel_label: args.data_channel,
            },
        }
    }
}
