//! Room-scoped signaling relay.
//!
//! The relay assigns every WebSocket connection a participant id, places it in
//! the room named by the request path, and forwards targeted negotiation
//! messages between members. It keeps no record of offers or answers; the
//! only state is room membership.
//!
//! All membership and routing decisions happen on a single actor task that
//! owns the [`RelayRouter`], so ordering between membership events and routed
//! messages is the order in which the actor observes them.

use std::collections::HashMap;
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, ParticipantId, RelayMessage};
use crate::room::{RelayChannel, RoomRegistry};

const RELAY_CHANNEL_BUFFER: usize = 256;

const PARTICIPANT_ID_LEN: usize = 20;

/// Messages queued for one client before the relay starts dropping them.
pub const CLIENT_QUEUE_SIZE: usize = 100;

/// Routing core of the relay. Synchronous and single-owner.
#[derive(Debug)]
pub struct RelayRouter {
    default_room: String,
    rooms: HashMap<String, RoomRegistry>,
    membership: HashMap<ParticipantId, String>,
}

impl RelayRouter {
    pub fn new(default_room: impl Into<String>) -> Self {
        Self {
            default_room: default_room.into(),
            rooms: HashMap::new(),
            membership: HashMap::new(),
        }
    }

    /// Registers a new channel in `room`, acknowledges it, and announces it
    /// to the rest of the room. Returns the id assigned to the channel.
    pub fn join(&mut self, room: &str, tx: mpsc::Sender<RelayMessage>) -> ParticipantId {
        let id = self.next_id();
        let room = if room.is_empty() {
            self.default_room.clone()
        } else {
            room.to_owned()
        };

        let registry = self
            .rooms
            .entry(room.clone())
            .or_insert_with(|| RoomRegistry::new(room.clone()));
        let channel = RelayChannel::new(id.clone(), tx);
        registry.join(channel.clone());
        self.membership.insert(id.clone(), room.clone());

        channel.send(RelayMessage::initialized(id.clone()));
        registry.broadcast(&id, &RelayMessage::NewConnection(id.clone()));

        info!(%room, %id, members = registry.len(), "channel joined");
        id
    }

    /// Handles one inbound message from `sender`.
    ///
    /// Unresolvable targets are dropped; the sender gets no error reply.
    pub fn route(&mut self, sender: &str, msg: ClientMessage) {
        let Some(registry) = self
            .membership
            .get(sender)
            .and_then(|room| self.rooms.get(room))
        else {
            warn!(%sender, kind = msg.kind(), "message from channel outside any room");
            return;
        };

        let kind = msg.kind();
        match msg.into_forward(sender) {
            None => {
                let others = registry.list_others(sender);
                debug!(room = %registry.name(), %sender, count = others.len(), "list");
                if let Some(channel) = registry.find(sender) {
                    channel.send(RelayMessage::List(others));
                }
            }
            Some((target, forwarded)) => match registry.find(&target) {
                Some(channel) => {
                    debug!(%sender, %target, kind, "forwarding");
                    if !channel.send(forwarded) {
                        debug!(%target, kind, "target channel already closed");
                    }
                }
                None => {
                    warn!(room = %registry.name(), %sender, %target, kind, "routing miss, dropping message");
                }
            },
        }
    }

    /// Removes `id` from its room and tells the remaining members.
    pub fn leave(&mut self, id: &str) {
        let Some(room) = self.membership.remove(id) else {
            debug!(%id, "leave for unknown channel");
            return;
        };
        if let Some(registry) = self.rooms.get_mut(&room) {
            registry.leave(id);
            registry.broadcast(id, &RelayMessage::Disconnect(id.to_owned()));
            info!(%room, %id, members = registry.len(), "channel left");
        }
    }

    pub fn room(&self, name: &str) -> Option<&RoomRegistry> {
        self.rooms.get(name)
    }

    fn next_id(&self) -> ParticipantId {
        loop {
            let id: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(PARTICIPANT_ID_LEN)
                .map(char::from)
                .collect();
            if !self.membership.contains_key(&id) {
                return id;
            }
        }
    }
}

enum RelayCommand {
    Join {
        room: String,
        tx: mpsc::Sender<RelayMessage>,
        respond_to: oneshot::Sender<ParticipantId>,
    },
    Inbound {
        sender: ParticipantId,
        msg: ClientMessage,
    },
    Leave {
        id: ParticipantId,
    },
}

/// Handle to the relay actor task.
#[derive(Clone)]
pub struct RelayHandle {
    sender: mpsc::Sender<RelayCommand>,
}

impl RelayHandle {
    /// Spawns the actor that owns `router`.
    pub fn spawn(mut router: RelayRouter) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel(RELAY_CHANNEL_BUFFER);
        let task = tokio::spawn(async move {
            while let Some(command) = receiver.recv().await {
                match command {
                    RelayCommand::Join {
                        room,
                        tx,
                        respond_to,
                    } => {
                        let id = router.join(&room, tx);
                        if respond_to.send(id.clone()).is_err() {
                            // Connection task vanished before learning its id.
                            router.leave(&id);
                        }
                    }
                    RelayCommand::Inbound { sender, msg } => router.route(&sender, msg),
                    RelayCommand::Leave { id } => router.leave(&id),
                }
            }
            debug!("relay actor stopped");
        });
        (Self { sender }, task)
    }

    pub async fn join(
        &self,
        room: String,
        tx: mpsc::Sender<RelayMessage>,
    ) -> Result<ParticipantId> {
        let (respond_to, rx) = oneshot::channel();
        self.sender
            .send(RelayCommand::Join {
                room,
                tx,
                respond_to,
            })
            .await
            .map_err(|_| Error::RelayClosed)?;
        rx.await.map_err(|_| Error::RelayClosed)
    }

    pub async fn forward(&self, sender: ParticipantId, msg: ClientMessage) -> Result<()> {
        self.sender
            .send(RelayCommand::Inbound { sender, msg })
            .await
            .map_err(|_| Error::RelayClosed)
    }

    pub async fn leave(&self, id: ParticipantId) -> Result<()> {
        self.sender
            .send(RelayCommand::Leave { id })
            .await
            .map_err(|_| Error::RelayClosed)
    }
}

/// WebSocket front end of the relay.
pub struct RelayServer {
    listener: TcpListener,
    handle: RelayHandle,
    actor: JoinHandle<()>,
}

impl RelayServer {
    pub async fn bind(config: &RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_address).await?;
        let (handle, actor) = RelayHandle::spawn(RelayRouter::new(config.default_room.clone()));
        info!(addr = %listener.local_addr()?, default_room = %config.default_room, "relay listening");
        Ok(Self {
            listener,
            handle,
            actor,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        let result = loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let handle = self.handle.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, handle).await {
                            warn!(%addr, "connection ended with error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                    break Err(Error::Io(e));
                }
            }
        };
        self.actor.abort();
        result
    }
}

#[instrument(skip(stream, handle))]
async fn handle_connection(stream: TcpStream, addr: SocketAddr, handle: RelayHandle) -> Result<()> {
    let mut path = String::new();
    let capture_path = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
        path = req.uri().path().to_owned();
        Ok(resp)
    };
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, capture_path).await?;

    let room = room_from_path(&path).to_owned();
    let (tx, mut rx) = mpsc::channel::<RelayMessage>(CLIENT_QUEUE_SIZE);
    let id = handle.join(room, tx).await?;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    error!("failed to encode relay message: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => handle.forward(id.clone(), msg).await?,
                Err(e) => warn!(%id, "ignoring unparseable message: {}", e),
            },
            Ok(Message::Close(_)) => {
                debug!(%id, "close frame received");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(%id, "websocket read failed: {}", e);
                break;
            }
        }
    }

    handle.leave(id).await?;
    writer.abort();
    Ok(())
}

/// Room named by the request path: its last non-empty segment.
pub fn room_from_path(path: &str) -> &str {
    path.rsplit('/').find(|segment| !segment.is_empty()).unwrap_or("")
}
