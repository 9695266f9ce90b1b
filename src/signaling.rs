//! Client end of the relay channel.
//!
//! [`SignalingClient::connect`] opens the WebSocket to a room and bridges it
//! onto tokio channels: outbound [`ClientMessage`]s are serialized by a writer
//! task, inbound frames are parsed into [`RelayMessage`]s by a reader task.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{ClientMessage, RelayMessage};

const INBOUND_BUFFER: usize = 100;

pub struct SignalingClient {
    tx: mpsc::UnboundedSender<ClientMessage>,
    rx: mpsc::Receiver<RelayMessage>,
    writer: JoinHandle<()>,
}

impl SignalingClient {
    /// Connects to a room URL such as `ws://host:8080/lobby`.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        info!(%url, "connected to relay");
        let (mut write, mut read) = ws_stream.split();

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(kind = msg.kind(), "failed to encode message: {}", e);
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    debug!("relay connection closed while sending");
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("relay read failed: {}", e);
                        break;
                    }
                };
                match serde_json::from_str::<RelayMessage>(&text) {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("ignoring unparseable relay message: {}", e),
                }
            }
            info!("relay connection closed");
        });

        Ok(Self {
            tx: outgoing_tx,
            rx,
            writer,
        })
    }

    /// A sender for outbound messages, usable after the client is split.
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientMessage> {
        self.tx.clone()
    }

    pub fn send(&self, msg: ClientMessage) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|e| Error::Signaling(format!("failed to send {}: relay connection closed", e.0.kind())))
    }

    /// Next message from the relay, or `None` once the connection is gone.
    pub async fn receive(&mut self) -> Option<RelayMessage> {
        self.rx.recv().await
    }

    /// Splits into the outbound sender and the inbound receiver.
    ///
    /// The connection stays open until every outbound sender is dropped.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::Receiver<RelayMessage>,
    ) {
        (self.tx, self.rx)
    }

    /// Closes the connection once queued messages are written.
    pub async fn close(self) {
        let Self { tx, rx, writer } = self;
        drop(tx);
        drop(rx);
        let _ = writer.await;
    }
}
