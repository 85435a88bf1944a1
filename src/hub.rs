use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::signaling::{SignalingChannel, SignalingMessage};

/// Host to hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HubOutbound {
    ToListener { to: String, msg: String },
    KeepAlive,
}

/// Hub to host: a listener's signaling message, still JSON-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubInbound {
    pub from: String,
    pub msg: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Open,
    Closed,
}

/// A live hub connection as the room sees it. Sending on `shutdown` (or
/// dropping it) closes the connection.
pub struct HubConnection {
    pub outbound: mpsc::UnboundedSender<HubOutbound>,
    pub inbound: mpsc::UnboundedReceiver<HubInbound>,
    pub state: watch::Receiver<HubState>,
    pub shutdown: oneshot::Sender<()>,
}

#[async_trait]
pub trait HubConnector: Send + Sync {
    async fn connect(&self, room_id: &str, auth_token: &str) -> Result<HubConnection>;
}

/// Connects to the hub's room-scoped host endpoint over WebSocket.
pub struct WsHubConnector {
    ws_server: String,
}

impl WsHubConnector {
    pub fn new(ws_server: impl Into<String>) -> Self {
        Self {
            ws_server: ws_server.into(),
        }
    }

    pub fn room_url(&self, room_id: &str, auth_token: &str) -> String {
        format!(
            "{}/rooms/{}/host?token={}",
            self.ws_server.trim_end_matches('/'),
            room_id,
            auth_token
        )
    }
}

#[async_trait]
impl HubConnector for WsHubConnector {
    async fn connect(&self, room_id: &str, auth_token: &str) -> Result<HubConnection> {
        let url = self.room_url(room_id, auth_token);
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        info!(room = %room_id, "connected to signaling hub");
        let (mut write, mut read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<HubOutbound>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(HubState::Open);
        let state_tx = Arc::new(state_tx);
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

        // Handle outgoing messages
        let writer_state = state_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = outbound_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let json = match serde_json::to_string(&msg) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Failed to encode hub message: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(json)).await {
                            error!("Failed to send hub message: {}", e);
                            break;
                        }
                    }
                    _ = &mut shutdown_rx => {
                        debug!("closing hub connection");
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            writer_state.send_replace(HubState::Closed);
        });

        // Handle incoming messages
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<HubInbound>(&text) {
                        Ok(envelope) => {
                            if inbound_tx.send(envelope).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to parse hub message: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!("Hub WebSocket error: {}", e);
                        break;
                    }
                }
            }
            info!("hub connection closed");
            state_tx.send_replace(HubState::Closed);
        });

        Ok(HubConnection {
            outbound,
            inbound,
            state,
            shutdown,
        })
    }
}

/// Signaling channel to one listener, relayed through the hub.
pub struct RelayChannel {
    to: String,
    outbound: mpsc::UnboundedSender<HubOutbound>,
}

impl RelayChannel {
    pub fn new(to: impl Into<String>, outbound: mpsc::UnboundedSender<HubOutbound>) -> Self {
        Self {
            to: to.into(),
            outbound,
        }
    }
}

#[async_trait]
impl SignalingChannel for RelayChannel {
    async fn send(&self, msg: SignalingMessage) -> Result<()> {
        let envelope = HubOutbound::ToListener {
            to: self.to.clone(),
            msg: msg.to_json()?,
        };
        self.outbound.send(envelope).map_err(|_| Error::ChannelClosed)
    }
}

/// Sends a keepalive every `every` while the hub is open. The task ends on
/// its own at the first tick after the hub closes.
pub fn spawn_keepalive(
    outbound: mpsc::UnboundedSender<HubOutbound>,
    state: watch::Receiver<HubState>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            if *state.borrow() != HubState::Open {
                debug!("hub closed, stopping keepalive");
                break;
            }
            if outbound.send(HubOutbound::KeepAlive).is_err() {
                break;
            }
        }
    })
}
