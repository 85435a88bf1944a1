use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::ConnectionMonitor;
use crate::fanout::TrackFanout;
use crate::hub::{HubOutbound, HubState};
use crate::peer::PeerConnection;
use crate::signaling::SignalingMessage;

/// A listener's live session: where to forward its messages, its connection,
/// and the task running its negotiation.
pub(crate) struct ListenerHandle {
    pub inbound: mpsc::UnboundedSender<SignalingMessage>,
    pub connection: Arc<dyn PeerConnection>,
    pub monitor: ConnectionMonitor,
    pub task: JoinHandle<()>,
}

impl ListenerHandle {
    pub async fn close(self, id: &str) {
        self.task.abort();
        if let Err(e) = self.connection.close().await {
            warn!(listener = id, "error closing listener connection: {}", e);
        }
    }
}

pub(crate) struct Room {
    pub id: String,
    /// Distinguishes this room from earlier ones with the same id, so stale
    /// tasks from a previous room cannot touch it.
    pub epoch: u64,
    pub outbound: mpsc::UnboundedSender<HubOutbound>,
    pub hub_state: watch::Receiver<HubState>,
    pub listeners: HashMap<String, ListenerHandle>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Room {
    pub fn new(
        id: String,
        epoch: u64,
        outbound: mpsc::UnboundedSender<HubOutbound>,
        hub_state: watch::Receiver<HubState>,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self {
            id,
            epoch,
            outbound,
            hub_state,
            listeners: HashMap::new(),
            shutdown: Some(shutdown),
        }
    }

    pub fn hub_open(&self) -> bool {
        *self.hub_state.borrow() == HubState::Open
    }

    /// Closes every listener and the hub connection.
    pub async fn close(mut self, fanout: &mut TrackFanout) {
        for (id, listener) in self.listeners.drain() {
            fanout.detach_listener(&id);
            listener.close(&id).await;
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        debug!(room = %self.id, "room closed");
    }
}
