use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Only `closed` and `failed` end a session.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
            _ => ConnectionState::New,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub signaling_state: RTCSignalingState,
    pub ice_state: RTCIceConnectionState,
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::New,
            signaling_state: RTCSignalingState::Stable,
            ice_state: RTCIceConnectionState::New,
            last_error: None,
        }
    }
}

/// Observable status of one peer session, published over a watch channel.
#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<ConnectionStatus>>,
    receiver: watch::Receiver<ConnectionStatus>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, receiver) = watch::channel(ConnectionStatus::default());
        Self {
            status: Arc::new(status),
            receiver,
        }
    }

    pub fn update_signaling_state(&self, state: RTCSignalingState) {
        self.status.send_modify(|status| {
            status.signaling_state = state;
        });
    }

    pub fn update_ice_state(&self, state: RTCIceConnectionState) {
        self.status.send_modify(|status| {
            status.ice_state = state;
            // ICE may report the end before the peer connection does.
            match state {
                RTCIceConnectionState::Failed => status.state = ConnectionState::Failed,
                RTCIceConnectionState::Closed => status.state = ConnectionState::Closed,
                _ => {}
            }
        });
    }

    pub fn update_peer_state(&self, state: RTCPeerConnectionState) {
        self.status.send_modify(|status| {
            status.state = state.into();
        });
    }

    pub fn set_error(&self, error: String) {
        self.status.send_modify(|status| {
            status.last_error = Some(error);
        });
    }

    pub fn current(&self) -> ConnectionStatus {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.receiver.clone()
    }
}
