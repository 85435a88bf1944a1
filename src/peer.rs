use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::Result;
use crate::signaling::{IceCandidate, SessionDescription};

/// Opaque handle for an outbound sender living on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

/// A local audio track that can be sent on any number of connections.
#[derive(Clone)]
pub struct SourceTrack {
    local: Arc<dyn TrackLocal + Send + Sync>,
}

impl SourceTrack {
    pub fn new(local: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self { local }
    }

    pub fn id(&self) -> &str {
        self.local.id()
    }

    pub fn kind(&self) -> RTPCodecType {
        self.local.kind()
    }

    pub fn is_audio(&self) -> bool {
        self.kind() == RTPCodecType::Audio
    }

    pub fn local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.local)
    }
}

impl fmt::Debug for SourceTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceTrack")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Events a connection raises on its own; the negotiation engine consumes them
/// in order.
pub enum PeerEvent {
    NegotiationNeeded,
    IceCandidate(Option<IceCandidate>),
    ConnectionState(RTCPeerConnectionState),
    IceConnectionState(RTCIceConnectionState),
    Track(Arc<TrackRemote>),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::NegotiationNeeded => write!(f, "NegotiationNeeded"),
            PeerEvent::IceCandidate(c) => write!(f, "IceCandidate({c:?})"),
            PeerEvent::ConnectionState(s) => write!(f, "ConnectionState({s})"),
            PeerEvent::IceConnectionState(s) => write!(f, "IceConnectionState({s})"),
            PeerEvent::Track(_) => write!(f, "Track"),
        }
    }
}

/// The operations perfect negotiation and track fan-out need from a
/// connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> RTCSignalingState;

    /// Creates and applies whatever local description the current signaling
    /// state calls for (offer when stable, answer when holding a remote
    /// offer) and returns it.
    async fn set_local_description(&self) -> Result<SessionDescription>;

    /// Applies a remote description. A remote offer arriving while a local
    /// offer is pending rolls the local offer back first.
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_track(&self, track: SourceTrack) -> Result<SenderId>;

    async fn remove_track(&self, sender: SenderId) -> Result<()>;

    /// Idempotent.
    async fn close(&self) -> Result<()>;
}

pub struct PeerParts {
    pub connection: Arc<dyn PeerConnection>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self) -> Result<PeerParts>;
}
