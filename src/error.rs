use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A local or remote description could not be applied.
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The hub or direct channel went away mid-exchange.
    #[error("signaling channel closed")]
    ChannelClosed,

    #[error("a room is already active")]
    AlreadyActive,

    /// The chosen media element has nothing to capture.
    #[error("capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::NegotiationFailed(msg.to_string())
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
