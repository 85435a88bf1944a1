pub mod capture;
pub mod config;
pub mod connection;
pub mod control;
pub mod error;
pub mod fanout;
pub mod host;
pub mod hub;
pub mod negotiation;
pub mod peer;
pub mod room;
pub mod signaling;
pub mod turn;
pub mod webrtc;

#[cfg(test)]
mod testing;

pub use crate::capture::{CaptureManager, LocalCaptureSession};
pub use crate::config::{Cli, Settings};
pub use crate::control::{ContentCommand, ContentReply, ControlCommand, ControlResponse};
pub use crate::error::{Error, Result};
pub use crate::fanout::TrackFanout;
pub use crate::host::{CaptureIngest, Host, HostConnector};
pub use crate::negotiation::{NegotiationEngine, Politeness};
pub use crate::room::RoomManager;
pub use crate::signaling::{SignalingChannel, SignalingMessage};
