use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Session description as browsers put it on the wire: `{type, sdp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// One signaling message. Carries either a description or a candidate;
/// `Candidate(None)` is the end-of-candidates marker (`"candidate": null`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireSignal", into = "WireSignal")]
pub enum SignalingMessage {
    Description(SessionDescription),
    Candidate(Option<IceCandidate>),
}

impl SignalingMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[derive(Serialize, Deserialize)]
struct WireSignal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<SessionDescription>,
    // Outer option tells a missing key apart from an explicit null.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    candidate: Option<Option<IceCandidate>>,
}

fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl TryFrom<WireSignal> for SignalingMessage {
    type Error = String;

    fn try_from(wire: WireSignal) -> std::result::Result<Self, Self::Error> {
        match (wire.description, wire.candidate) {
            (Some(description), _) => Ok(SignalingMessage::Description(description)),
            (None, Some(candidate)) => Ok(SignalingMessage::Candidate(candidate)),
            (None, None) => Err("signaling message has neither description nor candidate".into()),
        }
    }
}

impl From<SignalingMessage> for WireSignal {
    fn from(msg: SignalingMessage) -> Self {
        match msg {
            SignalingMessage::Description(description) => WireSignal {
                description: Some(description),
                candidate: None,
            },
            SignalingMessage::Candidate(candidate) => WireSignal {
                description: None,
                candidate: Some(candidate),
            },
        }
    }
}

/// Outbound half of a signaling path. Inbound messages arrive on an
/// `mpsc::UnboundedReceiver<SignalingMessage>` owned by whoever runs the
/// negotiation engine.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, msg: SignalingMessage) -> Result<()>;
}

pub struct DirectSender {
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

#[async_trait]
impl SignalingChannel for DirectSender {
    async fn send(&self, msg: SignalingMessage) -> Result<()> {
        self.tx.send(msg).map_err(|_| Error::ChannelClosed)
    }
}

/// One end of a point-to-point, ordered signaling path (capture context to
/// host). Created in pairs by [`direct_pair`].
pub struct DirectPort {
    name: String,
    tx: mpsc::UnboundedSender<SignalingMessage>,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
}

impl DirectPort {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_parts(
        self,
    ) -> (
        Arc<dyn SignalingChannel>,
        mpsc::UnboundedReceiver<SignalingMessage>,
    ) {
        (Arc::new(DirectSender { tx: self.tx }), self.rx)
    }
}

pub fn direct_pair(name: impl Into<String>) -> (DirectPort, DirectPort) {
    let name = name.into();
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        DirectPort {
            name: name.clone(),
            tx: b_tx,
            rx: a_rx,
        },
        DirectPort {
            name,
            tx: a_tx,
            rx: b_rx,
        },
    )
}
