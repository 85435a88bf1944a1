use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use crate::config::{Settings, FALLBACK_STUN_SERVER};
use crate::error::{Error, Result};
use crate::peer::{PeerConnection, PeerEvent, PeerFactory, PeerParts, SenderId, SourceTrack};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::turn::TurnClient;

/// `PeerConnection` backed by a webrtc-rs `RTCPeerConnection`.
pub struct RtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<SenderId, Arc<RTCRtpSender>>>,
    next_sender: AtomicU64,
}

impl RtcPeer {
    async fn new(config: RTCConfiguration) -> Result<PeerParts> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = Arc::new(api.new_peer_connection(config).await?);
        let (events_tx, events) = mpsc::unbounded_channel();

        let tx = events_tx.clone();
        peer_connection.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(PeerEvent::NegotiationNeeded);
            })
        }));

        let tx = events_tx.clone();
        peer_connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let candidate = match c {
                    None => None,
                    Some(c) => match c.to_json() {
                        Ok(init) => Some(IceCandidate::from(init)),
                        Err(e) => {
                            warn!("Failed to serialize local ICE candidate: {}", e);
                            return;
                        }
                    },
                };
                let _ = tx.send(PeerEvent::IceCandidate(candidate));
            })
        }));

        let tx = events_tx.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |s: RTCPeerConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    debug!("Peer Connection State has changed: {}", s);
                    let _ = tx.send(PeerEvent::ConnectionState(s));
                })
            },
        ));

        let tx = events_tx.clone();
        peer_connection.on_ice_connection_state_change(Box::new(
            move |s: RTCIceConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    debug!("ICE Connection State has changed: {}", s);
                    let _ = tx.send(PeerEvent::IceConnectionState(s));
                })
            },
        ));

        let tx = events_tx;
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(PeerEvent::Track(track));
                })
            },
        ));

        let peer = RtcPeer {
            peer_connection,
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
        };

        Ok(PeerParts {
            connection: Arc::new(peer),
            events,
        })
    }

    /// webrtc-rs 0.11 parses the rollback's SDP, so it carries the pending
    /// offer, and then refuses the have-local-offer to stable transition. The
    /// engine answers queued offers before making its own, so a polite
    /// session only lands here on a true in-flight collision.
    async fn rollback(&self) -> Result<()> {
        let pending = self
            .peer_connection
            .pending_local_description()
            .await
            .ok_or_else(|| Error::negotiation("no pending local offer to roll back"))?;
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = pending.sdp;
        self.peer_connection
            .set_local_description(rollback)
            .await
            .map_err(|e| Error::negotiation(format!("rollback rejected: {e}")))
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    fn signaling_state(&self) -> RTCSignalingState {
        self.peer_connection.signaling_state()
    }

    async fn set_local_description(&self) -> Result<SessionDescription> {
        let description = match self.peer_connection.signaling_state() {
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
                self.peer_connection.create_answer(None).await?
            }
            _ => self.peer_connection.create_offer(None).await?,
        };
        self.peer_connection
            .set_local_description(description)
            .await
            .map_err(Error::negotiation)?;

        let applied = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| Error::negotiation("local description unavailable after applying"))?;
        SessionDescription::try_from(applied)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        // Browsers roll back implicitly; webrtc-rs needs it spelled out.
        if desc.is_offer()
            && self.peer_connection.signaling_state() == RTCSignalingState::HaveLocalOffer
        {
            debug!("rolling back local offer before applying remote offer");
            self.rollback().await?;
        }
        let remote = RTCSessionDescription::try_from(desc)?;
        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(Error::negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit::from(candidate))
            .await?;
        Ok(())
    }

    async fn add_track(&self, track: SourceTrack) -> Result<SenderId> {
        let sender = self.peer_connection.add_track(track.local()).await?;
        let id = SenderId(self.next_sender.fetch_add(1, Ordering::Relaxed));
        self.senders.lock().await.insert(id, sender);
        Ok(id)
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let sender = self
            .senders
            .lock()
            .await
            .remove(&sender)
            .ok_or_else(|| Error::negotiation(format!("unknown sender {}", sender.0)))?;
        self.peer_connection.remove_track(&sender).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().await.clear();
        self.peer_connection.close().await?;
        Ok(())
    }
}

impl TryFrom<RTCSessionDescription> for SessionDescription {
    type Error = Error;

    fn try_from(desc: RTCSessionDescription) -> Result<Self> {
        let sdp_type = match desc.sdp_type {
            RTCSdpType::Offer => SdpType::Offer,
            RTCSdpType::Pranswer => SdpType::Pranswer,
            RTCSdpType::Answer => SdpType::Answer,
            RTCSdpType::Rollback => SdpType::Rollback,
            RTCSdpType::Unspecified => {
                return Err(Error::negotiation("description has no type"));
            }
        };
        Ok(SessionDescription {
            sdp_type,
            sdp: desc.sdp,
        })
    }
}

impl TryFrom<SessionDescription> for RTCSessionDescription {
    type Error = Error;

    fn try_from(desc: SessionDescription) -> Result<Self> {
        let parsed = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpType::Rollback => {
                let mut rollback = RTCSessionDescription::default();
                rollback.sdp_type = RTCSdpType::Rollback;
                Ok(rollback)
            }
        };
        parsed.map_err(Error::negotiation)
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// Builds `RtcPeer`s. Listener-facing connections get a TURN entry with
/// one-time credentials when a relay is configured; otherwise a public STUN
/// server.
pub struct RtcPeerFactory {
    ice_server: Option<String>,
    turn: Option<TurnClient>,
    stun_fallback: bool,
}

impl RtcPeerFactory {
    /// Connections that never leave the machine (capture context to host).
    pub fn local() -> Self {
        Self {
            ice_server: None,
            turn: None,
            stun_fallback: false,
        }
    }

    pub fn for_listeners(settings: &Settings) -> Result<Self> {
        let turn = settings
            .ice_server
            .as_ref()
            .map(|_| TurnClient::new(&settings.api_server))
            .transpose()?;
        Ok(Self {
            ice_server: settings.ice_server.clone(),
            turn,
            stun_fallback: true,
        })
    }

    async fn ice_servers(&self) -> Vec<RTCIceServer> {
        if let (Some(url), Some(turn)) = (&self.ice_server, &self.turn) {
            match turn.fetch().await {
                Ok(creds) => {
                    return vec![RTCIceServer {
                        urls: vec![url.clone()],
                        username: creds.username,
                        credential: creds.password,
                        ..Default::default()
                    }];
                }
                Err(e) => warn!("TURN credential fetch failed, falling back: {}", e),
            }
        }
        if self.stun_fallback {
            vec![RTCIceServer {
                urls: vec![FALLBACK_STUN_SERVER.to_owned()],
                ..Default::default()
            }]
        } else {
            Vec::new()
        }
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self) -> Result<PeerParts> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers().await,
            ..Default::default()
        };
        RtcPeer::new(config).await
    }
}
