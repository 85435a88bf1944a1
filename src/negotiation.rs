//! Perfect negotiation for a single connection.
//!
//! Exactly one side of every pair is polite. On an offer collision the
//! impolite side ignores the remote offer and keeps its own; the polite side
//! rolls its offer back and answers. Both sides converge without any extra
//! coordination.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::track::track_remote::TrackRemote;

use crate::connection::ConnectionMonitor;
use crate::error::{Error, Result};
use crate::peer::{PeerConnection, PeerEvent};
use crate::signaling::{IceCandidate, SignalingChannel, SignalingMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Politeness {
    /// Yields on offer collisions.
    Polite,
    /// Wins offer collisions by ignoring the remote offer.
    Impolite,
}

/// What a remote message did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// A remote answer (or pranswer) was applied.
    Applied,
    /// A remote offer was applied and answered.
    Answered,
    /// The remote offer collided with ours and we are impolite.
    CollisionIgnored,
    CandidateApplied,
    /// A candidate failed while an ignored offer is outstanding.
    LateCandidateDiscarded,
    EndOfCandidates,
}

/// Why [`NegotiationEngine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Closed,
    Failed,
    ChannelClosed,
    EventsClosed,
}

pub struct NegotiationEngine {
    peer_id: String,
    politeness: Politeness,
    making_offer: bool,
    ignore_offer: bool,
    connection: Arc<dyn PeerConnection>,
    channel: Arc<dyn SignalingChannel>,
    monitor: ConnectionMonitor,
    track_sink: Option<mpsc::UnboundedSender<Arc<TrackRemote>>>,
}

impl NegotiationEngine {
    pub fn new(
        peer_id: impl Into<String>,
        politeness: Politeness,
        connection: Arc<dyn PeerConnection>,
        channel: Arc<dyn SignalingChannel>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            politeness,
            making_offer: false,
            ignore_offer: false,
            connection,
            channel,
            monitor: ConnectionMonitor::new(),
            track_sink: None,
        }
    }

    /// Inbound remote tracks are handed to `sink` as they arrive.
    pub fn with_track_sink(mut self, sink: mpsc::UnboundedSender<Arc<TrackRemote>>) -> Self {
        self.track_sink = Some(sink);
        self
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn politeness(&self) -> Politeness {
        self.politeness
    }

    pub fn making_offer(&self) -> bool {
        self.making_offer
    }

    pub fn ignore_offer(&self) -> bool {
        self.ignore_offer
    }

    pub fn monitor(&self) -> ConnectionMonitor {
        self.monitor.clone()
    }

    /// Outside `stable` the request is dropped; the connection raises it
    /// again once negotiation settles.
    pub async fn on_negotiation_needed(&mut self) -> Result<()> {
        let state = self.connection.signaling_state();
        if state != RTCSignalingState::Stable {
            debug!(peer = %self.peer_id, %state, "deferring negotiation until stable");
            return Ok(());
        }
        self.making_offer = true;
        let result = self.send_local_description().await;
        self.making_offer = false;
        result
    }

    async fn send_local_description(&mut self) -> Result<()> {
        let description = self.connection.set_local_description().await?;
        self.sync_signaling_state();
        debug!(peer = %self.peer_id, kind = ?description.sdp_type, "sending local description");
        self.channel
            .send(SignalingMessage::Description(description))
            .await
    }

    /// `None` tells the remote side gathering is complete.
    pub async fn on_local_ice_candidate(&self, candidate: Option<IceCandidate>) -> Result<()> {
        self.channel.send(SignalingMessage::Candidate(candidate)).await
    }

    pub async fn on_remote_message(&mut self, message: SignalingMessage) -> Result<RemoteOutcome> {
        match message {
            SignalingMessage::Description(description) => {
                let is_offer = description.is_offer();
                let offer_collision = is_offer
                    && (self.making_offer
                        || self.connection.signaling_state() != RTCSignalingState::Stable);

                self.ignore_offer = self.politeness == Politeness::Impolite && offer_collision;
                if self.ignore_offer {
                    debug!(peer = %self.peer_id, "ignoring colliding remote offer");
                    return Ok(RemoteOutcome::CollisionIgnored);
                }

                self.connection.set_remote_description(description).await?;
                if !is_offer {
                    self.sync_signaling_state();
                    return Ok(RemoteOutcome::Applied);
                }

                let answer = self.connection.set_local_description().await?;
                self.sync_signaling_state();
                self.channel
                    .send(SignalingMessage::Description(answer))
                    .await?;
                Ok(RemoteOutcome::Answered)
            }
            SignalingMessage::Candidate(None) => Ok(RemoteOutcome::EndOfCandidates),
            SignalingMessage::Candidate(Some(candidate)) => {
                match self.connection.add_ice_candidate(candidate).await {
                    Ok(()) => Ok(RemoteOutcome::CandidateApplied),
                    Err(e) if self.ignore_offer => {
                        debug!(peer = %self.peer_id, "discarding late candidate: {}", e);
                        Ok(RemoteOutcome::LateCandidateDiscarded)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Drives the session until its connection closes or fails, or its
    /// remote channel goes away. Events are handled one at a time, so the
    /// offer flags never see concurrent handlers. Queued remote messages go
    /// first: an offer that is already waiting is answered before we start
    /// one of our own, which keeps a polite side out of a rollback.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        mut remote: mpsc::UnboundedReceiver<SignalingMessage>,
    ) -> Termination {
        let reason = loop {
            tokio::select! {
                biased;
                message = remote.recv() => match message {
                    Some(message) => self.dispatch_remote(message).await,
                    None => break Termination::ChannelClosed,
                },
                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(reason) = self.on_peer_event(event).await {
                            break reason;
                        }
                    }
                    None => break Termination::EventsClosed,
                },
            }
        };

        if let Err(e) = self.connection.close().await {
            warn!(peer = %self.peer_id, "error closing connection: {}", e);
        }
        info!(peer = %self.peer_id, ?reason, "negotiation stopped");
        reason
    }

    async fn on_peer_event(&mut self, event: PeerEvent) -> Option<Termination> {
        match event {
            PeerEvent::NegotiationNeeded => {
                if let Err(e) = self.on_negotiation_needed().await {
                    self.report(e);
                }
            }
            PeerEvent::IceCandidate(candidate) => {
                if let Err(e) = self.on_local_ice_candidate(candidate).await {
                    self.report(e);
                }
            }
            PeerEvent::ConnectionState(state) => {
                info!(peer = %self.peer_id, "connection state: {}", state);
                self.monitor.update_peer_state(state);
                match state {
                    RTCPeerConnectionState::Closed => return Some(Termination::Closed),
                    RTCPeerConnectionState::Failed => return Some(Termination::Failed),
                    _ => {}
                }
            }
            PeerEvent::IceConnectionState(state) => {
                debug!(peer = %self.peer_id, "ice connection state: {}", state);
                self.monitor.update_ice_state(state);
                match state {
                    RTCIceConnectionState::Closed => return Some(Termination::Closed),
                    RTCIceConnectionState::Failed => return Some(Termination::Failed),
                    _ => {}
                }
            }
            PeerEvent::Track(track) => match &self.track_sink {
                Some(sink) => {
                    let _ = sink.send(track);
                }
                None => debug!(peer = %self.peer_id, "dropping unexpected remote track"),
            },
        }
        None
    }

    async fn dispatch_remote(&mut self, message: SignalingMessage) {
        match self.on_remote_message(message).await {
            Ok(outcome) => debug!(peer = %self.peer_id, ?outcome, "remote message handled"),
            Err(e) => self.report(e),
        }
    }

    fn sync_signaling_state(&self) {
        self.monitor
            .update_signaling_state(self.connection.signaling_state());
    }

    fn report(&self, error: Error) {
        warn!(peer = %self.peer_id, "negotiation error: {}", error);
        self.monitor.set_error(error.to_string());
    }
}
