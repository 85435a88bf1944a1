//! In-memory stand-ins for connections, the hub and media elements.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::capture::{CapturedStream, ElementPicker, MediaElement, PickError, StreamTrackEvent};
use crate::error::{Error, Result};
use crate::hub::{HubConnection, HubConnector, HubInbound, HubOutbound, HubState};
use crate::peer::{PeerConnection, PeerEvent, PeerFactory, PeerParts, SenderId, SourceTrack};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

pub(crate) fn audio_track(id: &str) -> SourceTrack {
    track(id, MIME_TYPE_OPUS)
}

pub(crate) fn video_track(id: &str) -> SourceTrack {
    track(id, MIME_TYPE_VP8)
}

fn track(id: &str, mime: &str) -> SourceTrack {
    SourceTrack::new(Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime.to_owned(),
            ..Default::default()
        },
        id.to_owned(),
        "radiowo".to_owned(),
    )))
}

pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub(crate) async fn wait_for<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond().await {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[derive(Default)]
struct FakeState {
    signaling: Option<RTCSignalingState>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    descriptions: u32,
    answers: u32,
    next_sender: u64,
    senders: HashMap<SenderId, String>,
    candidates: Vec<IceCandidate>,
    closed: bool,
    fail_local: bool,
    fail_add_track: bool,
    no_rollback: bool,
}

/// Signaling-state machine with browser semantics: implicit rollback on a
/// colliding remote offer, negotiation-needed after every track change.
/// `disable_rollback` makes it refuse the colliding offer instead, the way a
/// webrtc-rs connection does.
pub(crate) struct FakePeer {
    label: String,
    state: Mutex<FakeState>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl FakePeer {
    pub(crate) fn new(label: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            label: label.to_owned(),
            state: Mutex::new(FakeState::default()),
            events,
        });
        (peer, rx)
    }

    pub(crate) fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn signaling(&self) -> RTCSignalingState {
        self.state
            .lock()
            .unwrap()
            .signaling
            .unwrap_or(RTCSignalingState::Stable)
    }

    pub(crate) fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    pub(crate) fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    pub(crate) fn answers_created(&self) -> u32 {
        self.state.lock().unwrap().answers
    }

    /// Track ids currently bound to a sender, sorted.
    pub(crate) fn sent_tracks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().unwrap().senders.values().cloned().collect();
        ids.sort();
        ids
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    pub(crate) fn fail_next_local_description(&self) {
        self.state.lock().unwrap().fail_local = true;
    }

    pub(crate) fn fail_add_track(&self) {
        self.state.lock().unwrap().fail_add_track = true;
    }

    pub(crate) fn disable_rollback(&self) {
        self.state.lock().unwrap().no_rollback = true;
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    fn signaling_state(&self) -> RTCSignalingState {
        self.signaling()
    }

    async fn set_local_description(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::negotiation("connection closed"));
        }
        if std::mem::take(&mut state.fail_local) {
            return Err(Error::negotiation("injected failure"));
        }
        state.descriptions += 1;
        let current = state.signaling.unwrap_or(RTCSignalingState::Stable);
        let description = match current {
            RTCSignalingState::Stable => {
                state.signaling = Some(RTCSignalingState::HaveLocalOffer);
                SessionDescription::offer(format!("offer:{}:{}", self.label, state.descriptions))
            }
            RTCSignalingState::HaveRemoteOffer => {
                state.answers += 1;
                state.signaling = Some(RTCSignalingState::Stable);
                SessionDescription::answer(format!("answer:{}:{}", self.label, state.descriptions))
            }
            other => {
                return Err(Error::negotiation(format!(
                    "cannot create description in {other}"
                )))
            }
        };
        state.local = Some(description.clone());
        Ok(description)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::negotiation("connection closed"));
        }
        let current = state.signaling.unwrap_or(RTCSignalingState::Stable);
        match (desc.sdp_type, current) {
            (SdpType::Offer, RTCSignalingState::Stable) => {}
            (SdpType::Offer, RTCSignalingState::HaveLocalOffer) => {
                if state.no_rollback {
                    return Err(Error::negotiation("cannot roll back local offer"));
                }
                state.local = None;
            }
            (SdpType::Answer, RTCSignalingState::HaveLocalOffer) => {
                state.remote = Some(desc);
                state.signaling = Some(RTCSignalingState::Stable);
                return Ok(());
            }
            (kind, other) => {
                return Err(Error::negotiation(format!(
                    "cannot apply remote {kind:?} in {other}"
                )))
            }
        }
        state.remote = Some(desc);
        state.signaling = Some(RTCSignalingState::HaveRemoteOffer);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.remote.is_none() {
            return Err(Error::negotiation("no remote description"));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: SourceTrack) -> Result<SenderId> {
        let id = {
            let mut state = self.state.lock().unwrap();
            if state.closed || state.fail_add_track {
                return Err(Error::negotiation("add_track rejected"));
            }
            state.next_sender += 1;
            let id = SenderId(state.next_sender);
            state.senders.insert(id, track.id().to_owned());
            id
        };
        self.emit(PeerEvent::NegotiationNeeded);
        Ok(id)
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let removed = self.state.lock().unwrap().senders.remove(&sender);
        match removed {
            Some(_) => {
                self.emit(PeerEvent::NegotiationNeeded);
                Ok(())
            }
            None => Err(Error::negotiation("unknown sender")),
        }
    }

    async fn close(&self) -> Result<()> {
        let newly_closed = {
            let mut state = self.state.lock().unwrap();
            let newly = !state.closed;
            state.closed = true;
            state.signaling = Some(RTCSignalingState::Closed);
            newly
        };
        if newly_closed {
            self.emit(PeerEvent::ConnectionState(RTCPeerConnectionState::Closed));
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakePeerFactory {
    created: Mutex<Vec<Arc<FakePeer>>>,
    fail_next: AtomicBool,
    no_rollback: AtomicBool,
}

impl FakePeerFactory {
    pub(crate) fn created(&self) -> Vec<Arc<FakePeer>> {
        self.created.lock().unwrap().clone()
    }

    pub(crate) fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Peers created from now on refuse colliding offers.
    pub(crate) fn disable_rollback(&self) {
        self.no_rollback.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(&self) -> Result<PeerParts> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::negotiation("factory failure"));
        }
        let mut created = self.created.lock().unwrap();
        let (peer, events) = FakePeer::new(&format!("peer-{}", created.len() + 1));
        if self.no_rollback.load(Ordering::SeqCst) {
            peer.disable_rollback();
        }
        created.push(peer.clone());
        Ok(PeerParts {
            connection: peer,
            events,
        })
    }
}

/// The hub's side of one host connection.
pub(crate) struct FakeHubRemote {
    pub room_id: String,
    pub token: String,
    pub outbound: mpsc::UnboundedReceiver<HubOutbound>,
    pub inbound: mpsc::UnboundedSender<HubInbound>,
    pub state: Arc<watch::Sender<HubState>>,
}

impl FakeHubRemote {
    pub(crate) fn send(&self, from: &str, msg: &str) {
        self.inbound
            .send(HubInbound {
                from: from.to_owned(),
                msg: msg.to_owned(),
            })
            .expect("host is reading");
    }
}

#[derive(Default)]
pub(crate) struct FakeHub {
    remotes: Mutex<VecDeque<FakeHubRemote>>,
    refuse: AtomicBool,
}

impl FakeHub {
    pub(crate) fn take_remote(&self) -> FakeHubRemote {
        self.remotes
            .lock()
            .unwrap()
            .pop_front()
            .expect("a hub connection was made")
    }

    pub(crate) fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl HubConnector for FakeHub {
    async fn connect(&self, room_id: &str, auth_token: &str) -> Result<HubConnection> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(Error::ChannelClosed);
        }
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(HubState::Open);
        let state_tx = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let closer = state_tx.clone();
        tokio::spawn(async move {
            let _ = shutdown_rx.await;
            closer.send_replace(HubState::Closed);
        });

        self.remotes.lock().unwrap().push_back(FakeHubRemote {
            room_id: room_id.to_owned(),
            token: auth_token.to_owned(),
            outbound: outbound_rx,
            inbound: inbound_tx,
            state: state_tx,
        });

        Ok(HubConnection {
            outbound: outbound_tx,
            inbound: inbound_rx,
            state: state_rx,
            shutdown: shutdown_tx,
        })
    }
}

pub(crate) struct FakeElement {
    paused: AtomicBool,
    stream: Mutex<Option<CapturedStream>>,
}

impl FakeElement {
    /// An element whose stream starts with `tracks`; the returned sender
    /// mutates the stream afterwards.
    pub(crate) fn with_tracks(
        tracks: Vec<SourceTrack>,
    ) -> (Arc<Self>, mpsc::UnboundedSender<StreamTrackEvent>) {
        let (tx, events) = mpsc::unbounded_channel();
        let element = Arc::new(Self {
            paused: AtomicBool::new(false),
            stream: Mutex::new(Some(CapturedStream { tracks, events })),
        });
        (element, tx)
    }

    pub(crate) fn without_stream() -> Arc<Self> {
        Arc::new(Self {
            paused: AtomicBool::new(true),
            stream: Mutex::new(None),
        })
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }
}

impl MediaElement for FakeElement {
    fn capture_stream(&self) -> Option<CapturedStream> {
        self.stream.lock().unwrap().take()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

type PickResult = std::result::Result<Arc<dyn MediaElement>, PickError>;

/// Each `pick` waits for the test to resolve it through the returned sender.
#[derive(Default)]
pub(crate) struct FakePicker {
    pending: Mutex<VecDeque<oneshot::Receiver<PickResult>>>,
}

impl FakePicker {
    pub(crate) fn expect_pick(&self) -> oneshot::Sender<PickResult> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().push_back(rx);
        tx
    }
}

#[async_trait]
impl ElementPicker for FakePicker {
    async fn pick(&self) -> PickResult {
        let next = self.pending.lock().unwrap().pop_front();
        match next {
            Some(rx) => rx.await.unwrap_or(Err(PickError::Cancelled)),
            None => Err(PickError::Cancelled),
        }
    }
}
