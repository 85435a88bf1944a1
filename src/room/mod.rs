//! The host's single active room: its hub connection, its listeners and the
//! fanout of captured tracks to them.

mod state;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::connection::ConnectionStatus;
use crate::control::{ControlCommand, ControlResponse};
use crate::error::{Error, Result};
use crate::fanout::TrackFanout;
use crate::hub::{spawn_keepalive, HubConnector, HubInbound, RelayChannel};
use crate::negotiation::{NegotiationEngine, Politeness};
use crate::peer::{PeerFactory, SourceTrack};
use crate::signaling::SignalingMessage;
use state::{ListenerHandle, Room};

#[derive(Default)]
struct RoomInner {
    room: Option<Room>,
    fanout: TrackFanout,
    epoch: u64,
}

/// At most one room is active at a time. Room, listener table and fanout
/// sit behind one lock so a listener join and a track change never
/// interleave.
#[derive(Clone)]
pub struct RoomManager {
    inner: Arc<Mutex<RoomInner>>,
    hub: Arc<dyn HubConnector>,
    peers: Arc<dyn PeerFactory>,
    keepalive: Duration,
}

impl RoomManager {
    pub fn new(hub: Arc<dyn HubConnector>, peers: Arc<dyn PeerFactory>, keepalive: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RoomInner::default())),
            hub,
            peers,
            keepalive,
        }
    }

    pub async fn start_room(&self, room_id: &str, auth_token: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(active) = &inner.room {
            warn!(active = %active.id, requested = room_id, "a room is already active");
            return Err(Error::AlreadyActive);
        }

        let hub = self.hub.connect(room_id, auth_token).await?;
        inner.epoch += 1;
        let epoch = inner.epoch;

        spawn_keepalive(hub.outbound.clone(), hub.state.clone(), self.keepalive);
        tokio::spawn(self.clone().dispatch(epoch, hub.inbound));

        inner.room = Some(Room::new(
            room_id.to_owned(),
            epoch,
            hub.outbound,
            hub.state,
            hub.shutdown,
        ));
        info!(room = room_id, "room started");
        Ok(())
    }

    /// Closes every listener and the hub connection. A no-op when idle.
    pub async fn stop_room(&self) {
        let mut inner = self.inner.lock().await;
        let RoomInner { room, fanout, .. } = &mut *inner;
        match room.take() {
            Some(room) => {
                info!(room = %room.id, "stopping room");
                room.close(fanout).await;
            }
            None => debug!("no active room to stop"),
        }
    }

    pub async fn query_room(&self) -> Option<String> {
        self.inner.lock().await.room.as_ref().map(|room| room.id.clone())
    }

    pub async fn on_track_added(&self, track: SourceTrack) {
        info!(track = track.id(), "source track added");
        self.inner.lock().await.fanout.on_track_added(track).await;
    }

    pub async fn on_track_removed(&self, track_id: &str) {
        info!(track = track_id, "source track removed");
        self.inner.lock().await.fanout.on_track_removed(track_id).await;
    }

    pub async fn listener_ids(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<String> = inner
            .room
            .as_ref()
            .map(|room| room.listeners.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Track ids currently sent to `listener`.
    pub async fn listener_tracks(&self, listener: &str) -> Option<Vec<String>> {
        self.inner.lock().await.fanout.bound_tracks(listener)
    }

    pub async fn listener_status(&self, listener: &str) -> Option<ConnectionStatus> {
        let inner = self.inner.lock().await;
        let room = inner.room.as_ref()?;
        room.listeners.get(listener).map(|l| l.monitor.current())
    }

    pub async fn handle_command(&self, command: ControlCommand) -> ControlResponse {
        match command {
            ControlCommand::StartRoom {
                room_id,
                auth_token,
            } => match self.start_room(&room_id, &auth_token).await {
                Ok(()) => ControlResponse::ActionResponse { success: true },
                Err(e) => {
                    warn!(room = %room_id, "failed to start room: {}", e);
                    ControlResponse::ActionResponse { success: false }
                }
            },
            ControlCommand::StopRoom => {
                self.stop_room().await;
                ControlResponse::ActionResponse { success: true }
            }
            ControlCommand::QueryRoom => ControlResponse::RoomInfo {
                room_id: self.query_room().await,
            },
        }
    }

    async fn dispatch(self, epoch: u64, mut inbound: mpsc::UnboundedReceiver<HubInbound>) {
        while let Some(envelope) = inbound.recv().await {
            if !self.route(epoch, envelope).await {
                return;
            }
        }
        self.teardown(epoch).await;
    }

    /// Returns false once the room this dispatcher belongs to is gone.
    /// Connections are built without holding the room lock, so control
    /// commands stay responsive while TURN credentials are fetched.
    async fn route(&self, epoch: u64, envelope: HubInbound) -> bool {
        let HubInbound { from, msg } = envelope;
        let message = {
            let inner = self.inner.lock().await;
            let Some(room) = inner.room.as_ref().filter(|r| r.epoch == epoch) else {
                debug!(listener = %from, "dropping message for a closed room");
                return false;
            };
            if !room.hub_open() {
                debug!(listener = %from, "hub closed, dropping message");
                return true;
            }

            let message = match SignalingMessage::from_json(&msg) {
                Ok(message) => message,
                Err(e) => {
                    warn!(listener = %from, "dropping malformed listener message: {}", e);
                    return true;
                }
            };

            if let Some(listener) = room.listeners.get(&from) {
                if listener.inbound.send(message).is_err() {
                    debug!(listener = %from, "listener session already ended");
                }
                return true;
            }
            message
        };

        let parts = match self.peers.create().await {
            Ok(parts) => parts,
            Err(e) => {
                warn!(listener = %from, "failed to create listener connection: {}", e);
                return true;
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.room.as_ref().map(|r| r.epoch) != Some(epoch) {
            drop(inner);
            debug!(listener = %from, "room closed while connecting listener");
            if let Err(e) = parts.connection.close().await {
                warn!(listener = %from, "error closing listener connection: {}", e);
            }
            return false;
        }
        let RoomInner { room, fanout, .. } = &mut *inner;
        let Some(room) = room.as_mut() else {
            return false;
        };
        info!(room = %room.id, listener = %from, "listener joined");
        fanout.attach_listener(&from, parts.connection.clone()).await;

        let (inbound, remote) = mpsc::unbounded_channel();
        let channel = Arc::new(RelayChannel::new(from.clone(), room.outbound.clone()));
        let engine = NegotiationEngine::new(
            from.clone(),
            Politeness::Polite,
            parts.connection.clone(),
            channel,
        );
        let monitor = engine.monitor();
        let manager = self.clone();
        let id = from.clone();
        let events = parts.events;
        let task = tokio::spawn(async move {
            let reason = engine.run(events, remote).await;
            debug!(listener = %id, ?reason, "listener session ended");
            manager.remove_listener(epoch, &id).await;
        });

        let _ = inbound.send(message);
        room.listeners.insert(
            from,
            ListenerHandle {
                inbound,
                connection: parts.connection,
                monitor,
                task,
            },
        );
        true
    }

    /// Safe to call more than once for the same listener. Called from the
    /// listener's own task, so that task is left to finish by itself.
    async fn remove_listener(&self, epoch: u64, listener: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let RoomInner { room, fanout, .. } = &mut *inner;
        let Some(room) = room.as_mut().filter(|r| r.epoch == epoch) else {
            return false;
        };
        let Some(handle) = room.listeners.remove(listener) else {
            debug!(listener, "listener already removed");
            return false;
        };
        fanout.detach_listener(listener);
        if let Err(e) = handle.connection.close().await {
            warn!(listener, "error closing listener connection: {}", e);
        }
        info!(room = %room.id, listener, "listener left");
        true
    }

    /// The hub connection ended on its own.
    async fn teardown(&self, epoch: u64) {
        let mut inner = self.inner.lock().await;
        let RoomInner { room, fanout, .. } = &mut *inner;
        if room.as_ref().map(|r| r.epoch) != Some(epoch) {
            return;
        }
        if let Some(room) = room.take() {
            warn!(room = %room.id, "hub connection lost, closing room");
            room.close(fanout).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{HubOutbound, HubState};
    use crate::peer::{PeerEvent, PeerFactory, PeerParts};
    use crate::signaling::{IceCandidate, SdpType, SessionDescription, SignalingChannel};
    use crate::testing::{
        audio_track, wait_for, wait_until, FakeHub, FakeHubRemote, FakePeer, FakePeerFactory,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
    use webrtc::peer_connection::signaling_state::RTCSignalingState;

    /// Never finishes building a connection, like a TURN request that hangs.
    #[derive(Default)]
    struct StalledPeers {
        called: AtomicBool,
    }

    #[async_trait]
    impl PeerFactory for StalledPeers {
        async fn create(&self) -> Result<PeerParts> {
            self.called.store(true, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    /// A listener's uplink: everything it sends reaches the host through the hub.
    struct ListenerUplink {
        from: String,
        hub: mpsc::UnboundedSender<HubInbound>,
    }

    #[async_trait]
    impl SignalingChannel for ListenerUplink {
        async fn send(&self, msg: SignalingMessage) -> Result<()> {
            self.hub
                .send(HubInbound {
                    from: self.from.clone(),
                    msg: msg.to_json()?,
                })
                .map_err(|_| Error::ChannelClosed)
        }
    }

    fn manager() -> (RoomManager, Arc<FakeHub>, Arc<FakePeerFactory>) {
        let hub = Arc::new(FakeHub::default());
        let peers = Arc::new(FakePeerFactory::default());
        let rooms = RoomManager::new(hub.clone(), peers.clone(), Duration::from_secs(10));
        (rooms, hub, peers)
    }

    fn listener_offer() -> String {
        SignalingMessage::Description(SessionDescription::offer("listener-offer"))
            .to_json()
            .unwrap()
    }

    fn candidate() -> String {
        SignalingMessage::Candidate(Some(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host")))
            .to_json()
            .unwrap()
    }

    async fn next_answer_for(remote: &mut FakeHubRemote, listener: &str) -> SessionDescription {
        loop {
            match remote.outbound.recv().await.expect("hub open") {
                HubOutbound::ToListener { to, msg } => {
                    assert_eq!(to, listener);
                    if let SignalingMessage::Description(desc) =
                        SignalingMessage::from_json(&msg).unwrap()
                    {
                        if desc.sdp_type == SdpType::Answer {
                            return desc;
                        }
                    }
                }
                HubOutbound::KeepAlive => {}
            }
        }
    }

    #[tokio::test]
    async fn second_start_is_rejected_and_stop_is_idempotent() {
        let (rooms, hub, _peers) = manager();
        let start = |room: &str| ControlCommand::StartRoom {
            room_id: room.into(),
            auth_token: "T".into(),
        };

        assert_eq!(
            rooms.handle_command(start("R1")).await,
            ControlResponse::ActionResponse { success: true }
        );
        let remote = hub.take_remote();
        assert_eq!(remote.room_id, "R1");
        assert_eq!(remote.token, "T");

        assert_eq!(
            rooms.handle_command(start("R2")).await,
            ControlResponse::ActionResponse { success: false }
        );
        assert_eq!(
            rooms.handle_command(ControlCommand::QueryRoom).await,
            ControlResponse::RoomInfo {
                room_id: Some("R1".into())
            }
        );

        rooms.stop_room().await;
        wait_until(|| *remote.state.borrow() == HubState::Closed).await;
        assert_eq!(rooms.query_room().await, None);
        assert_eq!(
            rooms.handle_command(ControlCommand::StopRoom).await,
            ControlResponse::ActionResponse { success: true }
        );

        rooms.start_room("R2", "T").await.unwrap();
        assert_eq!(hub.take_remote().room_id, "R2");
    }

    #[tokio::test]
    async fn refused_hub_leaves_host_idle() {
        let (rooms, hub, _peers) = manager();
        hub.refuse();
        assert!(rooms.start_room("R1", "T").await.is_err());
        assert_eq!(rooms.query_room().await, None);
    }

    #[tokio::test]
    async fn listener_receives_live_tracks_and_later_changes() {
        let (rooms, hub, peers) = manager();
        rooms.start_room("R1", "T").await.unwrap();
        let mut remote = hub.take_remote();
        rooms.on_track_added(audio_track("A")).await;

        remote.send("L1", &listener_offer());
        wait_until(|| peers.created().len() == 1).await;
        let l1 = peers.created()[0].clone();
        wait_until(|| l1.sent_tracks() == vec!["A"]).await;

        let answer = next_answer_for(&mut remote, "L1").await;
        assert!(answer.sdp.starts_with("answer:"));

        rooms.on_track_added(audio_track("B")).await;
        assert_eq!(l1.sent_tracks(), vec!["A", "B"]);
        rooms.on_track_removed("A").await;
        assert_eq!(l1.sent_tracks(), vec!["B"]);
        assert_eq!(rooms.listener_tracks("L1").await, Some(vec!["B".to_string()]));
    }

    #[tokio::test]
    async fn repeat_messages_reuse_the_listener_session() {
        let (rooms, hub, peers) = manager();
        rooms.start_room("R1", "T").await.unwrap();
        let remote = hub.take_remote();

        remote.send("L1", &listener_offer());
        remote.send("L1", &candidate());
        remote.send("L1", &candidate());
        remote.send("L2", &listener_offer());
        wait_until(|| peers.created().len() == 2).await;

        let rooms_ref = &rooms;
        wait_for(move || async move { rooms_ref.listener_ids().await.len() == 2 }).await;
        assert_eq!(rooms.listener_ids().await, vec!["L1", "L2"]);
        assert_eq!(peers.created().len(), 2);
    }

    #[tokio::test]
    async fn malformed_message_creates_no_session() {
        let (rooms, hub, peers) = manager();
        rooms.start_room("R1", "T").await.unwrap();
        let remote = hub.take_remote();

        remote.send("L1", "this is a test for R1");
        remote.send("L2", &listener_offer());
        wait_until(|| peers.created().len() == 1).await;

        let rooms_ref = &rooms;
        wait_for(move || async move { !rooms_ref.listener_ids().await.is_empty() }).await;
        assert_eq!(rooms.listener_ids().await, vec!["L2"]);
    }

    #[tokio::test]
    async fn failed_listener_is_cleaned_up_once() {
        let (rooms, hub, peers) = manager();
        rooms.start_room("R1", "T").await.unwrap();
        let remote = hub.take_remote();
        rooms.on_track_added(audio_track("A")).await;

        remote.send("L1", &listener_offer());
        wait_until(|| peers.created().len() == 1).await;
        let l1 = peers.created()[0].clone();
        let rooms_ref = &rooms;
        wait_for(move || async move { rooms_ref.listener_ids().await.len() == 1 }).await;
        assert!(rooms.listener_status("L1").await.is_some());

        l1.emit(PeerEvent::ConnectionState(RTCPeerConnectionState::Failed));
        l1.emit(PeerEvent::ConnectionState(RTCPeerConnectionState::Failed));
        wait_for(move || async move { rooms_ref.listener_ids().await.is_empty() }).await;

        assert!(l1.is_closed());
        assert_eq!(rooms.listener_tracks("L1").await, None);
        let epoch = rooms.inner.lock().await.epoch;
        assert!(!rooms.remove_listener(epoch, "L1").await);

        rooms.on_track_added(audio_track("B")).await;
        assert_eq!(l1.sent_tracks(), vec!["A"]);
        assert_eq!(rooms.query_room().await, Some("R1".into()));
    }

    #[tokio::test]
    async fn hub_disconnect_destroys_the_room() {
        let (rooms, hub, peers) = manager();
        rooms.start_room("R1", "T").await.unwrap();
        let remote = hub.take_remote();
        remote.send("L1", &listener_offer());
        wait_until(|| peers.created().len() == 1).await;
        let l1 = peers.created()[0].clone();

        drop(remote);
        let rooms_ref = &rooms;
        wait_for(move || async move { rooms_ref.query_room().await.is_none() }).await;
        wait_until(|| l1.is_closed()).await;
        assert!(rooms.listener_ids().await.is_empty());

        rooms.start_room("R1", "T").await.unwrap();
        assert_eq!(rooms.query_room().await, Some("R1".into()));
    }

    #[tokio::test]
    async fn failed_connection_does_not_block_the_next_join() {
        let (rooms, hub, peers) = manager();
        rooms.start_room("R1", "T").await.unwrap();
        let remote = hub.take_remote();

        peers.fail_next();
        remote.send("L1", &listener_offer());
        remote.send("L1", &listener_offer());
        wait_until(|| peers.created().len() == 1).await;

        let rooms_ref = &rooms;
        wait_for(move || async move { rooms_ref.listener_ids().await == vec!["L1"] }).await;
        assert_eq!(rooms.query_room().await, Some("R1".into()));
    }

    #[tokio::test]
    async fn slow_connection_setup_does_not_block_control() {
        let hub = Arc::new(FakeHub::default());
        let peers = Arc::new(StalledPeers::default());
        let rooms = RoomManager::new(hub.clone(), peers.clone(), Duration::from_secs(10));
        rooms.start_room("R1", "T").await.unwrap();
        let remote = hub.take_remote();

        remote.send("L1", &listener_offer());
        wait_until(|| peers.called.load(Ordering::SeqCst)).await;

        let query = tokio::time::timeout(Duration::from_secs(1), rooms.query_room()).await;
        assert_eq!(query.unwrap(), Some("R1".into()));
        tokio::time::timeout(Duration::from_secs(1), rooms.stop_room())
            .await
            .expect("stop_room returned");
        assert_eq!(rooms.query_room().await, None);
        assert!(rooms.listener_ids().await.is_empty());
    }

    #[tokio::test]
    async fn listener_offer_wins_over_pending_track_negotiation() {
        let (rooms, hub, peers) = manager();
        peers.disable_rollback();
        rooms.start_room("R1", "T").await.unwrap();
        let mut remote = hub.take_remote();
        rooms.on_track_added(audio_track("A")).await;

        let (listener, listener_events) = FakePeer::new("listener");
        let uplink = Arc::new(ListenerUplink {
            from: "L1".into(),
            hub: remote.inbound.clone(),
        });
        let (downlink, listener_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(envelope) = remote.outbound.recv().await {
                if let HubOutbound::ToListener { msg, .. } = envelope {
                    if downlink.send(SignalingMessage::from_json(&msg).unwrap()).is_err() {
                        break;
                    }
                }
            }
        });

        let mut engine = NegotiationEngine::new("L1", Politeness::Impolite, listener.clone(), uplink);
        engine.on_negotiation_needed().await.unwrap();
        let listener_task = tokio::spawn(engine.run(listener_events, listener_rx));

        wait_until(|| peers.created().len() == 1).await;
        let host = peers.created()[0].clone();
        wait_until(|| host.sent_tracks() == vec!["A"]).await;

        // The listener's offer is answered first, then the host offers its
        // track on a stable connection.
        wait_until(|| {
            host.local_description()
                .is_some_and(|desc| desc.sdp_type == SdpType::Offer)
                && host.signaling() == RTCSignalingState::Stable
                && listener.signaling() == RTCSignalingState::Stable
                && listener.remote_description() == host.local_description()
                && host.remote_description() == listener.local_description()
        })
        .await;
        assert_eq!(host.answers_created(), 1);
        assert_eq!(listener.answers_created(), 1);
        let status = rooms.listener_status("L1").await.expect("listener session");
        assert_eq!(status.last_error, None);

        listener_task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_runs_only_while_room_is_open() {
        let (rooms, hub, _peers) = manager();
        rooms.start_room("R1", "T").await.unwrap();
        let mut remote = hub.take_remote();

        assert_eq!(remote.outbound.recv().await, Some(HubOutbound::KeepAlive));

        rooms.stop_room().await;
        let after = tokio::time::timeout(Duration::from_secs(11), remote.outbound.recv()).await;
        assert!(!matches!(after, Ok(Some(HubOutbound::KeepAlive))));
    }
}
