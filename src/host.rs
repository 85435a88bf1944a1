//! The host process: room control plus the receiving end of every capture
//! session's direct channel.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::hub::WsHubConnector;
use crate::negotiation::{NegotiationEngine, Politeness, Termination};
use crate::peer::{PeerFactory, SourceTrack};
use crate::room::RoomManager;
use crate::signaling::{direct_pair, DirectPort};
use crate::webrtc::RtcPeerFactory;

/// Opens direct channels to the host, one per capture session.
#[derive(Clone)]
pub struct HostConnector {
    ports: mpsc::UnboundedSender<DirectPort>,
}

impl HostConnector {
    /// Returns the caller's end; the host's end goes to the ingest loop.
    pub fn connect(&self, name: &str) -> Result<DirectPort> {
        let (local, host) = direct_pair(name);
        self.ports.send(host).map_err(|_| Error::ChannelClosed)?;
        Ok(local)
    }
}

pub fn host_channel() -> (HostConnector, mpsc::UnboundedReceiver<DirectPort>) {
    let (ports, rx) = mpsc::unbounded_channel();
    (HostConnector { ports }, rx)
}

/// Accepts capture connections and publishes their audio to the room.
#[derive(Clone)]
pub struct CaptureIngest {
    rooms: RoomManager,
    peers: Arc<dyn PeerFactory>,
}

impl CaptureIngest {
    pub fn new(rooms: RoomManager, peers: Arc<dyn PeerFactory>) -> Self {
        Self { rooms, peers }
    }

    pub async fn run(self, mut ports: mpsc::UnboundedReceiver<DirectPort>) {
        while let Some(port) = ports.recv().await {
            let ingest = self.clone();
            tokio::spawn(async move {
                let name = port.name().to_owned();
                match ingest.accept(port).await {
                    Ok(reason) => info!(session = %name, ?reason, "capture session ended"),
                    Err(e) => warn!(session = %name, "capture session failed: {}", e),
                }
            });
        }
        debug!("host connector closed");
    }

    /// Negotiates as the polite side until the capture connection ends.
    /// Every audio track it delivers is forwarded into the room for as long
    /// as it lives.
    pub async fn accept(&self, port: DirectPort) -> Result<Termination> {
        let name = port.name().to_owned();
        let parts = self.peers.create().await?;
        let (channel, remote) = port.into_parts();
        let (sink, mut tracks) = mpsc::unbounded_channel();
        let engine = NegotiationEngine::new(name.clone(), Politeness::Polite, parts.connection, channel)
            .with_track_sink(sink);
        let mut session = tokio::spawn(engine.run(parts.events, remote));
        info!(session = %name, "capture session connected");

        let mut forwarders = JoinSet::new();
        let mut track_ids = Vec::new();
        let ended = loop {
            tokio::select! {
                Some(remote) = tracks.recv() => {
                    if remote.kind() != RTPCodecType::Audio {
                        debug!(session = %name, "ignoring non-audio capture track");
                        continue;
                    }
                    let local = Arc::new(TrackLocalStaticRTP::new(
                        remote.codec().capability,
                        remote.id(),
                        remote.stream_id(),
                    ));
                    info!(session = %name, track = local.id(), "capture track arrived");
                    track_ids.push(local.id().to_owned());
                    self.rooms.on_track_added(SourceTrack::new(local.clone())).await;
                    forwarders.spawn(forward_rtp(self.rooms.clone(), remote, local));
                }
                joined = &mut session => {
                    break joined.map_err(|e| Error::negotiation(format!("capture session task: {e}")));
                }
            }
        };

        forwarders.shutdown().await;
        for id in &track_ids {
            self.rooms.on_track_removed(id).await;
        }
        ended
    }
}

/// Copies RTP from a capture track to its local copy until the capture
/// track ends, then withdraws the copy from the room.
async fn forward_rtp(rooms: RoomManager, remote: Arc<TrackRemote>, local: Arc<TrackLocalStaticRTP>) {
    loop {
        match remote.read_rtp().await {
            Ok((packet, _)) => {
                if let Err(e) = local.write_rtp(&packet).await {
                    debug!(track = local.id(), "rtp write failed: {}", e);
                }
            }
            Err(e) => {
                debug!(track = local.id(), "capture track ended: {}", e);
                break;
            }
        }
    }
    rooms.on_track_removed(local.id()).await;
}

/// Room control and capture ingest wired to real connections.
pub struct Host {
    rooms: RoomManager,
    connector: HostConnector,
    ingest: JoinHandle<()>,
}

impl Host {
    pub fn new(rooms: RoomManager, capture_peers: Arc<dyn PeerFactory>) -> Self {
        let (connector, ports) = host_channel();
        let ingest = tokio::spawn(CaptureIngest::new(rooms.clone(), capture_peers).run(ports));
        Self {
            rooms,
            connector,
            ingest,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let rooms = RoomManager::new(
            Arc::new(WsHubConnector::new(settings.ws_server.clone())),
            Arc::new(RtcPeerFactory::for_listeners(settings)?),
            settings.ws_keepalive,
        );
        Ok(Self::new(rooms, Arc::new(RtcPeerFactory::local())))
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn connector(&self) -> HostConnector {
        self.connector.clone()
    }

    pub async fn shutdown(self) {
        self.rooms.stop_room().await;
        self.ingest.abort();
    }
}
