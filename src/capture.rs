//! Capture-side sessions: one connection to the host per chosen media
//! element, mirroring the element's audio tracks onto that connection.

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionMonitor, ConnectionStatus};
use crate::control::{ContentCommand, ContentReply, PlayStatus, StreamId};
use crate::error::{Error, Result};
use crate::host::HostConnector;
use crate::negotiation::{NegotiationEngine, Politeness, Termination};
use crate::peer::{PeerConnection, PeerFactory, SenderId, SourceTrack};

const PORT_SUFFIX_LEN: usize = 10;

#[derive(Debug, Clone)]
pub enum StreamTrackEvent {
    Added(SourceTrack),
    Removed(SourceTrack),
}

/// A media element's captured stream: its tracks at capture time, then
/// every later change to the track set.
pub struct CapturedStream {
    pub tracks: Vec<SourceTrack>,
    pub events: mpsc::UnboundedReceiver<StreamTrackEvent>,
}

pub trait MediaElement: Send + Sync {
    /// `None` when the element cannot be captured.
    fn capture_stream(&self) -> Option<CapturedStream>;
    fn is_paused(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PickError {
    #[error("element selection was cancelled")]
    Cancelled,
    #[error("no media element at the selected point")]
    NoMediaElement,
}

/// Lets the user point at a media element on the page.
#[async_trait]
pub trait ElementPicker: Send + Sync {
    async fn pick(&self) -> std::result::Result<Arc<dyn MediaElement>, PickError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChooseOutcome {
    Started(StreamId),
    /// Another pick is still pending.
    Busy,
    Cancelled,
}

fn port_name(id: StreamId) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PORT_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{id}-{suffix}")
}

pub struct LocalCaptureSession {
    id: StreamId,
    port_name: String,
    element: Arc<dyn MediaElement>,
    connection: Arc<dyn PeerConnection>,
    monitor: ConnectionMonitor,
    engine: JoinHandle<()>,
    mirror: JoinHandle<()>,
    ended: Option<oneshot::Receiver<Termination>>,
}

impl LocalCaptureSession {
    pub async fn start(
        id: StreamId,
        element: Arc<dyn MediaElement>,
        peers: &dyn PeerFactory,
        host: &HostConnector,
    ) -> Result<Self> {
        let stream = element
            .capture_stream()
            .ok_or_else(|| Error::CaptureUnavailable(format!("stream {id}")))?;

        let port_name = port_name(id);
        let port = host.connect(&port_name)?;
        let parts = peers.create().await?;
        let (channel, remote) = port.into_parts();
        let engine = NegotiationEngine::new(
            port_name.clone(),
            Politeness::Impolite,
            parts.connection.clone(),
            channel,
        );
        let monitor = engine.monitor();

        let mut senders = HashMap::new();
        for track in stream.tracks.into_iter().filter(SourceTrack::is_audio) {
            add_sender(&port_name, parts.connection.as_ref(), &mut senders, track).await;
        }
        info!(stream = id, port = %port_name, tracks = senders.len(), "capture session started");

        let (ended_tx, ended) = oneshot::channel();
        let events = parts.events;
        let engine = tokio::spawn(async move {
            let _ = ended_tx.send(engine.run(events, remote).await);
        });
        let mirror = tokio::spawn(mirror_tracks(
            port_name.clone(),
            parts.connection.clone(),
            senders,
            stream.events,
        ));

        Ok(Self {
            id,
            port_name,
            element,
            connection: parts.connection,
            monitor,
            engine,
            mirror,
            ended: Some(ended),
        })
    }

    /// Resolves when the connection ends without `stop` being called. Can
    /// be taken once.
    pub fn take_ended(&mut self) -> Option<oneshot::Receiver<Termination>> {
        self.ended.take()
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    pub fn status(&self) -> PlayStatus {
        if self.element.is_paused() {
            PlayStatus::Paused
        } else {
            PlayStatus::Playing
        }
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.monitor.current()
    }

    pub async fn stop(self) {
        self.mirror.abort();
        self.engine.abort();
        if let Err(e) = self.connection.close().await {
            warn!(stream = self.id, "error closing capture connection: {}", e);
        }
        info!(stream = self.id, "capture session stopped");
    }
}

async fn add_sender(
    session: &str,
    connection: &dyn PeerConnection,
    senders: &mut HashMap<String, SenderId>,
    track: SourceTrack,
) {
    if senders.contains_key(track.id()) {
        return;
    }
    match connection.add_track(track.clone()).await {
        Ok(sender) => {
            senders.insert(track.id().to_owned(), sender);
        }
        Err(e) => warn!(session, track = track.id(), "failed to add capture track: {}", e),
    }
}

/// Keeps the connection's senders in step with the captured stream. Video
/// tracks are ignored.
async fn mirror_tracks(
    session: String,
    connection: Arc<dyn PeerConnection>,
    mut senders: HashMap<String, SenderId>,
    mut events: mpsc::UnboundedReceiver<StreamTrackEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            StreamTrackEvent::Added(track) if track.is_audio() => {
                debug!(session = %session, track = track.id(), "stream added track");
                add_sender(&session, connection.as_ref(), &mut senders, track).await;
            }
            StreamTrackEvent::Removed(track) if track.is_audio() => {
                debug!(session = %session, track = track.id(), "stream removed track");
                let Some(sender) = senders.remove(track.id()) else {
                    continue;
                };
                if let Err(e) = connection.remove_track(sender).await {
                    warn!(session = %session, track = track.id(), "failed to remove capture track: {}", e);
                }
            }
            _ => {}
        }
    }
    debug!(session = %session, "captured stream ended");
}

struct CaptureInner {
    choosing: AtomicBool,
    next_id: AtomicU64,
    sessions: Mutex<BTreeMap<StreamId, LocalCaptureSession>>,
    picker: Arc<dyn ElementPicker>,
    peers: Arc<dyn PeerFactory>,
    host: HostConnector,
    replies: mpsc::UnboundedSender<ContentReply>,
}

/// Clears the choosing flag however the pick ends.
struct ChoosingGuard<'a>(&'a AtomicBool);

impl Drop for ChoosingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// All capture sessions of one page. Answers content commands and reports
/// statuses on `replies`.
#[derive(Clone)]
pub struct CaptureManager {
    inner: Arc<CaptureInner>,
}

impl CaptureManager {
    pub fn new(
        picker: Arc<dyn ElementPicker>,
        peers: Arc<dyn PeerFactory>,
        host: HostConnector,
        replies: mpsc::UnboundedSender<ContentReply>,
    ) -> Self {
        Self {
            inner: Arc::new(CaptureInner {
                choosing: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                sessions: Mutex::new(BTreeMap::new()),
                picker,
                peers,
                host,
                replies,
            }),
        }
    }

    pub async fn choose_element(&self) -> Result<ChooseOutcome> {
        if self.inner.choosing.swap(true, Ordering::SeqCst) {
            debug!("element selection already in progress");
            return Ok(ChooseOutcome::Busy);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;

        let guard = ChoosingGuard(&self.inner.choosing);
        let picked = self.inner.picker.pick().await;
        drop(guard);

        let element = match picked {
            Ok(element) => element,
            Err(e) => {
                info!(stream = id, "no element chosen: {}", e);
                return Ok(ChooseOutcome::Cancelled);
            }
        };

        let mut session = LocalCaptureSession::start(
            id,
            element,
            self.inner.peers.as_ref(),
            &self.inner.host,
        )
        .await?;
        let status = session.status();
        let ended = session.take_ended();
        self.inner.sessions.lock().await.insert(id, session);
        if let Some(ended) = ended {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Ok(reason) = ended.await {
                    manager.session_ended(id, reason).await;
                }
            });
        }
        self.reply(ContentReply::StatusUpdate {
            stream_id: id,
            status,
        });
        Ok(ChooseOutcome::Started(id))
    }

    /// Unknown ids are ignored.
    pub async fn stop_stream(&self, id: StreamId) {
        let session = self.inner.sessions.lock().await.remove(&id);
        let Some(session) = session else {
            debug!(stream = id, "no such capture session");
            return;
        };
        session.stop().await;
        self.get_all().await;
    }

    async fn session_ended(&self, id: StreamId, reason: Termination) {
        let session = self.inner.sessions.lock().await.remove(&id);
        let Some(session) = session else {
            return;
        };
        info!(stream = id, ?reason, "capture connection ended");
        session.stop().await;
        self.get_all().await;
    }

    pub async fn stop_all(&self) {
        let sessions = std::mem::take(&mut *self.inner.sessions.lock().await);
        for session in sessions.into_values() {
            session.stop().await;
        }
        self.get_all().await;
    }

    pub async fn get_all(&self) {
        let statuses = self.statuses().await;
        self.reply(ContentReply::StatusAll { statuses });
    }

    pub async fn statuses(&self) -> Vec<(StreamId, PlayStatus)> {
        self.inner
            .sessions
            .lock()
            .await
            .iter()
            .map(|(id, session)| (*id, session.status()))
            .collect()
    }

    pub async fn handle(&self, command: ContentCommand) {
        match command {
            ContentCommand::ChooseElement { tab_id } => {
                debug!(?tab_id, "choose element");
                if let Err(e) = self.choose_element().await {
                    warn!("failed to start capture: {}", e);
                }
            }
            ContentCommand::StopStream { stream_id } => self.stop_stream(stream_id).await,
            ContentCommand::StopAll => self.stop_all().await,
            ContentCommand::GetAll => self.get_all().await,
        }
    }

    fn reply(&self, reply: ContentReply) {
        if self.inner.replies.send(reply).is_err() {
            debug!("content replies receiver dropped");
        }
    }
}
