use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::peer::{PeerConnection, SenderId, SourceTrack};

/// One listener's connection and the sender it holds for each track id.
struct ListenerBindings {
    connection: Arc<dyn PeerConnection>,
    senders: HashMap<String, SenderId>,
}

impl ListenerBindings {
    async fn bind(&mut self, listener: &str, track: &SourceTrack) {
        if self.senders.contains_key(track.id()) {
            return;
        }
        match self.connection.add_track(track.clone()).await {
            Ok(sender) => {
                debug!(listener, track = track.id(), "bound track");
                self.senders.insert(track.id().to_owned(), sender);
            }
            Err(e) => warn!(listener, track = track.id(), "failed to add track: {}", e),
        }
    }

    async fn unbind(&mut self, listener: &str, track_id: &str) {
        let Some(sender) = self.senders.remove(track_id) else {
            return;
        };
        if let Err(e) = self.connection.remove_track(sender).await {
            warn!(listener, track = track_id, "failed to remove sender: {}", e);
        }
    }
}

/// Keeps every listener's senders in step with the host's live track set.
///
/// Each listener has its own sender map; a track change touches every
/// listener, and a new listener is bound to every live track.
#[derive(Default)]
pub struct TrackFanout {
    tracks: Vec<SourceTrack>,
    listeners: HashMap<String, ListenerBindings>,
}

impl TrackFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn on_track_added(&mut self, track: SourceTrack) {
        if !self.tracks.iter().any(|t| t.id() == track.id()) {
            self.tracks.push(track.clone());
        }
        for (listener, bindings) in self.listeners.iter_mut() {
            bindings.bind(listener, &track).await;
        }
    }

    /// Unknown ids are a no-op.
    pub async fn on_track_removed(&mut self, track_id: &str) {
        self.tracks.retain(|t| t.id() != track_id);
        for (listener, bindings) in self.listeners.iter_mut() {
            bindings.unbind(listener, track_id).await;
        }
    }

    pub async fn attach_listener(&mut self, listener: &str, connection: Arc<dyn PeerConnection>) {
        let bindings = self
            .listeners
            .entry(listener.to_owned())
            .or_insert_with(|| ListenerBindings {
                connection,
                senders: HashMap::new(),
            });
        for track in &self.tracks {
            bindings.bind(listener, track).await;
        }
    }

    /// Forgets a listener whose connection is going away. Returns whether it
    /// was attached.
    pub fn detach_listener(&mut self, listener: &str) -> bool {
        self.listeners.remove(listener).is_some()
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.id().to_owned()).collect()
    }

    pub fn bound_tracks(&self, listener: &str) -> Option<Vec<String>> {
        self.listeners.get(listener).map(|bindings| {
            let mut ids: Vec<String> = bindings.senders.keys().cloned().collect();
            ids.sort();
            ids
        })
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}
