use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CallError, Result};
use crate::media::{LocalTrack, MediaDevices, RemoteMedia, RemoteTrack, TrackKind, TrackSet};
use crate::peer::connection::ConnectionHandle;
use crate::peer::state::{NegotiationState, Role};
use crate::peer::transport::{TransportEventSender, TransportFactory};
use crate::peer::types::IceCandidate;

/// Owns the local track set and every connection of one session.
///
/// Only the session task touches it, so nothing in here is locked.
pub struct PeerConnectionManager {
    devices: Arc<dyn MediaDevices>,
    factory: Arc<dyn TransportFactory>,
    events: TransportEventSender,
    local: Option<TrackSet>,
    screen: Option<LocalTrack>,
    connections: HashMap<String, ConnectionHandle>,
    next_generation: u64,
    remote: RemoteMedia,
}

impl PeerConnectionManager {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn TransportFactory>,
        events: TransportEventSender,
    ) -> Self {
        Self {
            devices,
            factory,
            events,
            local: None,
            screen: None,
            connections: HashMap::new(),
            next_generation: 0,
            remote: RemoteMedia::default(),
        }
    }

    /// Opens microphone (and camera) once per session; later calls return
    /// the cached set.
    pub async fn acquire_local_media(&mut self, want_video: bool) -> Result<TrackSet> {
        if let Some(set) = &self.local {
            return Ok(set.clone());
        }

        let audio = self.devices.open_microphone().await?;
        let video = if want_video {
            match self.devices.open_camera().await {
                Ok(track) => Some(track),
                Err(e) => {
                    audio.stop();
                    return Err(e);
                }
            }
        } else {
            None
        };

        let set = TrackSet { audio, video };
        log::info!(
            "Local media acquired: audio={} video={}",
            set.audio.id(),
            set.video.as_ref().map(LocalTrack::id).unwrap_or("none")
        );
        self.local = Some(set.clone());
        Ok(set)
    }

    pub fn has_video_slot(&self) -> bool {
        self.local.as_ref().is_some_and(|set| set.video.is_some())
    }

    /// What every peer should currently be receiving as video.
    pub fn outgoing_video(&self) -> Option<LocalTrack> {
        self.screen
            .clone()
            .or_else(|| self.local.as_ref().and_then(|set| set.video.clone()))
    }

    pub fn set_track_enabled(&mut self, kind: TrackKind, on: bool) -> bool {
        let Some(set) = &self.local else {
            return false;
        };
        match kind {
            TrackKind::Audio => set.audio.set_enabled(on),
            TrackKind::Video => match &set.video {
                Some(camera) => camera.set_enabled(on),
                None => return false,
            },
        }
        true
    }

    pub fn is_track_enabled(&self, kind: TrackKind) -> bool {
        match (kind, &self.local) {
            (TrackKind::Audio, Some(set)) => set.audio.is_enabled(),
            (TrackKind::Video, Some(set)) => set.video.as_ref().is_some_and(LocalTrack::is_enabled),
            _ => false,
        }
    }

    /// Returns the existing handle for `peer_id` or builds one with every
    /// current local track attached.
    pub async fn create_connection_for(
        &mut self,
        peer_id: &str,
        role: Role,
    ) -> Result<&mut ConnectionHandle> {
        if !self.connections.contains_key(peer_id) {
            let handle = self.open(peer_id, role).await?;
            self.connections.insert(peer_id.to_string(), handle);
        }
        self.connections
            .get_mut(peer_id)
            .ok_or_else(|| CallError::negotiation(peer_id, "connection vanished"))
    }

    async fn open(&mut self, peer_id: &str, role: Role) -> Result<ConnectionHandle> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let transport = self
            .factory
            .create(peer_id, generation, self.events.clone())
            .await
            .map_err(|e| CallError::negotiation(peer_id, e.to_string()))?;

        let mut handle = ConnectionHandle::new(peer_id, generation, role, transport.clone());

        let attached = async {
            if let Some(set) = &self.local {
                handle.audio_sender = Some(transport.add_track(&set.audio).await?);
            }
            if let Some(video) = self.outgoing_video() {
                handle.video_sender = Some(transport.add_track(&video).await?);
            }
            Ok::<_, CallError>(())
        }
        .await;

        if let Err(e) = attached {
            handle.close().await;
            return Err(CallError::negotiation(peer_id, format!("attaching tracks: {}", e)));
        }

        log::info!(
            "Connection for {} created as {:?} (generation {})",
            peer_id,
            role,
            generation
        );
        Ok(handle)
    }

    /// Points every existing video sender at `track`. Never renegotiates;
    /// per-peer failures are returned, the rest keep going.
    pub async fn replace_video_track(&mut self, track: &LocalTrack) -> Vec<(String, CallError)> {
        let mut failures = Vec::new();
        for (peer_id, handle) in self.connections.iter() {
            let Some(sender) = handle.video_sender else {
                continue;
            };
            if let Err(e) = handle.transport().replace_track(sender, track).await {
                log::warn!("Replacing video track for {} failed: {}", peer_id, e);
                failures.push((peer_id.clone(), e));
            }
        }
        log::debug!(
            "Outgoing video is now {} on {} connection(s)",
            track.id(),
            self.connections.len() - failures.len()
        );
        failures
    }

    pub async fn open_display(&mut self) -> Result<LocalTrack> {
        if let Some(screen) = &self.screen {
            if screen.is_live() {
                return Ok(screen.clone());
            }
        }
        let screen = self.devices.open_display().await?;
        self.screen = Some(screen.clone());
        Ok(screen)
    }

    pub fn screen(&self) -> Option<&LocalTrack> {
        self.screen.as_ref()
    }

    pub fn take_screen(&mut self) -> Option<LocalTrack> {
        self.screen.take()
    }

    /// Stops the camera while something else is being sent.
    pub fn release_camera(&mut self) {
        if let Some(camera) = self.local.as_ref().and_then(|set| set.video.as_ref()) {
            camera.stop();
        }
    }

    /// The camera track to fall back to, re-opened if the old one ended.
    pub async fn restore_camera(&mut self) -> Result<Option<LocalTrack>> {
        let Some(set) = self.local.as_mut() else {
            return Ok(None);
        };
        match &set.video {
            None => Ok(None),
            Some(camera) if camera.is_live() => Ok(Some(camera.clone())),
            Some(old) => {
                let enabled = old.is_enabled();
                let camera = self.devices.open_camera().await?;
                camera.set_enabled(enabled);
                log::info!("Camera re-acquired as {}", camera.id());
                set.video = Some(camera.clone());
                Ok(Some(camera))
            }
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<&ConnectionHandle> {
        self.connections.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut ConnectionHandle> {
        self.connections.get_mut(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.connections.contains_key(peer_id)
    }

    /// Maps a transport callback back to the live handle that owns it.
    pub fn peer_for_generation(&self, generation: u64) -> Option<String> {
        self.connections
            .values()
            .find(|h| h.generation() == generation)
            .map(|h| h.peer_id().to_string())
    }

    pub fn peer_states(&self) -> Vec<(String, NegotiationState)> {
        let mut states: Vec<_> = self
            .connections
            .values()
            .map(|h| (h.peer_id().to_string(), h.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Re-keys a handle (1:1 creator learning who answered) and hands back
    /// the local candidates it was holding.
    pub fn rebind(&mut self, from: &str, to: &str) -> Result<Vec<IceCandidate>> {
        if self.connections.contains_key(to) {
            return Err(CallError::negotiation(to, "already connected"));
        }
        let mut handle = self
            .connections
            .remove(from)
            .ok_or_else(|| CallError::negotiation(from, "no connection to rebind"))?;
        let held = handle.bind_remote(to);
        log::debug!("Connection {} rebound to {} ({} held candidates)", from, to, held.len());
        self.connections.insert(to.to_string(), handle);
        Ok(held)
    }

    pub fn add_remote_track(&mut self, track: RemoteTrack) {
        self.remote.add(track);
    }

    pub fn remote_media(&self) -> &RemoteMedia {
        &self.remote
    }

    /// Idempotent; false if there was nothing to close.
    pub async fn close_connection(&mut self, peer_id: &str) -> bool {
        self.remote.remove_peer(peer_id);
        match self.connections.remove(peer_id) {
            Some(mut handle) => {
                handle.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&mut self) {
        let peers: Vec<String> = self.connections.keys().cloned().collect();
        for peer_id in peers {
            self.close_connection(&peer_id).await;
        }
        self.remote.clear();
    }

    /// Stops every local track and forgets the cache.
    pub fn stop_local_media(&mut self) {
        if let Some(screen) = self.screen.take() {
            screen.stop();
        }
        if let Some(set) = self.local.take() {
            set.stop_all();
            log::info!("Local media stopped");
        }
    }

    /// Live local tracks, screen included.
    pub fn live_track_count(&self) -> usize {
        let local = self.local.as_ref().map(TrackSet::live_count).unwrap_or(0);
        let screen = self.screen.as_ref().filter(|s| s.is_live()).map_or(0, |_| 1);
        local + screen
    }
}
