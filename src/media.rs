//! Local and remote media.
//!
//! Local tracks are webrtc-rs sample tracks. Muting flips an `enabled` flag
//! that drops samples on the floor; the track and its senders stay put, so
//! nothing is renegotiated. Stopping a track is final and fires its
//! end-of-stream signal.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::CallError;
use crate::utils::random_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

struct LocalTrackInner {
    id: String,
    source: TrackSource,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

/// Outgoing track shared read-only by every peer connection.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

impl LocalTrack {
    pub fn new(source: TrackSource, stream_id: &str) -> Self {
        let id = format!("{:?}-{}", source, random_id()).to_lowercase();
        let mime_type = match source.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        ));
        let (ended, _) = watch::channel(false);
        Self {
            inner: Arc::new(LocalTrackInner {
                id,
                source,
                rtc,
                enabled: AtomicBool::new(true),
                ended,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, on: bool) {
        self.inner.enabled.store(on, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        !*self.inner.ended.borrow()
    }

    /// Releases the device. Idempotent.
    pub fn stop(&self) {
        if self.inner.ended.send_replace(true) {
            return;
        }
        log::debug!("Local track {} stopped", self.inner.id);
    }

    /// Resolves once the track has ended, whether stopped locally or by the
    /// source itself (e.g. the user closed a shared window).
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.rtc.clone()
    }

    /// Feeds one encoded frame. Dropped while disabled or after stop.
    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<bool, CallError> {
        if !self.is_enabled() || !self.is_live() {
            return Ok(false);
        }
        self.inner
            .rtc
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }

    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Exactly one audio track and at most one video track.
#[derive(Debug, Clone)]
pub struct TrackSet {
    pub audio: LocalTrack,
    pub video: Option<LocalTrack>,
}

impl TrackSet {
    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        std::iter::once(&self.audio).chain(self.video.iter())
    }

    pub fn live_count(&self) -> usize {
        self.tracks().filter(|t| t.is_live()).count()
    }

    pub fn stop_all(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

/// Device access. Implementations map platform refusals onto
/// `MediaAccessDenied` and missing hardware onto `MediaUnavailable`.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_microphone(&self) -> Result<LocalTrack, CallError>;
    async fn open_camera(&self) -> Result<LocalTrack, CallError>;
    async fn open_display(&self) -> Result<LocalTrack, CallError>;
}

/// Devices whose frames are pushed by the host through
/// [`LocalTrack::write_frame`], e.g. from a capture library.
pub struct HostFedDevices {
    stream_id: String,
    has_camera: bool,
}

impl HostFedDevices {
    pub fn new(has_camera: bool) -> Self {
        Self {
            stream_id: format!("local-{}", random_id()),
            has_camera,
        }
    }
}

#[async_trait]
impl MediaDevices for HostFedDevices {
    async fn open_microphone(&self) -> Result<LocalTrack, CallError> {
        Ok(LocalTrack::new(TrackSource::Microphone, &self.stream_id))
    }

    async fn open_camera(&self) -> Result<LocalTrack, CallError> {
        if !self.has_camera {
            return Err(CallError::MediaUnavailable("no camera attached".into()));
        }
        Ok(LocalTrack::new(TrackSource::Camera, &self.stream_id))
    }

    async fn open_display(&self) -> Result<LocalTrack, CallError> {
        Ok(LocalTrack::new(TrackSource::Screen, &self.stream_id))
    }
}

/// Inbound track from one remote peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub peer_id: String,
    pub kind: TrackKind,
    pub ssrc: u32,
    pub track: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("peer_id", &self.peer_id)
            .field("kind", &self.kind)
            .field("ssrc", &self.ssrc)
            .finish()
    }
}

/// All inbound tracks, grouped per peer.
#[derive(Debug, Default)]
pub struct RemoteMedia {
    by_peer: HashMap<String, Vec<RemoteTrack>>,
}

impl RemoteMedia {
    pub fn add(&mut self, track: RemoteTrack) {
        let tracks = self.by_peer.entry(track.peer_id.clone()).or_default();
        if !tracks.iter().any(|t| t.ssrc == track.ssrc && t.kind == track.kind) {
            tracks.push(track);
        }
    }

    pub fn remove_peer(&mut self, peer_id: &str) -> Vec<RemoteTrack> {
        self.by_peer.remove(peer_id).unwrap_or_default()
    }

    pub fn tracks_for(&self, peer_id: &str) -> &[RemoteTrack] {
        self.by_peer.get(peer_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn peer_count(&self) -> usize {
        self.by_peer.len()
    }

    pub fn clear(&mut self) {
        self.by_peer.clear();
    }
}
