//! Deterministic media devices and transports.
//!
//! Used by the test suites and for running sessions without a network:
//! descriptions are fake SDP, two host candidates are "gathered" whenever a
//! local description is set, and a transport reports `Connected` once it
//! holds both descriptions.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{CallError, Result};
use crate::media::{LocalTrack, MediaDevices, RemoteTrack, TrackKind, TrackSource};
use crate::peer::transport::{
    LinkState, PeerTransport, SenderId, TransportEvent, TransportEventSender, TransportFactory,
};
use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Both halves of the scripted engine.
#[derive(Clone)]
pub struct ScriptedEngine {
    pub devices: Arc<ScriptedDevices>,
    pub transports: Arc<ScriptedTransportFactory>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            devices: Arc::new(ScriptedDevices::new()),
            transports: Arc::new(ScriptedTransportFactory::new()),
        }
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct ScriptedDevices {
    deny: AtomicBool,
    no_camera: AtomicBool,
    opened: Mutex<HashMap<TrackSource, usize>>,
    last_display: Mutex<Option<LocalTrack>>,
}

impl ScriptedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every open fails with `MediaAccessDenied`.
    pub fn set_denied(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Camera opens fail with `MediaUnavailable`.
    pub fn set_no_camera(&self, missing: bool) {
        self.no_camera.store(missing, Ordering::SeqCst);
    }

    /// How many times a device of this source was opened.
    pub fn opened(&self, source: TrackSource) -> usize {
        lock(&self.opened).get(&source).copied().unwrap_or(0)
    }

    /// The most recent display-capture track, e.g. to end it from "outside".
    pub fn last_display(&self) -> Option<LocalTrack> {
        lock(&self.last_display).clone()
    }

    fn open(&self, source: TrackSource) -> Result<LocalTrack> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(CallError::MediaAccessDenied(format!("{:?} permission refused", source)));
        }
        if source == TrackSource::Camera && self.no_camera.load(Ordering::SeqCst) {
            return Err(CallError::MediaUnavailable("no camera".into()));
        }
        *lock(&self.opened).entry(source).or_insert(0) += 1;
        let track = LocalTrack::new(source, "scripted");
        if source == TrackSource::Screen {
            *lock(&self.last_display) = Some(track.clone());
        }
        Ok(track)
    }
}

#[async_trait]
impl MediaDevices for ScriptedDevices {
    async fn open_microphone(&self) -> Result<LocalTrack> {
        self.open(TrackSource::Microphone)
    }

    async fn open_camera(&self) -> Result<LocalTrack> {
        self.open(TrackSource::Camera)
    }

    async fn open_display(&self) -> Result<LocalTrack> {
        self.open(TrackSource::Screen)
    }
}

/// What one scripted transport has seen so far.
#[derive(Debug, Clone, Default)]
pub struct TransportRecord {
    pub peer_id: String,
    pub generation: u64,
    pub offers_created: usize,
    pub answers_created: usize,
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub remote_candidates: Vec<IceCandidate>,
    pub sender_kinds: Vec<TrackKind>,
    pub sender_tracks: Vec<String>,
    pub replacements: usize,
    pub closed: bool,
}

#[derive(Default)]
struct FactoryInner {
    transports: Vec<Arc<ScriptedTransport>>,
    stalled: HashSet<String>,
    failing: HashSet<String>,
}

#[derive(Default)]
pub struct ScriptedTransportFactory {
    inner: Mutex<FactoryInner>,
}

impl ScriptedTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transports created for `peer_id` from now on never connect.
    pub fn stall(&self, peer_id: &str) {
        lock(&self.inner).stalled.insert(peer_id.to_string());
    }

    /// Creating a transport for `peer_id` fails.
    pub fn fail_create(&self, peer_id: &str) {
        lock(&self.inner).failing.insert(peer_id.to_string());
    }

    pub fn records(&self) -> Vec<TransportRecord> {
        lock(&self.inner)
            .transports
            .iter()
            .map(|t| lock(&t.record).clone())
            .collect()
    }

    /// Most recent transport created toward `peer_id`.
    pub fn latest(&self, peer_id: &str) -> Option<TransportRecord> {
        self.records().into_iter().rev().find(|r| r.peer_id == peer_id)
    }

    pub fn offers_created(&self) -> usize {
        self.records().iter().map(|r| r.offers_created).sum()
    }

    pub fn answers_created(&self) -> usize {
        self.records().iter().map(|r| r.answers_created).sum()
    }

    pub fn open_count(&self) -> usize {
        self.records().iter().filter(|r| !r.closed).count()
    }

    /// Pushes an engine state change on the latest transport toward `peer_id`.
    pub fn set_link(&self, peer_id: &str, state: LinkState) -> bool {
        let transport = lock(&self.inner)
            .transports
            .iter()
            .rev()
            .find(|t| t.peer_id == peer_id)
            .cloned();
        match transport {
            Some(t) => t
                .events
                .send(TransportEvent::StateChanged {
                    generation: t.generation,
                    state,
                })
                .is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl TransportFactory for ScriptedTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        generation: u64,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        let mut inner = lock(&self.inner);
        if inner.failing.contains(peer_id) {
            return Err(CallError::Engine(format!("cannot create transport for {}", peer_id)));
        }
        let transport = Arc::new(ScriptedTransport {
            peer_id: peer_id.to_string(),
            generation,
            events,
            stalled: inner.stalled.contains(peer_id),
            connected: AtomicBool::new(false),
            record: Mutex::new(TransportRecord {
                peer_id: peer_id.to_string(),
                generation,
                ..Default::default()
            }),
        });
        inner.transports.push(transport.clone());
        Ok(transport)
    }
}

pub struct ScriptedTransport {
    peer_id: String,
    generation: u64,
    events: TransportEventSender,
    stalled: bool,
    connected: AtomicBool,
    record: Mutex<TransportRecord>,
}

impl ScriptedTransport {
    fn fake_sdp(&self, kind: SdpKind, senders: &[TrackKind]) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=scripted:{:?}\r\n",
            self.generation, kind
        );
        for k in senders {
            match k {
                TrackKind::Audio => sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"),
                TrackKind::Video => sdp.push_str("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n"),
            }
        }
        sdp
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn maybe_connect(&self) {
        let remote = {
            let record = lock(&self.record);
            if record.local.is_none() || record.closed || self.stalled {
                return;
            }
            match &record.remote {
                Some(remote) => remote.sdp.clone(),
                None => return,
            }
        };
        if self.connected.swap(true, Ordering::SeqCst) {
            return;
        }
        let generation = self.generation;
        self.emit(TransportEvent::StateChanged {
            generation,
            state: LinkState::Connecting,
        });
        self.emit(TransportEvent::StateChanged {
            generation,
            state: LinkState::Connected,
        });
        for (i, line) in remote.lines().filter(|l| l.starts_with("m=")).enumerate() {
            let kind = if line.starts_with("m=video") {
                TrackKind::Video
            } else {
                TrackKind::Audio
            };
            self.emit(TransportEvent::RemoteTrack {
                generation,
                track: RemoteTrack {
                    peer_id: self.peer_id.clone(),
                    kind,
                    ssrc: (generation as u32) * 10 + i as u32,
                    track: None,
                },
            });
        }
    }
}

#[async_trait]
impl PeerTransport for ScriptedTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId> {
        let mut record = lock(&self.record);
        record.sender_kinds.push(track.kind());
        record.sender_tracks.push(track.id().to_string());
        Ok(SenderId(record.sender_kinds.len() - 1))
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<()> {
        let mut record = lock(&self.record);
        let slot = record
            .sender_tracks
            .get_mut(sender.0)
            .ok_or_else(|| CallError::Engine(format!("no sender {}", sender.0)))?;
        *slot = track.id().to_string();
        record.replacements += 1;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut record = lock(&self.record);
        record.offers_created += 1;
        let sdp = self.fake_sdp(SdpKind::Offer, &record.sender_kinds);
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut record = lock(&self.record);
        match &record.remote {
            Some(remote) if remote.kind == SdpKind::Offer => {}
            _ => return Err(CallError::Engine("no remote offer to answer".into())),
        }
        record.answers_created += 1;
        let sdp = self.fake_sdp(SdpKind::Answer, &record.sender_kinds);
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        lock(&self.record).local = Some(desc);
        for n in 1..=2u32 {
            self.emit(TransportEvent::LocalCandidate {
                generation: self.generation,
                candidate: IceCandidate::new(format!(
                    "candidate:{} 1 udp 2122260223 192.168.{}.{} {} typ host",
                    n,
                    self.generation % 250,
                    n,
                    50_000 + n
                )),
            });
        }
        self.emit(TransportEvent::GatheringComplete {
            generation: self.generation,
        });
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if !desc.sdp.starts_with("v=0") {
            return Err(CallError::Engine("malformed SDP".into()));
        }
        lock(&self.record).remote = Some(desc);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut record = lock(&self.record);
        if record.remote.is_none() {
            return Err(CallError::Engine("remote description not set".into()));
        }
        record.remote_candidates.push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        lock(&self.record).remote.is_some()
    }

    async fn close(&self) -> Result<()> {
        let mut record = lock(&self.record);
        if record.closed {
            return Ok(());
        }
        record.closed = true;
        drop(record);
        self.emit(TransportEvent::StateChanged {
            generation: self.generation,
            state: LinkState::Closed,
        });
        Ok(())
    }
}
