//! Session controller.
//!
//! One task owns every piece of mutable call state. UI commands, store
//! notifications, engine callbacks, outbox reports and timers all arrive
//! as messages on channels that this task drains one at a time, so no
//! handler ever races another. [`SessionController`] is the cloneable
//! front end; when the last clone is dropped the task leaves the call and
//! exits.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::CallConfig;
use crate::error::{CallError, Result, StoreError};
use crate::events::SessionEvent;
use crate::identity::{Identity, IdentityProvider};
use crate::media::{LocalTrack, MediaDevices, TrackKind, TrackSet};
use crate::negotiation::{make_offer, on_link_connected, Negotiator};
use crate::peer::manager::PeerConnectionManager;
use crate::peer::state::{Applied, NegotiationState, Role};
use crate::peer::transport::{LinkState, TransportEvent, TransportFactory};
use crate::peer::types::SessionDescription;
use crate::signaling::{
    CallDocument, CallKind, Outbox, OutboxReport, PresenceRecord, Receipt, SignalEnvelope,
    SignalKind, SignalStore, SignedDescription, StoreEvent, Subscription,
};

/// Key of the 1:1 creator's connection until someone answers.
const PENDING_ANSWERER: &str = "pending-answerer";

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub self_id: String,
    /// Room id or call id, when joined.
    pub channel: Option<String>,
    pub roster: Vec<PresenceRecord>,
    pub peers: Vec<(String, NegotiationState)>,
    pub signaling_up: bool,
    pub sharing_screen: bool,
    pub mic_on: bool,
    pub cam_on: bool,
    pub live_tracks: usize,
    /// Inbound track kinds per connected peer.
    pub remote_tracks: Vec<(String, Vec<TrackKind>)>,
}

enum Command {
    Join {
        room: String,
        want_video: bool,
        reply: oneshot::Sender<Result<TrackSet>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    ToggleMic {
        on: bool,
        reply: oneshot::Sender<bool>,
    },
    ToggleCam {
        on: bool,
        reply: oneshot::Sender<bool>,
    },
    ShareScreen {
        reply: oneshot::Sender<Result<()>>,
    },
    StopShare {
        reply: oneshot::Sender<Result<()>>,
    },
    CreateCall {
        want_video: bool,
        reply: oneshot::Sender<Result<String>>,
    },
    AnswerCall {
        call_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RetrySignaling {
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Timer and watcher wake-ups.
enum Internal {
    HandshakeDeadline { generation: u64 },
    GraceExpired { generation: u64 },
    ScreenEnded { track_id: String },
    RetrySignaling { epoch: u64 },
}

#[derive(Debug, Clone)]
enum Mode {
    Idle,
    Room {
        room: String,
    },
    Caller {
        call_id: Option<String>,
        answered: bool,
    },
    Callee {
        call_id: String,
        answered: bool,
    },
}

impl Mode {
    fn channel(&self) -> Option<&str> {
        match self {
            Mode::Room { room } => Some(room.as_str()),
            Mode::Caller {
                call_id: Some(id), ..
            }
            | Mode::Callee { call_id: id, .. } => Some(id.as_str()),
            _ => None,
        }
    }

    fn is_idle(&self) -> bool {
        matches!(self, Mode::Idle)
    }
}

/// Cloneable handle to a running session task.
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    self_id: String,
}

impl SessionController {
    /// Starts the session task. Must be called inside a tokio runtime.
    pub fn spawn(
        config: CallConfig,
        identity: &dyn IdentityProvider,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn TransportFactory>,
        store: Arc<dyn SignalStore>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.validate()?;
        let identity = identity.identity();
        let self_id = identity.peer_id.clone();

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (store_tx, store_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let core = SessionCore {
            negotiator: Negotiator::new(&self_id),
            manager: PeerConnectionManager::new(devices, factory, transport_tx),
            config,
            identity,
            store,
            mode: Mode::Idle,
            joined_at: Utc::now(),
            events,
            store_tx,
            store_rx,
            transport_rx,
            reports_tx,
            reports_rx,
            internal_tx,
            internal_rx,
            subscriptions: Vec::new(),
            outbox: None,
            roster: Vec::new(),
            failed: HashSet::new(),
            stranded: HashSet::new(),
            inbox_stale: false,
            signaling_up: false,
            reported_down: false,
            retry_epoch: 0,
            retry_attempt: 0,
            share_watch: None,
        };
        tokio::spawn(core.run(command_rx));

        log::info!("Session started for {}", self_id);
        Ok((Self { commands, self_id }, event_rx))
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)
    }

    /// Acquires media, announces presence and negotiates with every peer
    /// already in the room. Signaling trouble does not fail the join; it is
    /// reported as `SignalingUnavailable` while the preview stays live.
    pub async fn join(&self, room: &str, want_video: bool) -> Result<TrackSet> {
        let room = room.to_string();
        self.request(|reply| Command::Join {
            room,
            want_video,
            reply,
        })
        .await?
    }

    pub async fn leave(&self) -> Result<()> {
        self.request(|reply| Command::Leave { reply }).await
    }

    pub async fn toggle_mic(&self, on: bool) -> Result<bool> {
        self.request(|reply| Command::ToggleMic { on, reply }).await
    }

    pub async fn toggle_cam(&self, on: bool) -> Result<bool> {
        self.request(|reply| Command::ToggleCam { on, reply }).await
    }

    pub async fn share_screen(&self) -> Result<()> {
        self.request(|reply| Command::ShareScreen { reply }).await?
    }

    pub async fn stop_share(&self) -> Result<()> {
        self.request(|reply| Command::StopShare { reply }).await?
    }

    /// Starts a 1:1 call and returns the id to hand to the answerer.
    pub async fn create_call(&self, want_video: bool) -> Result<String> {
        self.request(|reply| Command::CreateCall { want_video, reply })
            .await?
    }

    pub async fn answer_call(&self, call_id: &str) -> Result<()> {
        let call_id = call_id.to_string();
        self.request(|reply| Command::AnswerCall { call_id, reply })
            .await?
    }

    /// Reconnects to the store and renegotiates peers that failed earlier.
    pub async fn retry_signaling(&self) -> Result<()> {
        self.request(|reply| Command::RetrySignaling { reply }).await?
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }
}

struct SessionCore {
    config: CallConfig,
    identity: Identity,
    store: Arc<dyn SignalStore>,
    manager: PeerConnectionManager,
    negotiator: Negotiator,
    mode: Mode,
    joined_at: DateTime<Utc>,

    events: mpsc::UnboundedSender<SessionEvent>,
    store_tx: mpsc::UnboundedSender<StoreEvent>,
    store_rx: mpsc::UnboundedReceiver<StoreEvent>,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    reports_tx: mpsc::UnboundedSender<OutboxReport>,
    reports_rx: mpsc::UnboundedReceiver<OutboxReport>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,

    subscriptions: Vec<Subscription>,
    outbox: Option<Outbox>,
    roster: Vec<PresenceRecord>,
    /// Peers whose handshake failed; not renegotiated until they rejoin
    /// or the user retries.
    failed: HashSet<String>,
    /// Peers whose handshake died with the store; renegotiated on reconnect.
    stranded: HashSet<String>,
    /// Set on join until our inbox has been emptied of an earlier visit.
    inbox_stale: bool,
    signaling_up: bool,
    reported_down: bool,
    retry_epoch: u64,
    retry_attempt: u32,
    share_watch: Option<JoinHandle<()>>,
}

impl SessionCore {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        log::info!("All session handles dropped, leaving");
                        self.leave().await;
                        break;
                    }
                },
                Some(event) = self.store_rx.recv() => self.on_store_event(event).await,
                Some(event) = self.transport_rx.recv() => self.on_transport_event(event).await,
                Some(report) = self.reports_rx.recv() => self.on_outbox_report(report).await,
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal).await,
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn self_id(&self) -> String {
        self.identity.peer_id.clone()
    }

    fn send_signal(&mut self, envelope: SignalEnvelope) {
        match &mut self.outbox {
            Some(outbox) => {
                if !outbox.send(envelope) {
                    log::warn!("Outbox closed, signal dropped");
                }
            }
            None => log::debug!("No outbox, dropping {:?} to {}", envelope.kind, envelope.to),
        }
    }

    fn active_roster(&self) -> Vec<PresenceRecord> {
        self.roster
            .iter()
            .filter(|r| !self.failed.contains(&r.peer_id))
            .cloned()
            .collect()
    }

    fn ensure_idle(&self) -> Result<()> {
        match &self.mode {
            Mode::Idle => Ok(()),
            other => Err(CallError::AlreadyJoined(
                other.channel().unwrap_or("a call").to_string(),
            )),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Join {
                room,
                want_video,
                reply,
            } => {
                let result = self.join(&room, want_video).await;
                let _ = reply.send(result);
            }
            Command::Leave { reply } => {
                self.leave().await;
                let _ = reply.send(());
            }
            Command::ToggleMic { on, reply } => {
                let done = self.manager.set_track_enabled(TrackKind::Audio, on);
                log::debug!("Microphone {} ({})", if on { "on" } else { "off" }, done);
                let _ = reply.send(done);
            }
            Command::ToggleCam { on, reply } => {
                let done = self.manager.set_track_enabled(TrackKind::Video, on);
                if !done {
                    log::warn!("No camera track to toggle");
                }
                let _ = reply.send(done);
            }
            Command::ShareScreen { reply } => {
                let result = self.share_screen().await;
                let _ = reply.send(result);
            }
            Command::StopShare { reply } => {
                let result = self.stop_share().await;
                let _ = reply.send(result);
            }
            Command::CreateCall { want_video, reply } => {
                let result = self.create_call(want_video).await;
                let _ = reply.send(result);
            }
            Command::AnswerCall { call_id, reply } => {
                let result = self.answer_call(&call_id).await;
                let _ = reply.send(result);
            }
            Command::RetrySignaling { reply } => {
                let result = self.retry_signaling().await;
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            self_id: self.self_id(),
            channel: self.mode.channel().map(str::to_string),
            roster: self.active_roster(),
            peers: self.manager.peer_states(),
            signaling_up: self.signaling_up,
            sharing_screen: self.manager.screen().is_some_and(LocalTrack::is_live),
            mic_on: self.manager.is_track_enabled(TrackKind::Audio),
            cam_on: self.manager.is_track_enabled(TrackKind::Video),
            live_tracks: self.manager.live_track_count(),
            remote_tracks: self.remote_tracks(),
        }
    }

    fn remote_tracks(&self) -> Vec<(String, Vec<TrackKind>)> {
        let remote = self.manager.remote_media();
        self.manager
            .peer_states()
            .into_iter()
            .filter_map(|(peer, _)| {
                let kinds: Vec<TrackKind> =
                    remote.tracks_for(&peer).iter().map(|t| t.kind).collect();
                (!kinds.is_empty()).then_some((peer, kinds))
            })
            .collect()
    }

    // ---- lifecycle ----

    async fn join(&mut self, room: &str, want_video: bool) -> Result<TrackSet> {
        self.ensure_idle()?;
        let tracks = self.manager.acquire_local_media(want_video).await?;
        self.emit(SessionEvent::LocalMedia(tracks.clone()));

        log::info!("Joining room {} as {}", room, self.identity.peer_id);
        self.mode = Mode::Room {
            room: room.to_string(),
        };
        self.joined_at = Utc::now();
        self.inbox_stale = true;
        self.open_channel(room);
        self.connect_or_schedule().await;
        Ok(tracks)
    }

    fn open_channel(&mut self, channel: &str) {
        self.negotiator = Negotiator::new(&self.identity.peer_id);
        if let Some(old) = self.outbox.take() {
            old.shutdown();
        }
        self.outbox = Some(Outbox::spawn(
            self.store.clone(),
            channel.to_string(),
            self.config.publish_retry,
            self.reports_tx.clone(),
        ));
    }

    /// Releases everything the session holds. True if anything was active.
    async fn teardown(&mut self) -> bool {
        let mode = std::mem::replace(&mut self.mode, Mode::Idle);
        if let Some(watch) = self.share_watch.take() {
            watch.abort();
        }
        if let Some(outbox) = self.outbox.take() {
            outbox.shutdown();
        }

        match &mode {
            Mode::Room { room } => {
                if let Err(e) = self.store.remove_presence(room, &self.identity.peer_id).await {
                    log::warn!("Could not remove presence from {}: {}", room, e);
                }
            }
            Mode::Caller {
                call_id: Some(call_id),
                ..
            }
            | Mode::Callee {
                call_id,
                answered: true,
            } => {
                if let Err(e) = self.store.delete_call(call_id).await {
                    log::warn!("Could not delete call {}: {}", call_id, e);
                }
            }
            _ => {}
        }

        self.subscriptions.clear();
        self.manager.close_all().await;
        self.manager.stop_local_media();
        while self.store_rx.try_recv().is_ok() {}
        while self.reports_rx.try_recv().is_ok() {}

        self.negotiator = Negotiator::new(&self.identity.peer_id);
        self.roster.clear();
        self.failed.clear();
        self.stranded.clear();
        self.inbox_stale = false;
        self.signaling_up = false;
        self.reported_down = false;
        self.retry_epoch += 1;
        self.retry_attempt = 0;

        !mode.is_idle()
    }

    async fn leave(&mut self) {
        let channel = self.mode.channel().map(str::to_string);
        if self.teardown().await {
            log::info!("Left {}", channel.unwrap_or_default());
            self.emit(SessionEvent::Left);
        }
    }

    // ---- signaling connectivity ----

    async fn connect_signaling(&mut self) -> Result<(), StoreError> {
        self.subscriptions.clear();
        let self_id = self.self_id();
        match self.mode.clone() {
            Mode::Room { room } => {
                if self.inbox_stale {
                    self.store.clear_inbox(&room, &self_id).await?;
                    self.inbox_stale = false;
                }
                let incoming = self
                    .store
                    .subscribe_incoming(&room, &self_id, self.store_tx.clone())
                    .await?;
                self.subscriptions.push(incoming);
                self.store
                    .put_presence(
                        &room,
                        PresenceRecord {
                            peer_id: self_id.clone(),
                            display_name: self.identity.display_name.clone(),
                            joined_at: self.joined_at,
                        },
                    )
                    .await?;
                let presence = self
                    .store
                    .subscribe_presence(&room, self.store_tx.clone())
                    .await?;
                self.subscriptions.push(presence);
            }
            Mode::Caller {
                call_id: Some(call_id),
                ..
            }
            | Mode::Callee { call_id, .. } => {
                let incoming = self
                    .store
                    .subscribe_incoming(&call_id, &self_id, self.store_tx.clone())
                    .await?;
                self.subscriptions.push(incoming);
                let watch = self
                    .store
                    .watch_call(&call_id, self.store_tx.clone())
                    .await?;
                self.subscriptions.push(watch);
            }
            _ => return Ok(()),
        }

        self.signaling_up = true;
        self.retry_attempt = 0;
        if !self.stranded.is_empty() {
            log::info!("Renegotiating {} peer(s) cut off by the outage", self.stranded.len());
            self.stranded.clear();
        }
        if std::mem::take(&mut self.reported_down) {
            log::info!("Signaling restored");
            self.emit(SessionEvent::SignalingRestored);
        }
        Ok(())
    }

    async fn connect_or_schedule(&mut self) {
        if let Err(e) = self.connect_signaling().await {
            self.signaling_down(e.to_string());
        }
    }

    fn signaling_down(&mut self, reason: String) {
        let newly = self.signaling_up || !self.reported_down;
        self.signaling_up = false;
        if !newly {
            return;
        }
        log::warn!("Signaling unavailable: {}", reason);
        self.reported_down = true;
        self.retry_attempt = 0;
        self.emit(SessionEvent::SignalingUnavailable(
            CallError::SignalingUnavailable(reason),
        ));
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        let policy = self.config.signaling_retry;
        self.retry_attempt += 1;
        if self.retry_attempt > policy.max_attempts {
            log::warn!(
                "Giving up automatic reconnection after {} attempts",
                policy.max_attempts
            );
            return;
        }
        let delay = policy.delay_for(self.retry_attempt);
        let epoch = self.retry_epoch;
        let tx = self.internal_tx.clone();
        log::debug!("Reconnecting to signaling in {:?}", delay);
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(Internal::RetrySignaling { epoch });
        });
    }

    async fn retry_signaling(&mut self) -> Result<()> {
        if self.mode.is_idle() {
            return Err(CallError::NotJoined);
        }
        self.failed.clear();
        self.retry_epoch += 1;
        match self.connect_signaling().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let err = CallError::from(e);
                self.reported_down = false;
                self.signaling_down(err.to_string());
                Err(err)
            }
        }
    }

    // ---- store events ----

    async fn on_store_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::Incoming { envelope, receipt } => self.on_incoming(envelope, receipt).await,
            StoreEvent::Roster(records) => self.on_roster(records).await,
            StoreEvent::CallUpdated { call_id, document } => {
                self.on_call_updated(&call_id, document).await
            }
            StoreEvent::Unavailable(reason) => self.signaling_down(reason),
            StoreEvent::Restored => {
                if !self.signaling_up && !self.mode.is_idle() {
                    self.retry_epoch += 1;
                    self.connect_or_schedule().await;
                }
            }
        }
    }

    async fn on_incoming(&mut self, envelope: SignalEnvelope, receipt: Receipt) {
        let Some(channel) = self.mode.channel().map(str::to_string) else {
            return;
        };
        let result = self.apply_envelope(envelope).await;
        if let Err(e) = self.store.acknowledge(&channel, &receipt).await {
            log::debug!("Acknowledge failed: {}", e);
        }
        if let Err(e) = result {
            self.fail_peer(e).await;
        }
    }

    async fn apply_envelope(&mut self, envelope: SignalEnvelope) -> Result<()> {
        let self_id = self.self_id();
        if envelope.to != self_id {
            log::debug!("Envelope for {} delivered to {}; ignoring", envelope.to, self_id);
            return Ok(());
        }
        if !envelope.is_well_formed() {
            log::warn!("Malformed {:?} from {}; ignoring", envelope.kind, envelope.from);
            return Ok(());
        }
        if self.failed.contains(&envelope.from) {
            log::debug!("Ignoring {:?} from failed peer {}", envelope.kind, envelope.from);
            return Ok(());
        }
        if !self.negotiator.admit(&envelope) {
            return Ok(());
        }

        let from = envelope.from.clone();
        let kind = envelope.kind;
        let applied = match (envelope.kind, envelope.sdp, envelope.candidate) {
            (SignalKind::Offer, Some(sdp), _) => {
                let (applied, answer) = self
                    .negotiator
                    .on_offer(&mut self.manager, &from, SessionDescription::offer(sdp))
                    .await?;
                if let Some(answer) = answer {
                    self.send_signal(SignalEnvelope::answer(&self_id, &from, answer.sdp));
                }
                self.arm_deadline(&from);
                applied
            }
            (SignalKind::Answer, Some(sdp), _) => {
                self.negotiator
                    .on_answer(&mut self.manager, &from, SessionDescription::answer(sdp))
                    .await?
            }
            (SignalKind::Candidate, _, Some(candidate)) => {
                self.negotiator
                    .on_candidate(&mut self.manager, &from, candidate)
                    .await?
            }
            _ => Applied::Stale,
        };
        if applied == Applied::Stale {
            log::debug!("Stale {:?} from {} ignored", kind, from);
        }
        Ok(())
    }

    async fn on_roster(&mut self, records: Vec<PresenceRecord>) {
        if !matches!(self.mode, Mode::Room { .. }) {
            return;
        }
        let self_id = self.self_id();
        let others = |records: &[PresenceRecord]| -> HashSet<String> {
            records
                .iter()
                .map(|r| r.peer_id.clone())
                .filter(|p| *p != self_id)
                .collect()
        };
        let before = others(&self.roster);
        let present = others(&records);
        self.roster = records;

        let mut departed: Vec<&String> = before.difference(&present).collect();
        departed.sort();
        for peer in departed {
            self.peer_departed(peer).await;
        }
        self.failed.retain(|p| present.contains(p));
        self.stranded.retain(|p| present.contains(p));
        self.emit(SessionEvent::RosterChanged(self.active_roster()));

        let mut newcomers: Vec<String> = present
            .into_iter()
            .filter(|p| {
                !self.manager.contains(p) && !self.failed.contains(p) && !self.stranded.contains(p)
            })
            .collect();
        newcomers.sort();
        for peer in newcomers {
            if let Err(e) = self.start_pair(&peer).await {
                self.fail_peer(e).await;
            }
        }
    }

    async fn start_pair(&mut self, peer_id: &str) -> Result<()> {
        match self.negotiator.role_toward(peer_id) {
            Role::Offerer => {
                if let Some(offer) = self
                    .negotiator
                    .start_offer(&mut self.manager, peer_id)
                    .await?
                {
                    log::info!("Offering to {}", peer_id);
                    let self_id = self.self_id();
                    self.send_signal(SignalEnvelope::offer(&self_id, peer_id, offer.sdp));
                }
            }
            Role::Answerer => {
                log::info!("Waiting for an offer from {}", peer_id);
                self.negotiator
                    .expect_offer(&mut self.manager, peer_id)
                    .await?;
            }
        }
        self.arm_deadline(peer_id);
        Ok(())
    }

    async fn peer_departed(&mut self, peer_id: &str) {
        self.manager.close_connection(peer_id).await;
        self.negotiator.forget(peer_id);
        if let Some(outbox) = &mut self.outbox {
            outbox.discard_queued(peer_id);
        }
        self.failed.remove(peer_id);
        self.stranded.remove(peer_id);
        log::info!("Peer {} left", peer_id);
        self.emit(SessionEvent::PeerLeft {
            peer_id: peer_id.to_string(),
        });
    }

    /// Closes one peer's connection and keeps the rest of the session going.
    async fn fail_peer(&mut self, err: CallError) {
        let CallError::NegotiationFailed { peer, .. } = &err else {
            log::warn!("Session error: {}", err);
            return;
        };
        let peer = peer.clone();
        log::warn!("{}", err);
        self.manager.close_connection(&peer).await;
        self.negotiator.forget(&peer);
        self.failed.insert(peer);
        self.emit(SessionEvent::NegotiationFailed(err));
        if matches!(self.mode, Mode::Room { .. }) {
            self.emit(SessionEvent::RosterChanged(self.active_roster()));
        }
    }

    /// Like `fail_peer`, but the peer is retried once the store is back.
    async fn strand_peer(&mut self, err: CallError) {
        let CallError::NegotiationFailed { peer, .. } = &err else {
            return;
        };
        let peer = peer.clone();
        log::warn!("{}; waiting for signaling to come back", err);
        self.manager.close_connection(&peer).await;
        self.negotiator.forget(&peer);
        if let Some(outbox) = &mut self.outbox {
            outbox.discard_queued(&peer);
        }
        self.stranded.insert(peer);
        self.emit(SessionEvent::NegotiationFailed(err));
    }

    fn arm_deadline(&mut self, peer_id: &str) {
        let timeout = self.config.handshake_timeout();
        let tx = self.internal_tx.clone();
        let Some(handle) = self.manager.get_mut(peer_id) else {
            return;
        };
        if handle.has_deadline() || handle.state() == NegotiationState::Connected {
            return;
        }
        let generation = handle.generation();
        handle.set_deadline(tokio::spawn(async move {
            sleep(timeout).await;
            let _ = tx.send(Internal::HandshakeDeadline { generation });
        }));
    }

    // ---- 1:1 calls ----

    async fn create_call(&mut self, want_video: bool) -> Result<String> {
        self.ensure_idle()?;
        let tracks = self.manager.acquire_local_media(want_video).await?;
        self.emit(SessionEvent::LocalMedia(tracks));

        let kind = CallKind::from_video(want_video);
        self.mode = Mode::Caller {
            call_id: None,
            answered: false,
        };
        self.negotiator = Negotiator::new(&self.identity.peer_id);

        match self.publish_call(kind).await {
            Ok(call_id) => {
                self.emit(SessionEvent::CallCreated {
                    call_id: call_id.clone(),
                    kind,
                });
                Ok(call_id)
            }
            Err(e) => {
                log::warn!("Creating call failed: {}", e);
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn publish_call(&mut self, kind: CallKind) -> Result<String> {
        let self_id = self.self_id();
        let handle = self
            .manager
            .create_connection_for(PENDING_ANSWERER, Role::Offerer)
            .await?;
        handle.hold_local_candidates();
        let offer = make_offer(handle).await?;

        let document = CallDocument {
            kind,
            created_at: Utc::now(),
            initiator_id: self_id.clone(),
            room_id: None,
            offer: Some(SignedDescription {
                from: self_id,
                description: offer,
            }),
            answer: None,
        };
        let call_id = self.store.create_call(document).await?;

        self.mode = Mode::Caller {
            call_id: Some(call_id.clone()),
            answered: false,
        };
        self.open_channel(&call_id);
        self.connect_signaling().await?;
        log::info!("Call {} created ({:?})", call_id, kind);
        Ok(call_id)
    }

    async fn answer_call(&mut self, call_id: &str) -> Result<()> {
        self.ensure_idle()?;
        let document = self
            .store
            .get_call(call_id)
            .await?
            .ok_or_else(|| CallError::CallNotFound(call_id.to_string()))?;
        let initiator = document.initiator_id.clone();
        if document.answer.is_some() {
            return Err(CallError::negotiation(&initiator, "call was already answered"));
        }
        let Some(offer) = document.offer else {
            return Err(CallError::negotiation(&initiator, "call has no offer yet"));
        };

        let tracks = self
            .manager
            .acquire_local_media(document.kind.wants_video())
            .await?;
        self.emit(SessionEvent::LocalMedia(tracks));

        self.mode = Mode::Callee {
            call_id: call_id.to_string(),
            answered: false,
        };
        self.open_channel(call_id);

        match self.accept_offer(call_id, &initiator, offer.description).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("Answering call {} failed: {}", call_id, e);
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn accept_offer(
        &mut self,
        call_id: &str,
        initiator: &str,
        offer: SessionDescription,
    ) -> Result<()> {
        self.connect_signaling().await?;
        let (_, answer) = self
            .negotiator
            .on_offer(&mut self.manager, initiator, offer)
            .await?;
        let answer = answer.ok_or_else(|| CallError::negotiation(initiator, "offer was not applied"))?;
        self.store
            .set_call_answer(
                call_id,
                SignedDescription {
                    from: self.self_id(),
                    description: answer,
                },
            )
            .await?;
        if let Mode::Callee { answered, .. } = &mut self.mode {
            *answered = true;
        }
        self.arm_deadline(initiator);
        log::info!("Answered call {} from {}", call_id, initiator);
        Ok(())
    }

    async fn on_call_updated(&mut self, call_id: &str, document: Option<CallDocument>) {
        match (self.mode.clone(), document) {
            (Mode::Caller { call_id: Some(id), .. }, None) | (Mode::Callee { call_id: id, .. }, None)
                if id == call_id =>
            {
                log::info!("Call {} ended", call_id);
                self.emit(SessionEvent::CallEnded {
                    call_id: call_id.to_string(),
                });
                self.leave().await;
            }
            (
                Mode::Caller {
                    call_id: Some(id),
                    answered: false,
                },
                Some(document),
            ) if id == call_id => {
                if let Some(answer) = document.answer {
                    if let Err(e) = self.on_call_answered(answer).await {
                        self.fail_peer(e).await;
                    }
                }
            }
            _ => {}
        }
    }

    async fn on_call_answered(&mut self, answer: SignedDescription) -> Result<()> {
        let from = answer.from.clone();
        if let Mode::Caller { answered, .. } = &mut self.mode {
            *answered = true;
        }
        let held = self.manager.rebind(PENDING_ANSWERER, &from)?;
        self.negotiator
            .on_answer(&mut self.manager, &from, answer.description)
            .await?;

        let self_id = self.self_id();
        log::info!("Call answered by {}; releasing {} candidate(s)", from, held.len());
        for candidate in held {
            self.send_signal(SignalEnvelope::candidate(&self_id, &from, candidate));
        }
        self.arm_deadline(&from);
        Ok(())
    }

    // ---- media ----

    async fn share_screen(&mut self) -> Result<()> {
        if self.mode.is_idle() {
            return Err(CallError::NotJoined);
        }
        if self.manager.screen().is_some_and(LocalTrack::is_live) {
            return Ok(());
        }
        if !self.manager.has_video_slot() {
            return Err(CallError::MediaUnavailable(
                "audio-only call has no video sender to share into".into(),
            ));
        }

        let screen = self.manager.open_display().await?;
        for (peer, e) in self.manager.replace_video_track(&screen).await {
            self.fail_peer(CallError::negotiation(&peer, e.to_string())).await;
        }
        if self.config.release_camera_while_sharing {
            self.manager.release_camera();
        }

        let tx = self.internal_tx.clone();
        let watched = screen.clone();
        let watch = tokio::spawn(async move {
            watched.ended().await;
            let _ = tx.send(Internal::ScreenEnded {
                track_id: watched.id().to_string(),
            });
        });
        if let Some(old) = self.share_watch.replace(watch) {
            old.abort();
        }
        log::info!("Screen share started ({})", screen.id());
        Ok(())
    }

    async fn stop_share(&mut self) -> Result<()> {
        let Some(screen) = self.manager.take_screen() else {
            return Ok(());
        };
        if let Some(watch) = self.share_watch.take() {
            watch.abort();
        }
        screen.stop();

        let camera = self.manager.restore_camera().await;
        self.emit(SessionEvent::ScreenShareStopped);
        if let Some(camera) = camera? {
            for (peer, e) in self.manager.replace_video_track(&camera).await {
                self.fail_peer(CallError::negotiation(&peer, e.to_string())).await;
            }
            log::info!("Screen share stopped, back to camera {}", camera.id());
        }
        Ok(())
    }

    // ---- engine events ----

    async fn on_transport_event(&mut self, event: TransportEvent) {
        let generation = event.generation();
        let Some(peer) = self.manager.peer_for_generation(generation) else {
            log::trace!("Dropping event from retired connection (generation {})", generation);
            return;
        };
        match event {
            TransportEvent::LocalCandidate { candidate, .. } => {
                let Some(handle) = self.manager.get_mut(&peer) else {
                    return;
                };
                handle.gathered.record(&candidate);
                if let Some(candidate) = handle.stash_local(candidate) {
                    let self_id = self.self_id();
                    self.send_signal(SignalEnvelope::candidate(&self_id, &peer, candidate));
                }
            }
            TransportEvent::GatheringComplete { .. } => {
                if let Some(handle) = self.manager.get(&peer) {
                    handle.gathered.log(&peer);
                }
            }
            TransportEvent::RemoteTrack { mut track, .. } => {
                track.peer_id = peer;
                self.manager.add_remote_track(track.clone());
                self.emit(SessionEvent::RemoteTrack(track));
            }
            TransportEvent::StateChanged { state, .. } => self.on_link_state(&peer, state).await,
        }
    }

    async fn on_link_state(&mut self, peer_id: &str, state: LinkState) {
        let grace = self.config.grace_period();
        let tx = self.internal_tx.clone();
        let Some(handle) = self.manager.get_mut(peer_id) else {
            return;
        };
        let peer = peer_id.to_string();

        match state {
            LinkState::Connected => {
                let recovered = handle.clear_grace();
                let newly = on_link_connected(handle);
                if newly {
                    handle.clear_deadline();
                    log::info!("Connected to {} after {:?}", peer, handle.age());
                    self.emit(SessionEvent::PeerConnected {
                        peer_id: peer.clone(),
                    });
                }
                if recovered {
                    log::info!("Connection to {} recovered", peer);
                    self.emit(SessionEvent::ConnectionRecovered { peer_id: peer });
                }
            }
            LinkState::Disconnected | LinkState::Failed => {
                handle.set_link(state);
                if handle.in_grace() {
                    log::debug!("Disconnect of {} already pending", peer);
                    return;
                }
                let generation = handle.generation();
                let transport = handle.transport();
                handle.set_grace(tokio::spawn(async move {
                    sleep(grace).await;
                    let _ = tx.send(Internal::GraceExpired { generation });
                }));
                log::warn!("Connection to {} {:?}, grace period {:?}", peer, state, grace);
                transport.log_selected_pair("BEFORE-FAIL").await;
                self.emit(SessionEvent::ConnectionProblem {
                    peer_id: peer.clone(),
                });
                self.emit(SessionEvent::ConnectionRecovering { peer_id: peer });
            }
            LinkState::Closed => {
                self.fail_peer(CallError::negotiation(&peer, "connection closed by engine"))
                    .await;
            }
            other => handle.set_link(other),
        }
    }

    async fn on_outbox_report(&mut self, report: OutboxReport) {
        match report {
            OutboxReport::Published { to } => log::trace!("Published signal to {}", to),
            OutboxReport::Failed { to, error } => {
                let settled = self
                    .manager
                    .get(&to)
                    .map_or(true, |h| h.state() == NegotiationState::Connected);
                if settled {
                    if error.is_transient() {
                        self.signaling_down(error.to_string());
                    }
                    return;
                }
                let err = CallError::negotiation(&to, format!("signaling publish failed: {}", error));
                if error.is_transient() && matches!(self.mode, Mode::Room { .. }) {
                    self.strand_peer(err).await;
                    self.signaling_down(error.to_string());
                } else {
                    if error.is_transient() {
                        self.signaling_down(error.to_string());
                    }
                    self.fail_peer(err).await;
                }
            }
        }
    }

    async fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::HandshakeDeadline { generation } => {
                let Some(peer) = self.manager.peer_for_generation(generation) else {
                    return;
                };
                let connected = self
                    .manager
                    .get(&peer)
                    .map_or(true, |h| h.state() == NegotiationState::Connected);
                if !connected {
                    self.fail_peer(CallError::negotiation(
                        &peer,
                        format!("not connected within {} ms", self.config.handshake_timeout_ms),
                    ))
                    .await;
                }
            }
            Internal::GraceExpired { generation } => {
                let Some(peer) = self.manager.peer_for_generation(generation) else {
                    return;
                };
                let Some(handle) = self.manager.get_mut(&peer) else {
                    return;
                };
                handle.clear_grace();
                if handle.link() != LinkState::Connected {
                    self.fail_peer(CallError::negotiation(
                        &peer,
                        format!("connection lost for {} ms", self.config.grace_period_ms),
                    ))
                    .await;
                }
            }
            Internal::ScreenEnded { track_id } => {
                if self.manager.screen().is_some_and(|s| s.id() == track_id) {
                    log::info!("Shared source ended on its own");
                    if let Err(e) = self.stop_share().await {
                        log::warn!("Falling back to the camera failed: {}", e);
                    }
                }
            }
            Internal::RetrySignaling { epoch } => {
                if epoch != self.retry_epoch || self.signaling_up || self.mode.is_idle() {
                    return;
                }
                if let Err(e) = self.connect_signaling().await {
                    log::debug!("Reconnect attempt {} failed: {}", self.retry_attempt, e);
                    self.schedule_retry();
                }
            }
        }
    }
}
