//! Room sessions over the in-process store and the scripted engine.

mod common;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{
    connected_to, eventually, participant, participant_on, participant_with, state_in, Participant,
};
use meshcall::peer::{IceCandidate, SdpKind};
use meshcall::signaling::{
    CallDocument, Receipt, SignalKind, SignedDescription, StoreSender, Subscription,
};
use meshcall::testing::ScriptedEngine;
use meshcall::{
    CallConfig, CallError, MemoryStore, NegotiationState, PresenceRecord, RetryPolicy,
    SessionEvent, SignalEnvelope, SignalStore, StoreError,
};

const ROOM: &str = "standup";

async fn joined_pair(store: &MemoryStore) -> (Participant, Participant) {
    let mut a1 = participant(store, "a1");
    let mut b2 = participant(store, "b2");
    a1.session.join(ROOM, true).await.unwrap();
    b2.session.join(ROOM, true).await.unwrap();
    a1.wait_for(connected_to("b2")).await;
    b2.wait_for(connected_to("a1")).await;
    (a1, b2)
}

fn presence(peer_id: &str) -> PresenceRecord {
    PresenceRecord {
        peer_id: peer_id.into(),
        display_name: peer_id.to_uppercase(),
        joined_at: Utc::now(),
    }
}

#[tokio::test]
async fn smaller_id_offers_and_both_connect() {
    let store = MemoryStore::new();
    let (a1, b2) = joined_pair(&store).await;

    let offers: Vec<_> = store
        .published()
        .into_iter()
        .filter(|e| e.kind == SignalKind::Offer)
        .collect();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].from, "a1");
    assert_eq!(offers[0].to, "b2");

    let answers: Vec<_> = store
        .published()
        .into_iter()
        .filter(|e| e.kind == SignalKind::Answer)
        .collect();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].from, "b2");

    assert_eq!(a1.engine.transports.offers_created(), 1);
    assert_eq!(b2.engine.transports.offers_created(), 0);
    assert_eq!(a1.state_of("b2").await, Some(NegotiationState::Connected));
    assert_eq!(b2.state_of("a1").await, Some(NegotiationState::Connected));

    let roster = a1.roster_ids().await;
    assert_eq!(roster.len(), 2);
    assert!(roster.contains(&"a1".to_string()) && roster.contains(&"b2".to_string()));
}

#[tokio::test]
async fn remote_tracks_are_reported_per_peer() {
    let store = MemoryStore::new();
    let mut a1 = participant(&store, "a1");
    let b2 = participant(&store, "b2");
    a1.session.join(ROOM, true).await.unwrap();
    b2.session.join(ROOM, false).await.unwrap();

    let event = a1
        .wait_for(|e| matches!(e, SessionEvent::RemoteTrack(_)))
        .await;
    let SessionEvent::RemoteTrack(track) = event else {
        unreachable!()
    };
    assert_eq!(track.peer_id, "b2");
    assert_eq!(track.kind, meshcall::TrackKind::Audio);

    let snapshot = a1
        .wait_until("remote audio listed", |s| !s.remote_tracks.is_empty())
        .await;
    let (peer, kinds) = &snapshot.remote_tracks[0];
    assert_eq!(peer, "b2");
    assert!(kinds.contains(&meshcall::TrackKind::Audio));
}

#[tokio::test]
async fn departure_closes_only_that_connection() {
    let store = MemoryStore::new();
    let (mut a1, b2) = joined_pair(&store).await;

    b2.session.leave().await.unwrap();
    a1.wait_for(|e| matches!(e, SessionEvent::PeerLeft { peer_id } if peer_id == "b2"))
        .await;

    let snapshot = a1.session.snapshot().await.unwrap();
    assert!(snapshot.peers.is_empty());
    assert!(snapshot.remote_tracks.is_empty());
    assert_eq!(snapshot.roster.len(), 1);
    assert_eq!(snapshot.channel.as_deref(), Some(ROOM));
    assert!(a1.engine.transports.latest("b2").unwrap().closed);
    assert_eq!(store.roster(ROOM).len(), 1);
}

#[tokio::test]
async fn rejoining_peer_gets_a_fresh_connection() {
    let store = MemoryStore::new();
    let (mut a1, mut b2) = joined_pair(&store).await;

    b2.session.leave().await.unwrap();
    a1.wait_for(|e| matches!(e, SessionEvent::PeerLeft { .. })).await;
    b2.session.join(ROOM, true).await.unwrap();
    a1.wait_for(connected_to("b2")).await;
    b2.wait_for(connected_to("a1")).await;

    let records: Vec<_> = a1
        .engine
        .transports
        .records()
        .into_iter()
        .filter(|r| r.peer_id == "b2")
        .collect();
    assert_eq!(records.len(), 2);
    assert!(records[0].closed);
    assert!(!records[1].closed);
    assert!(records[1].generation > records[0].generation);
}

#[tokio::test]
async fn rejoin_skips_envelopes_left_from_the_last_visit() {
    let store = MemoryStore::new();
    let (mut a1, mut b2) = joined_pair(&store).await;

    b2.session.leave().await.unwrap();
    a1.wait_for(|e| matches!(e, SessionEvent::PeerLeft { peer_id } if peer_id == "b2"))
        .await;

    // Trickled by a1 for the old connection, after b2 stopped listening.
    let mut late = SignalEnvelope::candidate(
        "a1",
        "b2",
        IceCandidate::new("candidate:7 1 udp 1 10.7.7.7 40007 typ host"),
    );
    late.sequence = 40;
    store.publish(ROOM, late).await.unwrap();
    assert!(store.pending_for(ROOM, "b2") >= 1);

    b2.session.join(ROOM, true).await.unwrap();
    a1.wait_for(connected_to("b2")).await;
    b2.wait_for(connected_to("a1")).await;
    assert_eq!(b2.state_of("a1").await, Some(NegotiationState::Connected));

    let record = b2.engine.transports.latest("a1").unwrap();
    assert!(record
        .remote_candidates
        .iter()
        .all(|c| !c.candidate.contains("10.7.7.7")));

    let offer_seqs: Vec<u64> = store
        .published()
        .iter()
        .filter(|e| e.kind == SignalKind::Offer && e.from == "a1" && e.to == "b2")
        .map(|e| e.sequence)
        .collect();
    assert_eq!(offer_seqs.len(), 2);
    assert!(offer_seqs[1] > offer_seqs[0]);
}

#[tokio::test]
async fn early_candidate_is_applied_first() {
    let store = MemoryStore::new();
    let mut a1 = participant(&store, "a1");
    a1.session.join(ROOM, true).await.unwrap();

    let early = IceCandidate::new("candidate:9 1 udp 1 10.9.9.9 40000 typ host");
    store
        .publish(ROOM, SignalEnvelope::candidate("c3", "a1", early.clone()))
        .await
        .unwrap();
    eventually("early candidate consumed", || store.pending_for(ROOM, "a1") == 0).await;
    assert!(a1.state_of("c3").await.is_none());

    let c3 = participant(&store, "c3");
    c3.session.join(ROOM, true).await.unwrap();
    a1.wait_for(connected_to("c3")).await;

    let transports = a1.engine.transports.clone();
    eventually("c3 candidates applied", || {
        transports
            .latest("c3")
            .is_some_and(|r| r.remote_candidates.len() >= 3)
    })
    .await;
    let record = transports.latest("c3").unwrap();
    assert_eq!(record.remote_candidates.first(), Some(&early));
}

#[tokio::test]
async fn duplicate_answer_is_ignored() {
    let store = MemoryStore::new();
    let (mut a1, _b2) = joined_pair(&store).await;

    let answer = store
        .published()
        .into_iter()
        .find(|e| e.kind == SignalKind::Answer)
        .unwrap();
    let mut replay = answer.clone();
    replay.sequence = 0;
    store.publish(ROOM, replay).await.unwrap();

    eventually("replayed answer consumed", || store.pending_for(ROOM, "a1") == 0).await;
    assert_eq!(a1.state_of("b2").await, Some(NegotiationState::Connected));
    let record = a1.engine.transports.latest("b2").unwrap();
    assert_eq!(record.remote.map(|d| d.kind), Some(SdpKind::Answer));
    assert!(a1.events.try_recv().map_or(true, |e| !matches!(
        e,
        SessionEvent::NegotiationFailed(_)
    )));
}

#[tokio::test]
async fn screen_share_swaps_tracks_without_renegotiating() {
    let store = MemoryStore::new();
    let (mut a1, b2) = joined_pair(&store).await;
    let offers_before = a1.engine.transports.offers_created();
    let published_before = store.published().len();

    a1.session.share_screen().await.unwrap();
    let snapshot = a1.session.snapshot().await.unwrap();
    assert!(snapshot.sharing_screen);
    assert_eq!(state_in(&snapshot, "b2"), Some(NegotiationState::Connected));
    let record = a1.engine.transports.latest("b2").unwrap();
    assert_eq!(record.replacements, 1);
    assert!(record.sender_tracks.iter().any(|t| t.starts_with("screen-")));

    a1.session.stop_share().await.unwrap();
    a1.wait_for(|e| matches!(e, SessionEvent::ScreenShareStopped))
        .await;
    let snapshot = a1.session.snapshot().await.unwrap();
    assert!(!snapshot.sharing_screen);
    assert!(snapshot.cam_on);
    assert_eq!(state_in(&snapshot, "b2"), Some(NegotiationState::Connected));
    assert_eq!(b2.state_of("a1").await, Some(NegotiationState::Connected));

    let record = a1.engine.transports.latest("b2").unwrap();
    assert_eq!(record.replacements, 2);
    assert!(record.sender_tracks.iter().any(|t| t.starts_with("camera-")));
    assert_eq!(a1.engine.transports.offers_created(), offers_before);

    let renegotiation = store.published()[published_before..]
        .iter()
        .any(|e| e.kind != SignalKind::Candidate);
    assert!(!renegotiation);
}

#[tokio::test]
async fn ended_screen_source_falls_back_to_camera() {
    let store = MemoryStore::new();
    let (mut a1, _b2) = joined_pair(&store).await;

    a1.session.share_screen().await.unwrap();
    let screen = a1.engine.devices.last_display().unwrap();
    screen.stop();

    a1.wait_for(|e| matches!(e, SessionEvent::ScreenShareStopped))
        .await;
    let snapshot = a1.session.snapshot().await.unwrap();
    assert!(!snapshot.sharing_screen);
    assert!(snapshot.cam_on);
}

#[tokio::test]
async fn audio_only_session_cannot_share() {
    let store = MemoryStore::new();
    let a1 = participant(&store, "a1");
    a1.session.join(ROOM, false).await.unwrap();

    assert!(matches!(
        a1.session.share_screen().await,
        Err(CallError::MediaUnavailable(_))
    ));
    assert!(!a1.session.toggle_cam(true).await.unwrap());
    assert!(a1.session.toggle_mic(false).await.unwrap());
    assert!(!a1.session.snapshot().await.unwrap().mic_on);
}

#[tokio::test]
async fn denied_media_fails_join_before_signaling() {
    let store = MemoryStore::new();
    let engine = ScriptedEngine::new();
    engine.devices.set_denied(true);
    let a1 = participant_with(&store, "a1", CallConfig::default(), engine);

    let err = a1.session.join(ROOM, true).await.unwrap_err();
    assert!(err.is_media_failure());
    assert!(store.roster(ROOM).is_empty());
    assert!(store.published().is_empty());
    assert_eq!(a1.session.snapshot().await.unwrap().channel, None);
}

#[tokio::test]
async fn joining_twice_is_rejected() {
    let store = MemoryStore::new();
    let a1 = participant(&store, "a1");
    a1.session.join(ROOM, true).await.unwrap();
    assert_eq!(
        a1.session.join("other", true).await.unwrap_err(),
        CallError::AlreadyJoined(ROOM.into())
    );
}

#[tokio::test]
async fn leave_releases_everything_in_any_state() {
    let store = MemoryStore::new();
    let engine = ScriptedEngine::new();
    engine.transports.stall("0a");
    let mut a1 = participant_with(&store, "a1", CallConfig::default(), engine);
    let b2 = participant(&store, "b2");
    a1.session.join(ROOM, true).await.unwrap();
    b2.session.join(ROOM, true).await.unwrap();

    // 0b never offers, z9 never answers, 0a offers but never connects.
    for peer in ["0a", "0b", "z9"] {
        store.put_presence(ROOM, presence(peer)).await.unwrap();
    }
    let a1_offer = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
    store
        .publish(ROOM, SignalEnvelope::offer("0a", "a1", a1_offer.into()))
        .await
        .unwrap();

    a1.wait_for(connected_to("b2")).await;
    a1.wait_until("every pair in flight", |s| {
        state_in(s, "0a") == Some(NegotiationState::HaveLocalAnswer)
            && state_in(s, "0b") == Some(NegotiationState::New)
            && state_in(s, "z9") == Some(NegotiationState::HaveLocalOffer)
    })
    .await;

    a1.session.leave().await.unwrap();
    a1.wait_for(|e| matches!(e, SessionEvent::Left)).await;

    let snapshot = a1.session.snapshot().await.unwrap();
    assert!(snapshot.peers.is_empty());
    assert_eq!(snapshot.live_tracks, 0);
    assert_eq!(snapshot.channel, None);
    assert_eq!(a1.engine.transports.open_count(), 0);
    assert!(store.roster(ROOM).iter().all(|r| r.peer_id != "a1"));

    // Leaving again is a no-op.
    a1.session.leave().await.unwrap();
}

#[tokio::test]
async fn unanswered_handshake_times_out_for_that_peer_only() {
    let store = MemoryStore::new();
    let engine = ScriptedEngine::new();
    engine.transports.stall("b2");
    let config = CallConfig {
        handshake_timeout_ms: 200,
        ..CallConfig::default()
    };
    let mut a1 = participant_with(&store, "a1", config, engine);
    let mut c3 = participant(&store, "c3");
    let b2 = participant(&store, "b2");
    a1.session.join(ROOM, true).await.unwrap();
    b2.session.join(ROOM, true).await.unwrap();
    c3.session.join(ROOM, true).await.unwrap();

    let failed = a1
        .wait_for(|e| matches!(e, SessionEvent::NegotiationFailed(_)))
        .await;
    assert_eq!(failed.peer_id(), Some("b2"));
    c3.wait_for(connected_to("a1")).await;

    a1.wait_until("c3 connected on a1", |s| {
        state_in(s, "c3") == Some(NegotiationState::Connected)
    })
    .await;
    assert_eq!(a1.state_of("b2").await, None);
    let roster = a1.roster_ids().await;
    assert!(!roster.contains(&"b2".to_string()));
    assert!(roster.contains(&"c3".to_string()));
}

#[tokio::test]
async fn grace_period_absorbs_a_brief_disconnect() {
    let store = MemoryStore::new();
    let (mut a1, _b2) = joined_pair(&store).await;

    assert!(a1
        .engine
        .transports
        .set_link("b2", meshcall::peer::LinkState::Disconnected));
    a1.wait_for(|e| matches!(e, SessionEvent::ConnectionRecovering { .. }))
        .await;
    a1.engine
        .transports
        .set_link("b2", meshcall::peer::LinkState::Connected);
    a1.wait_for(|e| matches!(e, SessionEvent::ConnectionRecovered { peer_id } if peer_id == "b2"))
        .await;
    assert_eq!(a1.state_of("b2").await, Some(NegotiationState::Connected));
}

#[tokio::test]
async fn lost_link_fails_after_grace_period() {
    let store = MemoryStore::new();
    let config = CallConfig {
        grace_period_ms: 100,
        ..CallConfig::default()
    };
    let mut a1 = participant_with(&store, "a1", config, ScriptedEngine::new());
    let mut b2 = participant(&store, "b2");
    a1.session.join(ROOM, true).await.unwrap();
    b2.session.join(ROOM, true).await.unwrap();
    a1.wait_for(connected_to("b2")).await;
    b2.wait_for(connected_to("a1")).await;

    a1.engine
        .transports
        .set_link("b2", meshcall::peer::LinkState::Failed);
    let failed = a1
        .wait_for(|e| matches!(e, SessionEvent::NegotiationFailed(_)))
        .await;
    assert_eq!(failed.peer_id(), Some("b2"));
    assert_eq!(a1.state_of("b2").await, None);
}

#[tokio::test]
async fn join_survives_offline_store_and_recovers() {
    let store = MemoryStore::new();
    let config = CallConfig {
        signaling_retry: RetryPolicy {
            max_attempts: 50,
            base_delay_ms: 20,
            max_delay_ms: 50,
        },
        ..CallConfig::default()
    };
    let mut a1 = participant_with(&store, "a1", config, ScriptedEngine::new());
    store.set_available(false);

    let tracks = a1.session.join(ROOM, true).await.unwrap();
    assert!(tracks.video.is_some());
    a1.wait_for(|e| matches!(e, SessionEvent::SignalingUnavailable(_)))
        .await;
    assert!(!a1.session.snapshot().await.unwrap().signaling_up);

    store.set_available(true);
    a1.wait_for(|e| matches!(e, SessionEvent::SignalingRestored))
        .await;
    assert!(a1.session.snapshot().await.unwrap().signaling_up);
    assert_eq!(store.roster(ROOM).len(), 1);

    let b2 = participant(&store, "b2");
    b2.session.join(ROOM, true).await.unwrap();
    a1.wait_for(connected_to("b2")).await;
}

#[tokio::test]
async fn dropping_every_handle_leaves_the_room() {
    let store = MemoryStore::new();
    let a1 = participant(&store, "a1");
    a1.session.join(ROOM, true).await.unwrap();
    assert_eq!(store.roster(ROOM).len(), 1);

    drop(a1);
    eventually("presence removed", || store.roster(ROOM).is_empty()).await;
}

/// Passes everything through except `publish`, which can be switched off.
struct PublishGate {
    inner: MemoryStore,
    open: AtomicBool,
}

impl PublishGate {
    fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            open: AtomicBool::new(true),
        }
    }

    fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

#[async_trait]
impl SignalStore for PublishGate {
    async fn publish(&self, room: &str, envelope: SignalEnvelope) -> Result<(), StoreError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("publish refused".into()));
        }
        self.inner.publish(room, envelope).await
    }

    async fn acknowledge(&self, room: &str, receipt: &Receipt) -> Result<(), StoreError> {
        self.inner.acknowledge(room, receipt).await
    }

    async fn clear_inbox(&self, room: &str, peer_id: &str) -> Result<(), StoreError> {
        self.inner.clear_inbox(room, peer_id).await
    }

    async fn subscribe_incoming(
        &self,
        room: &str,
        self_id: &str,
        events: StoreSender,
    ) -> Result<Subscription, StoreError> {
        self.inner.subscribe_incoming(room, self_id, events).await
    }

    async fn subscribe_presence(
        &self,
        room: &str,
        events: StoreSender,
    ) -> Result<Subscription, StoreError> {
        self.inner.subscribe_presence(room, events).await
    }

    async fn put_presence(&self, room: &str, record: PresenceRecord) -> Result<(), StoreError> {
        self.inner.put_presence(room, record).await
    }

    async fn remove_presence(&self, room: &str, peer_id: &str) -> Result<(), StoreError> {
        self.inner.remove_presence(room, peer_id).await
    }

    async fn create_call(&self, document: CallDocument) -> Result<String, StoreError> {
        self.inner.create_call(document).await
    }

    async fn get_call(&self, call_id: &str) -> Result<Option<CallDocument>, StoreError> {
        self.inner.get_call(call_id).await
    }

    async fn set_call_answer(
        &self,
        call_id: &str,
        answer: SignedDescription,
    ) -> Result<(), StoreError> {
        self.inner.set_call_answer(call_id, answer).await
    }

    async fn delete_call(&self, call_id: &str) -> Result<(), StoreError> {
        self.inner.delete_call(call_id).await
    }

    async fn watch_call(
        &self,
        call_id: &str,
        events: StoreSender,
    ) -> Result<Subscription, StoreError> {
        self.inner.watch_call(call_id, events).await
    }
}

#[tokio::test]
async fn handshake_cut_by_an_outage_resumes_when_signaling_returns() {
    let store = MemoryStore::new();
    let gate = Arc::new(PublishGate::new(store.clone()));
    let config = CallConfig {
        publish_retry: RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 5,
            max_delay_ms: 10,
        },
        signaling_retry: RetryPolicy {
            max_attempts: 1_000,
            base_delay_ms: 20,
            max_delay_ms: 50,
        },
        ..CallConfig::default()
    };
    let mut a1 = participant_on(gate.clone(), "a1", config, ScriptedEngine::new());
    let mut b2 = participant(&store, "b2");
    a1.session.join(ROOM, true).await.unwrap();

    gate.set_open(false);
    b2.session.join(ROOM, true).await.unwrap();
    a1.wait_for(|e| {
        matches!(
            e,
            SessionEvent::NegotiationFailed(CallError::NegotiationFailed { peer, .. }) if peer == "b2"
        )
    })
    .await;
    a1.wait_for(|e| matches!(e, SessionEvent::SignalingUnavailable(_)))
        .await;
    assert!(a1.roster_ids().await.contains(&"b2".to_string()));

    gate.set_open(true);
    a1.wait_for(connected_to("b2")).await;
    b2.wait_for(connected_to("a1")).await;

    let snapshot = a1
        .wait_until("signaling back with b2 connected", |s| {
            s.signaling_up && state_in(s, "b2") == Some(NegotiationState::Connected)
        })
        .await;
    assert!(snapshot.roster.iter().any(|r| r.peer_id == "b2"));
}
