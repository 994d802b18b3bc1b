#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

use meshcall::testing::ScriptedEngine;
use meshcall::{
    CallConfig, MemoryStore, NegotiationState, SessionController, SessionEvent, SessionSnapshot,
    SignalStore, StaticIdentity,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Participant {
    pub session: SessionController,
    pub events: UnboundedReceiver<SessionEvent>,
    pub engine: ScriptedEngine,
}

impl Participant {
    pub async fn state_of(&self, peer_id: &str) -> Option<NegotiationState> {
        let snapshot = self.session.snapshot().await.ok()?;
        snapshot
            .peers
            .into_iter()
            .find(|(p, _)| p == peer_id)
            .map(|(_, s)| s)
    }

    pub async fn roster_ids(&self) -> Vec<String> {
        match self.session.snapshot().await {
            Ok(snapshot) => snapshot.roster.into_iter().map(|r| r.peer_id).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Polls snapshots until `check` holds.
    pub async fn wait_until<F>(&self, what: &str, check: F) -> SessionSnapshot
    where
        F: Fn(&SessionSnapshot) -> bool,
    {
        let polled = timeout(WAIT, async {
            loop {
                if let Ok(snapshot) = self.session.snapshot().await {
                    if check(&snapshot) {
                        return snapshot;
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        match polled {
            Ok(snapshot) => snapshot,
            Err(_) => panic!("timed out waiting for: {}", what),
        }
    }

    /// Waits for the first event matching `pred`, skipping the rest.
    pub async fn wait_for<F>(&mut self, mut pred: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        let events = &mut self.events;
        timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }
}

pub fn init_logging() {
    meshcall::logger::init();
}

pub fn participant(store: &MemoryStore, peer_id: &str) -> Participant {
    participant_with(store, peer_id, CallConfig::default(), ScriptedEngine::new())
}

pub fn participant_with(
    store: &MemoryStore,
    peer_id: &str,
    config: CallConfig,
    engine: ScriptedEngine,
) -> Participant {
    participant_on(Arc::new(store.clone()), peer_id, config, engine)
}

/// Same as `participant_with`, over any store implementation.
pub fn participant_on(
    store: Arc<dyn SignalStore>,
    peer_id: &str,
    config: CallConfig,
    engine: ScriptedEngine,
) -> Participant {
    init_logging();
    let identity = StaticIdentity::with_peer_id(peer_id, peer_id.to_uppercase());
    let (session, events) = SessionController::spawn(
        config,
        &identity,
        engine.devices.clone(),
        engine.transports.clone(),
        store,
    )
    .expect("session should start");
    Participant {
        session,
        events,
        engine,
    }
}

/// Polls `check` until it holds or `WAIT` elapses.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let polled = timeout(WAIT, async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for: {}", what);
}

pub fn state_in(snapshot: &SessionSnapshot, peer_id: &str) -> Option<NegotiationState> {
    snapshot
        .peers
        .iter()
        .find(|(p, _)| p == peer_id)
        .map(|(_, s)| *s)
}

pub fn connected_to(peer: &str) -> impl Fn(&SessionEvent) -> bool + '_ {
    move |e| matches!(e, SessionEvent::PeerConnected { peer_id } if peer_id == peer)
}
