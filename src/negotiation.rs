//! Offer/answer/candidate handling per peer pair.
//!
//! The lexicographically smaller peer id always sends the offer, so two
//! participants never offer to each other at the same time. Everything here
//! runs on the session task; handles are reached through the manager and
//! never shared.

use std::collections::HashMap;

use crate::error::{CallError, Result};
use crate::peer::connection::ConnectionHandle;
use crate::peer::ice::PendingCandidates;
use crate::peer::manager::PeerConnectionManager;
use crate::peer::state::{Applied, NegotiationState, Role};
use crate::peer::transport::LinkState;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::signaling::SignalEnvelope;

/// Which side of the (self, peer) pair sends the offer.
pub fn role_for(self_id: &str, peer_id: &str) -> Role {
    if self_id < peer_id {
        Role::Offerer
    } else {
        Role::Answerer
    }
}

fn failed(peer_id: &str) -> impl Fn(CallError) -> CallError + '_ {
    move |e| match e {
        e @ CallError::NegotiationFailed { .. } => e,
        other => CallError::negotiation(peer_id, other.to_string()),
    }
}

pub struct Negotiator {
    self_id: String,
    last_sequence: HashMap<String, u64>,
    /// Candidates from peers we have no handle for yet.
    early: HashMap<String, PendingCandidates>,
}

impl Negotiator {
    pub fn new(self_id: &str) -> Self {
        Self {
            self_id: self_id.to_string(),
            last_sequence: HashMap::new(),
            early: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn role_toward(&self, peer_id: &str) -> Role {
        role_for(&self.self_id, peer_id)
    }

    /// Per-sender ordering guard: a sequence at or below the last one seen
    /// from that sender is a redelivery. Unsequenced envelopes pass.
    pub fn admit(&mut self, envelope: &SignalEnvelope) -> bool {
        if envelope.sequence == 0 {
            return true;
        }
        let last = self.last_sequence.entry(envelope.from.clone()).or_insert(0);
        if envelope.sequence <= *last {
            log::debug!(
                "Stale {:?} from {} (seq {} <= {})",
                envelope.kind,
                envelope.from,
                envelope.sequence,
                last
            );
            return false;
        }
        *last = envelope.sequence;
        true
    }

    /// Drops per-peer bookkeeping once the peer is gone.
    pub fn forget(&mut self, peer_id: &str) {
        self.last_sequence.remove(peer_id);
        self.early.remove(peer_id);
    }

    pub fn early_candidates(&self, peer_id: &str) -> usize {
        self.early.get(peer_id).map(PendingCandidates::len).unwrap_or(0)
    }

    fn adopt_early(&mut self, handle: &mut ConnectionHandle) {
        if let Some(mut early) = self.early.remove(handle.peer_id()) {
            log::debug!(
                "Moving {} early candidate(s) onto connection {}",
                early.len(),
                handle.peer_id()
            );
            handle.buffer_remote_all(early.drain());
        }
    }

    /// Offerer side: builds the handle and a local offer. `None` when a
    /// negotiation with this peer is already under way.
    pub async fn start_offer(
        &mut self,
        mgr: &mut PeerConnectionManager,
        peer_id: &str,
    ) -> Result<Option<SessionDescription>> {
        let handle = mgr.create_connection_for(peer_id, Role::Offerer).await?;
        self.adopt_early(handle);
        if handle.state() != NegotiationState::New {
            return Ok(None);
        }
        let offer = make_offer(handle).await?;
        Ok(Some(offer))
    }

    /// Answerer side: builds a passive handle that waits for the offer.
    pub async fn expect_offer(&mut self, mgr: &mut PeerConnectionManager, peer_id: &str) -> Result<()> {
        let handle = mgr.create_connection_for(peer_id, Role::Answerer).await?;
        self.adopt_early(handle);
        Ok(())
    }

    /// Applies a remote offer and returns the answer to send back.
    pub async fn on_offer(
        &mut self,
        mgr: &mut PeerConnectionManager,
        from: &str,
        offer: SessionDescription,
    ) -> Result<(Applied, Option<SessionDescription>)> {
        let handle = mgr.create_connection_for(from, Role::Answerer).await?;
        self.adopt_early(handle);

        match handle.state() {
            NegotiationState::New | NegotiationState::Connected => {}
            NegotiationState::HaveLocalOffer => {
                log::warn!("Offer collision with {}; keeping our own offer", from);
                return Ok((Applied::Stale, None));
            }
            state => {
                log::debug!("Ignoring offer from {} in state {}", from, state);
                return Ok((Applied::Stale, None));
            }
        }

        let transport = handle.transport();
        transport
            .set_remote_description(offer)
            .await
            .map_err(failed(from))?;
        handle.advance(NegotiationState::HaveRemoteOffer)?;

        let answer = transport.create_answer().await.map_err(failed(from))?;
        transport
            .set_local_description(answer.clone())
            .await
            .map_err(failed(from))?;
        handle.advance(NegotiationState::HaveLocalAnswer)?;

        flush_pending(handle).await;
        settle(handle)?;
        Ok((Applied::Applied, Some(answer)))
    }

    /// Applies a remote answer at most once per local offer.
    pub async fn on_answer(
        &mut self,
        mgr: &mut PeerConnectionManager,
        from: &str,
        answer: SessionDescription,
    ) -> Result<Applied> {
        let Some(handle) = mgr.get_mut(from) else {
            log::debug!("Answer from {} without a connection; ignoring", from);
            return Ok(Applied::Stale);
        };
        self.adopt_early(handle);
        if handle.state() != NegotiationState::HaveLocalOffer {
            log::debug!("Duplicate answer from {} in state {}", from, handle.state());
            return Ok(Applied::Stale);
        }
        let transport = handle.transport();
        if handle.link() != LinkState::Connected && transport.has_remote_description().await {
            return Ok(Applied::Stale);
        }

        transport
            .set_remote_description(answer)
            .await
            .map_err(failed(from))?;
        handle.advance(NegotiationState::HaveRemoteAnswer)?;
        flush_pending(handle).await;
        settle(handle)?;
        Ok(Applied::Applied)
    }

    /// Applies a remote candidate now, or buffers it until a remote
    /// description exists.
    pub async fn on_candidate(
        &mut self,
        mgr: &mut PeerConnectionManager,
        from: &str,
        candidate: IceCandidate,
    ) -> Result<Applied> {
        let Some(handle) = mgr.get_mut(from) else {
            self.early.entry(from.to_string()).or_default().push(candidate);
            return Ok(Applied::Buffered);
        };
        if !handle.state().has_remote_description() {
            handle.buffer_remote(candidate);
            return Ok(Applied::Buffered);
        }
        match handle.transport().add_ice_candidate(candidate).await {
            Ok(()) => Ok(Applied::Applied),
            Err(e) => {
                // One bad candidate does not sink the pair; others may still work.
                log::warn!("Failed to add ICE candidate from {}: {}", from, e);
                Ok(Applied::Stale)
            }
        }
    }
}

/// Creates and installs a local offer on a fresh handle.
pub(crate) async fn make_offer(handle: &mut ConnectionHandle) -> Result<SessionDescription> {
    let peer_id = handle.peer_id().to_string();
    let transport = handle.transport();
    let offer = transport.create_offer().await.map_err(failed(&peer_id))?;
    transport
        .set_local_description(offer.clone())
        .await
        .map_err(failed(&peer_id))?;
    handle.advance(NegotiationState::HaveLocalOffer)?;
    Ok(offer)
}

/// Applies buffered remote candidates in arrival order.
async fn flush_pending(handle: &mut ConnectionHandle) -> usize {
    let pending = handle.take_pending_remote();
    if pending.is_empty() {
        return 0;
    }
    let transport = handle.transport();
    let mut applied = 0;
    for candidate in pending {
        match transport.add_ice_candidate(candidate).await {
            Ok(()) => applied += 1,
            Err(e) => log::warn!("Failed to apply pending candidate for {}: {}", handle.peer_id(), e),
        }
    }
    log::debug!("Flushed {} pending candidate(s) for {}", applied, handle.peer_id());
    applied
}

/// A renegotiation on a live link completes without a new engine event.
fn settle(handle: &mut ConnectionHandle) -> Result<()> {
    if handle.link() == LinkState::Connected {
        handle.advance(NegotiationState::Connected)?;
    }
    Ok(())
}

/// Marks a handle connected once the engine reports it.
pub fn on_link_connected(handle: &mut ConnectionHandle) -> bool {
    handle.set_link(LinkState::Connected);
    match handle.state() {
        NegotiationState::HaveRemoteAnswer | NegotiationState::HaveLocalAnswer => {
            handle.advance(NegotiationState::Connected).is_ok()
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackKind;
    use crate::testing::ScriptedEngine;
    use tokio::sync::mpsc;

    fn manager(engine: &ScriptedEngine) -> PeerConnectionManager {
        let (tx, _rx) = mpsc::unbounded_channel();
        PeerConnectionManager::new(engine.devices.clone(), engine.transports.clone(), tx)
    }

    fn host(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"))
    }

    #[test]
    fn smaller_id_offers() {
        assert_eq!(role_for("a1", "b2"), Role::Offerer);
        assert_eq!(role_for("b2", "a1"), Role::Answerer);
    }

    #[tokio::test]
    async fn offer_answer_round_trip() {
        let engine = ScriptedEngine::new();
        let mut a = manager(&engine);
        let mut b = manager(&engine);
        a.acquire_local_media(true).await.unwrap();
        b.acquire_local_media(true).await.unwrap();
        let mut na = Negotiator::new("a1");
        let mut nb = Negotiator::new("b2");

        let offer = na.start_offer(&mut a, "b2").await.unwrap().unwrap();
        assert_eq!(a.get("b2").unwrap().state(), NegotiationState::HaveLocalOffer);

        let (applied, answer) = nb.on_offer(&mut b, "a1", offer).await.unwrap();
        assert_eq!(applied, Applied::Applied);
        assert_eq!(b.get("a1").unwrap().state(), NegotiationState::HaveLocalAnswer);

        let applied = na.on_answer(&mut a, "b2", answer.unwrap()).await.unwrap();
        assert_eq!(applied, Applied::Applied);
        assert_eq!(a.get("b2").unwrap().state(), NegotiationState::HaveRemoteAnswer);

        let record = engine.transports.latest("b2").unwrap();
        assert_eq!(record.sender_kinds, vec![TrackKind::Audio, TrackKind::Video]);
    }

    #[tokio::test]
    async fn duplicate_answer_changes_state_once() {
        let engine = ScriptedEngine::new();
        let mut a = manager(&engine);
        let mut b = manager(&engine);
        let mut na = Negotiator::new("a1");
        let mut nb = Negotiator::new("b2");

        let offer = na.start_offer(&mut a, "b2").await.unwrap().unwrap();
        let (_, answer) = nb.on_offer(&mut b, "a1", offer).await.unwrap();
        let answer = answer.unwrap();

        assert_eq!(na.on_answer(&mut a, "b2", answer.clone()).await.unwrap(), Applied::Applied);
        assert_eq!(na.on_answer(&mut a, "b2", answer).await.unwrap(), Applied::Stale);
        assert_eq!(a.get("b2").unwrap().state(), NegotiationState::HaveRemoteAnswer);
    }

    #[tokio::test]
    async fn candidates_before_offer_are_buffered_then_flushed_in_order() {
        let engine = ScriptedEngine::new();
        let mut a = manager(&engine);
        let mut b = manager(&engine);
        let mut na = Negotiator::new("a1");
        let mut nb = Negotiator::new("b2");

        for n in 1..=3 {
            let applied = nb.on_candidate(&mut b, "a1", host(n)).await.unwrap();
            assert_eq!(applied, Applied::Buffered);
        }
        assert_eq!(nb.early_candidates("a1"), 3);

        let offer = na.start_offer(&mut a, "b2").await.unwrap().unwrap();
        nb.on_offer(&mut b, "a1", offer).await.unwrap();

        let record = engine.transports.latest("a1").unwrap();
        let applied: Vec<_> = record.remote_candidates.iter().map(|c| c.candidate.clone()).collect();
        assert_eq!(applied, vec![host(1).candidate, host(2).candidate, host(3).candidate]);
        assert_eq!(nb.early_candidates("a1"), 0);
    }

    #[tokio::test]
    async fn malformed_offer_fails_only_that_peer() {
        let engine = ScriptedEngine::new();
        let mut b = manager(&engine);
        let mut nb = Negotiator::new("b2");

        let err = nb
            .on_offer(&mut b, "a1", SessionDescription::offer("not sdp"))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::NegotiationFailed { ref peer, .. } if peer == "a1"));
    }

    #[tokio::test]
    async fn offer_collision_keeps_local_offer() {
        let engine = ScriptedEngine::new();
        let mut a = manager(&engine);
        let mut na = Negotiator::new("a1");
        na.start_offer(&mut a, "b2").await.unwrap();

        let (applied, answer) = na
            .on_offer(&mut a, "b2", SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();
        assert_eq!(applied, Applied::Stale);
        assert!(answer.is_none());
        assert_eq!(a.get("b2").unwrap().state(), NegotiationState::HaveLocalOffer);
    }

    #[test]
    fn redelivered_envelopes_are_not_admitted() {
        let mut n = Negotiator::new("b2");
        let mut env = SignalEnvelope::offer("a1", "b2", "v=0".into());
        env.sequence = 1;
        assert!(n.admit(&env));
        assert!(!n.admit(&env));
        env.sequence = 2;
        assert!(n.admit(&env));

        n.forget("a1");
        env.sequence = 1;
        assert!(n.admit(&env));
    }
}
