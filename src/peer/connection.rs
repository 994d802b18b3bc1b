use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

use crate::error::{CallError, Result};
use crate::peer::ice::{CandidateSummary, PendingCandidates};
use crate::peer::state::{NegotiationState, Role};
use crate::peer::transport::{LinkState, PeerTransport, SenderId};
use crate::peer::types::IceCandidate;

/// One connection to one remote peer, owned by the session.
pub struct ConnectionHandle {
    peer_id: String,
    generation: u64,
    role: Role,
    state: NegotiationState,
    link: LinkState,
    transport: Arc<dyn PeerTransport>,
    pub(crate) audio_sender: Option<SenderId>,
    pub(crate) video_sender: Option<SenderId>,
    pending_remote: PendingCandidates,
    /// Local candidates held back while the remote peer is still unknown
    /// (1:1 creator before anyone answered).
    pending_local: Vec<IceCandidate>,
    hold_local: bool,
    pub(crate) gathered: CandidateSummary,
    deadline: Option<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
    created_at: Instant,
}

impl ConnectionHandle {
    pub(crate) fn new(
        peer_id: &str,
        generation: u64,
        role: Role,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            generation,
            role,
            state: NegotiationState::New,
            link: LinkState::New,
            transport,
            audio_sender: None,
            video_sender: None,
            pending_remote: PendingCandidates::default(),
            pending_local: Vec::new(),
            hold_local: false,
            gathered: CandidateSummary::default(),
            deadline: None,
            grace: None,
            created_at: Instant::now(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        self.transport.clone()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Moves along a legal edge; anything else is a negotiation failure.
    pub fn advance(&mut self, next: NegotiationState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CallError::negotiation(
                &self.peer_id,
                format!("illegal transition {} -> {}", self.state, next),
            ));
        }
        log::debug!("Negotiation {}: {} -> {}", self.peer_id, self.state, next);
        self.state = next;
        Ok(())
    }

    pub(crate) fn set_link(&mut self, link: LinkState) {
        self.link = link;
    }

    pub(crate) fn buffer_remote(&mut self, candidate: IceCandidate) {
        self.pending_remote.push(candidate);
    }

    pub(crate) fn buffer_remote_all(&mut self, candidates: impl IntoIterator<Item = IceCandidate>) {
        self.pending_remote.extend(candidates);
    }

    pub(crate) fn take_pending_remote(&mut self) -> Vec<IceCandidate> {
        self.pending_remote.drain()
    }

    pub(crate) fn hold_local_candidates(&mut self) {
        self.hold_local = true;
    }

    pub fn holds_local_candidates(&self) -> bool {
        self.hold_local
    }

    /// Returns the candidate back when it may be sent right away.
    pub(crate) fn stash_local(&mut self, candidate: IceCandidate) -> Option<IceCandidate> {
        if self.hold_local {
            self.pending_local.push(candidate);
            None
        } else {
            Some(candidate)
        }
    }

    /// Binds the handle to the peer that answered and releases held candidates.
    pub(crate) fn bind_remote(&mut self, peer_id: &str) -> Vec<IceCandidate> {
        self.peer_id = peer_id.to_string();
        self.hold_local = false;
        std::mem::take(&mut self.pending_local)
    }

    pub(crate) fn set_deadline(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.deadline.replace(task) {
            old.abort();
        }
    }

    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    pub(crate) fn clear_deadline(&mut self) {
        if let Some(task) = self.deadline.take() {
            task.abort();
        }
    }

    pub fn in_grace(&self) -> bool {
        self.grace.is_some()
    }

    pub(crate) fn set_grace(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.grace.replace(task) {
            old.abort();
        }
    }

    /// Cancels a pending disconnect; true if one was running.
    pub(crate) fn clear_grace(&mut self) -> bool {
        match self.grace.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Aborts timers and releases the transport. Safe to call twice.
    pub(crate) async fn close(&mut self) {
        if self.state.is_closed() {
            return;
        }
        self.clear_deadline();
        self.clear_grace();
        self.pending_remote.drain();
        self.pending_local.clear();
        self.state = NegotiationState::Closed;
        self.link = LinkState::Closed;
        if let Err(e) = self.transport.close().await {
            log::warn!("Closing connection to {} failed: {}", self.peer_id, e);
        }
        log::info!("Connection to {} closed (generation {})", self.peer_id, self.generation);
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.clear_deadline();
        self.clear_grace();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("peer_id", &self.peer_id)
            .field("generation", &self.generation)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("link", &self.link)
            .finish()
    }
}
