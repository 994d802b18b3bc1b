//! Signaling store adapter.
//!
//! The store is any pub/sub-capable backend (document DB change feed,
//! WebSocket relay, broker). It carries directed envelopes, presence
//! rosters and 1:1 call documents. Subscriptions push [`StoreEvent`]s into
//! a channel owned by the subscriber; an unreachable store is reported as
//! `StoreEvent::Unavailable` on that channel, never as a panic.

pub mod memory;
pub mod outbox;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::peer::types::{IceCandidate, SessionDescription};

pub use memory::MemoryStore;
pub use outbox::{Outbox, OutboxReport};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

/// Directed, single-delivery signaling envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    /// Sender-side counter per (from, to) pair.
    #[serde(default)]
    pub sequence: u64,
    /// Assigned by the store on publish; monotonic per store.
    #[serde(default)]
    pub ts: u64,
}

impl SignalEnvelope {
    pub fn offer(from: &str, to: &str, sdp: String) -> Self {
        Self::new(SignalKind::Offer, from, to, Some(sdp), None)
    }

    pub fn answer(from: &str, to: &str, sdp: String) -> Self {
        Self::new(SignalKind::Answer, from, to, Some(sdp), None)
    }

    pub fn candidate(from: &str, to: &str, candidate: IceCandidate) -> Self {
        Self::new(SignalKind::Candidate, from, to, None, Some(candidate))
    }

    fn new(
        kind: SignalKind,
        from: &str,
        to: &str,
        sdp: Option<String>,
        candidate: Option<IceCandidate>,
    ) -> Self {
        Self {
            kind,
            from: from.to_string(),
            to: to.to_string(),
            sdp,
            candidate,
            sequence: 0,
            ts: 0,
        }
    }

    /// Offer/answer must carry SDP, candidates must carry a candidate.
    pub fn is_well_formed(&self) -> bool {
        match self.kind {
            SignalKind::Offer | SignalKind::Answer => self.sdp.is_some(),
            SignalKind::Candidate => self.candidate.is_some(),
        }
    }
}

/// One active participant in a room.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub peer_id: String,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    pub fn from_video(want_video: bool) -> Self {
        if want_video {
            CallKind::Video
        } else {
            CallKind::Audio
        }
    }

    pub fn wants_video(self) -> bool {
        self == CallKind::Video
    }
}

/// Description written into a 1:1 call document, tagged with its author.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SignedDescription {
    pub from: String,
    #[serde(flatten)]
    pub description: SessionDescription,
}

/// Room or 1:1 call document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallDocument {
    pub kind: CallKind,
    pub created_at: DateTime<Utc>,
    pub initiator_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SignedDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SignedDescription>,
}

/// Opaque token the subscriber hands back to delete a consumed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(pub u64);

#[derive(Debug, Clone)]
pub enum StoreEvent {
    Incoming {
        envelope: SignalEnvelope,
        receipt: Receipt,
    },
    Roster(Vec<PresenceRecord>),
    CallUpdated {
        call_id: String,
        document: Option<CallDocument>,
    },
    Unavailable(String),
    Restored,
}

pub type StoreSender = mpsc::UnboundedSender<StoreEvent>;

/// Live subscription; dropping it unsubscribes.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Appends an envelope for `envelope.to`; the store assigns `ts`.
    async fn publish(&self, room: &str, envelope: SignalEnvelope) -> Result<(), StoreError>;

    /// Deletes a consumed envelope so it is never delivered again.
    async fn acknowledge(&self, room: &str, receipt: &Receipt) -> Result<(), StoreError>;

    /// Deletes everything waiting for `peer_id`, acknowledged or not.
    async fn clear_inbox(&self, room: &str, peer_id: &str) -> Result<(), StoreError>;

    /// Delivers every envelope addressed to `self_id`, in arrival order,
    /// including ones already waiting.
    async fn subscribe_incoming(
        &self,
        room: &str,
        self_id: &str,
        events: StoreSender,
    ) -> Result<Subscription, StoreError>;

    /// Delivers the full roster now and on every membership change.
    async fn subscribe_presence(
        &self,
        room: &str,
        events: StoreSender,
    ) -> Result<Subscription, StoreError>;

    async fn put_presence(&self, room: &str, record: PresenceRecord) -> Result<(), StoreError>;

    async fn remove_presence(&self, room: &str, peer_id: &str) -> Result<(), StoreError>;

    /// Creates a call document and returns its generated id.
    async fn create_call(&self, document: CallDocument) -> Result<String, StoreError>;

    async fn get_call(&self, call_id: &str) -> Result<Option<CallDocument>, StoreError>;

    async fn set_call_answer(
        &self,
        call_id: &str,
        answer: SignedDescription,
    ) -> Result<(), StoreError>;

    async fn delete_call(&self, call_id: &str) -> Result<(), StoreError>;

    /// Pushes `CallUpdated` on every change, `document: None` once deleted.
    async fn watch_call(&self, call_id: &str, events: StoreSender)
        -> Result<Subscription, StoreError>;
}
