use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::media::{LocalTrack, RemoteTrack};
use crate::peer::types::{IceCandidate, SessionDescription};

/// Engine-level connectivity, as reported by the ICE/DTLS stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callback output of one transport.
///
/// Every event carries the generation of the handle that created the
/// transport; the session drops events whose generation no longer maps to a
/// live handle.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate {
        generation: u64,
        candidate: IceCandidate,
    },
    GatheringComplete {
        generation: u64,
    },
    RemoteTrack {
        generation: u64,
        track: RemoteTrack,
    },
    StateChanged {
        generation: u64,
        state: LinkState,
    },
}

impl TransportEvent {
    pub fn generation(&self) -> u64 {
        match self {
            TransportEvent::LocalCandidate { generation, .. }
            | TransportEvent::GatheringComplete { generation }
            | TransportEvent::RemoteTrack { generation, .. }
            | TransportEvent::StateChanged { generation, .. } => *generation,
        }
    }
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Index of an outgoing sender on one transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub usize);

/// One peer connection inside the media engine.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId>;

    /// Swaps what a sender transmits. No renegotiation.
    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn has_remote_description(&self) -> bool;

    /// Releases engine resources. Must tolerate repeated calls.
    async fn close(&self) -> Result<()>;

    /// Diagnostics hook run when the link degrades.
    async fn log_selected_pair(&self, _moment: &str) {}
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        generation: u64,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>>;
}
