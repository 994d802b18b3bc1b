use crate::error::CallError;
use crate::media::{RemoteTrack, TrackSet};
use crate::signaling::{CallKind, PresenceRecord};

/// Everything the UI layer is told about a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Local preview is available.
    LocalMedia(TrackSet),
    RosterChanged(Vec<PresenceRecord>),
    PeerConnected { peer_id: String },
    PeerLeft { peer_id: String },
    RemoteTrack(RemoteTrack),
    ConnectionProblem { peer_id: String },
    ConnectionRecovering { peer_id: String },
    ConnectionRecovered { peer_id: String },
    NegotiationFailed(CallError),
    SignalingUnavailable(CallError),
    SignalingRestored,
    CallCreated { call_id: String, kind: CallKind },
    CallEnded { call_id: String },
    ScreenShareStopped,
    Left,
}

impl SessionEvent {
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            SessionEvent::PeerConnected { peer_id }
            | SessionEvent::PeerLeft { peer_id }
            | SessionEvent::ConnectionProblem { peer_id }
            | SessionEvent::ConnectionRecovering { peer_id }
            | SessionEvent::ConnectionRecovered { peer_id } => Some(peer_id),
            SessionEvent::RemoteTrack(track) => Some(&track.peer_id),
            SessionEvent::NegotiationFailed(CallError::NegotiationFailed { peer, .. }) => Some(peer),
            _ => None,
        }
    }
}
