use thiserror::Error;

/// Errors surfaced by the call core.
///
/// Device and store failures are meant for user-visible messaging.
/// `NegotiationFailed` is scoped to one peer and never aborts the session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("media access denied: {0}")]
    MediaAccessDenied(String),

    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(String),

    #[error("negotiation with {peer} failed: {reason}")]
    NegotiationFailed { peer: String, reason: String },

    #[error("call {0} does not exist")]
    CallNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid call invite: {0}")]
    InvalidInvite(String),

    #[error("not joined to a call")]
    NotJoined,

    #[error("already joined to {0}")]
    AlreadyJoined(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("engine error: {0}")]
    Engine(String),
}

impl CallError {
    pub fn negotiation(peer: &str, reason: impl Into<String>) -> Self {
        CallError::NegotiationFailed {
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }

    /// True for failures that end the session before any signaling starts.
    pub fn is_media_failure(&self) -> bool {
        matches!(
            self,
            CallError::MediaAccessDenied(_) | CallError::MediaUnavailable(_)
        )
    }
}

impl From<webrtc::Error> for CallError {
    fn from(e: webrtc::Error) -> Self {
        CallError::Engine(e.to_string())
    }
}

/// Failures reported by a signaling store adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("store rejected the write: {0}")]
    Rejected(String),
}

impl StoreError {
    /// Transient failures are worth a retry; rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<StoreError> for CallError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => CallError::CallNotFound(id),
            other => CallError::SignalingUnavailable(other.to_string()),
        }
    }
}

pub type Result<T, E = CallError> = std::result::Result<T, E>;
