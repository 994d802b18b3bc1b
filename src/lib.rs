//! Signaling and session negotiation for small mesh rooms and 1:1 calls.
//!
//! A [`SessionController`] drives one participant: it acquires local
//! media, exchanges offers, answers and ICE candidates with every other
//! participant through a [`SignalStore`], and reports progress as
//! [`SessionEvent`]s. The WebRTC engine sits behind
//! [`peer::TransportFactory`]; [`RtcTransportFactory`] is the webrtc-rs
//! implementation and [`testing::ScriptedEngine`] a deterministic one.

pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod invite;
pub mod logger;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod testing;
pub mod utils;

pub use config::{CallConfig, RetryPolicy};
pub use error::{CallError, Result, StoreError};
pub use events::SessionEvent;
pub use identity::{AnonymousIdentity, Identity, IdentityProvider, StaticIdentity};
pub use invite::CallInvite;
pub use media::{HostFedDevices, LocalTrack, MediaDevices, RemoteTrack, TrackKind, TrackSet};
pub use negotiation::role_for;
pub use peer::{NegotiationState, RtcTransportFactory, Role, ServerConfig};
pub use session::{SessionController, SessionSnapshot};
pub use signaling::{CallKind, MemoryStore, PresenceRecord, SignalEnvelope, SignalStore};
