pub mod connection;
pub mod ice;
pub mod manager;
pub mod rtc;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::ConnectionHandle;
pub use manager::PeerConnectionManager;
pub use rtc::RtcTransportFactory;
pub use state::{Applied, NegotiationState, Role};
pub use transport::{LinkState, PeerTransport, SenderId, TransportEvent, TransportFactory};
pub use types::{IceCandidate, SdpKind, ServerConfig, SessionDescription};
