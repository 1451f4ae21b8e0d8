//! Bus transport and message relay for the chat bridge.
//!
//! Provides:
//! - Wire envelopes exchanged over the bus (JSON)
//! - Protocol collaborator seams (`ProtocolConnector`, `ProtocolSocket`)
//! - Bus implementations (memory, Redis with feature `redis`)
//! - Delivery notifications (HTTP with feature `http`)
//! - `MessageRelay` - Bidirectional forwarding and connection lifecycle

pub mod bus;
pub mod notify;
pub mod protocol;
pub mod relay;
pub mod socket;

pub use bus::MemoryBus;
#[cfg(feature = "redis")]
pub use bus::RedisBus;
#[cfg(feature = "http")]
pub use notify::HttpNotifier;
pub use notify::{DeliveryNotifier, DeliveryReport, NoopNotifier};
pub use protocol::{Media, MediaSet, Origin, PeerRef, Peers, RelayEnvelope};
pub use relay::{
    ConnectionState, DeliveryOutcome, MessageRelay, PeerDelivery, RelayError, RelayOptions,
};
pub use socket::{OutboundContent, ProtocolConnector, ProtocolError, ProtocolSocket, SendError, SentMessage};
