//! Core abstractions for the chat bridge.
//!
//! This crate provides the fundamental building blocks:
//! - `KeyValueStore` / `MessageBus` - Backend traits for persistence and pub/sub
//! - `Value` + `codec` - Binary-safe text encoding of protocol structures
//! - `RelayEvent` - The closed set of events the relay dispatches
//! - `MsgStore` - Bounded ring of recent inbound messages with live updates
//! - `BridgeConfig` - Environment-driven configuration

pub mod codec;
pub mod config;
pub mod event;
pub mod msg_store;
pub mod traits;

pub use codec::{CodecError, Value};
pub use config::{BridgeConfig, ConfigError};
pub use event::{
    DisconnectReason, InboundMessage, Location, MessageContent, MessageKey, RelayEvent,
};
pub use msg_store::{InboundRecord, MsgStore};
pub use traits::{
    BusError, InvalidSessionId, KeyValueStore, MessageBus, ScanPage, SessionId, SessionStatus,
    StoreError,
};
