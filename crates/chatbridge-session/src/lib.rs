//! Session state persistence for the chat bridge.
//!
//! Provides:
//! - `SessionStateStore` / `AuthState` - Credentials, key material and message cache
//! - `SessionRegistry` - Heartbeat listing and expiry sweeps
//! - Store implementations (memory, Redis)

pub mod auth_state;
pub mod keys;
pub mod registry;
pub mod storage;

pub use auth_state::{AuthState, KeyAccess, SessionError, SessionStateStore};
pub use keys::KeyNamespace;
pub use registry::{SessionRecord, SessionRegistry};
