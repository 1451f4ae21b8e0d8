//! Seams to the messaging protocol client.
//!
//! The relay never speaks the protocol itself. A [`ProtocolConnector`] opens a
//! connection with the session's [`AuthState`] and reports lifecycle and
//! inbound traffic as [`RelayEvent`]s; the returned [`ProtocolSocket`] sends.

use std::sync::Arc;

use async_trait::async_trait;
use chatbridge_core::{RelayEvent, Value};
use chatbridge_session::AuthState;
use thiserror::Error;
use tokio::sync::mpsc;

/// Mimetype attached to outbound audio.
pub const AUDIO_MIMETYPE: &str = "audio/mp4";

/// One outbound message, by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundContent {
    Text(String),
    Image { url: String },
    Audio { url: String, mimetype: String },
    Video { url: String },
    Location { latitude: f64, longitude: f64 },
}

impl OutboundContent {
    /// Audio with the default mimetype.
    #[must_use]
    pub fn audio(url: impl Into<String>) -> Self {
        Self::Audio {
            url: url.into(),
            mimetype: AUDIO_MIMETYPE.to_string(),
        }
    }

    /// Short kind name for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Image { .. } => "image",
            Self::Audio { .. } => "audio",
            Self::Video { .. } => "video",
            Self::Location { .. } => "location",
        }
    }
}

/// A message the protocol accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    /// Peer id the message went to.
    pub peer: String,
    /// Protocol-assigned message id.
    pub id: String,
    /// Message body as the protocol encoded it; cached for retries.
    pub content: Value,
}

/// A single send failed.
#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("Not connected")]
    NotConnected,
    #[error("Peer rejected: {0}")]
    Rejected(String),
    #[error("Send failed: {0}")]
    Failed(String),
}

/// The connection could not be established or torn down.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Logout failed: {0}")]
    Logout(String),
}

/// Live protocol connection.
#[async_trait]
pub trait ProtocolSocket: Send + Sync {
    /// Send one message to `jid`.
    ///
    /// `Ok(None)` means the protocol accepted the send without echoing it back.
    async fn send(&self, jid: &str, content: OutboundContent) -> Result<Option<SentMessage>, SendError>;

    /// Log the account out on the server.
    async fn logout(&self) -> Result<(), ProtocolError>;
}

/// Opens protocol connections.
#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    /// Connect using `auth`, reporting lifecycle and traffic on `events`.
    async fn connect(
        &self,
        auth: AuthState,
        events: mpsc::UnboundedSender<RelayEvent>,
    ) -> Result<Arc<dyn ProtocolSocket>, ProtocolError>;
}
