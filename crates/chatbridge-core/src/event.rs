//! Events emitted by the protocol layer and the bus.

use serde::{Deserialize, Serialize};

/// Every event the relay reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// The protocol changed its credential structure and it must be persisted.
    CredsUpdated,
    /// The protocol connection is established.
    ConnectionOpen,
    /// The protocol connection closed.
    ConnectionClosed(DisconnectReason),
    /// A chat message arrived from the protocol.
    MessageReceived(InboundMessage),
    /// A raw payload arrived on the bus channel.
    BusMessage(String),
}

/// Why the protocol connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The account logged this device out. Terminal.
    LoggedOut,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    MultideviceMismatch,
    BadSession,
    Forbidden,
    RestartRequired,
    UnavailableService,
    Other(u16),
}

impl DisconnectReason {
    /// Map a protocol close status code.
    #[must_use]
    pub const fn from_status_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            408 => Self::ConnectionLost,
            411 => Self::MultideviceMismatch,
            428 => Self::ConnectionClosed,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            503 => Self::UnavailableService,
            515 => Self::RestartRequired,
            other => Self::Other(other),
        }
    }

    /// Whether the close ends the session for good.
    #[must_use]
    pub const fn is_logged_out(self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

/// Addressing of a protocol message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    /// Conversation the message belongs to (user or group id).
    pub remote_jid: Option<String>,
    /// Whether this account authored the message.
    #[serde(default)]
    pub from_me: bool,
    /// Protocol message id.
    pub id: String,
    /// Group participant that authored the message.
    pub participant: Option<String>,
}

/// Coordinates of a shared location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// Decoded content of a protocol message. Media is reported by presence only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageContent {
    /// Plain conversation text.
    pub conversation: Option<String>,
    /// Text of a rich (quoted, linked) message.
    pub extended_text: Option<String>,
    pub has_image: bool,
    pub has_audio: bool,
    pub has_video: bool,
    pub location: Option<Location>,
}

impl MessageContent {
    /// Text carried by the message, preferring the plain conversation body.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        fn non_empty(text: Option<&String>) -> Option<&str> {
            text.map(String::as_str).filter(|t| !t.is_empty())
        }
        non_empty(self.conversation.as_ref()).or_else(|| non_empty(self.extended_text.as_ref()))
    }
}

/// A message delivered by the protocol layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    pub key: MessageKey,
    /// Display name the sender advertises.
    pub push_name: Option<String>,
    pub content: MessageContent,
}
