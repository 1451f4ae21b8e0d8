//! Wire envelopes exchanged over the bus.
//!
//! One JSON shape travels in both directions:
//! `{transmitter, phone, name, message, send: {image?, audio?, video?, location?}, verification?}`.

use std::fmt;

use chatbridge_core::{InboundMessage, Location};
use serde::{Deserialize, Deserializer, Serialize};

/// Domain of personal peer ids on the protocol.
pub const PERSONAL_SUFFIX: &str = "@s.whatsapp.net";

/// Domain of group ids on the protocol.
pub const GROUP_SUFFIX: &str = "@g.us";

/// Text relayed for messages that carry no text body.
pub const NON_TEXT_PLACEHOLDER: &str = "[non-text message]";

/// Who produced an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Relayed from the messaging protocol.
    #[serde(alias = "whatsapp")]
    Protocol,
    /// Published by an external system asking the relay to send.
    #[serde(alias = "N8N")]
    External,
}

/// A phone number or token that may arrive as a JSON string or number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeerRef {
    Text(String),
    Number(serde_json::Number),
}

impl PeerRef {
    /// Whether the reference carries anything (non-empty text, non-zero number).
    #[must_use]
    pub fn is_present(&self) -> bool {
        match self {
            Self::Text(t) => !t.is_empty(),
            Self::Number(n) => n.as_f64().is_some_and(|v| v.abs() > f64::EPSILON),
        }
    }

    /// Protocol peer id for an outbound send: digits only, personal domain.
    ///
    /// Returns `None` when the reference has no digits at all.
    #[must_use]
    pub fn to_protocol_jid(&self) -> Option<String> {
        let digits: String = self.to_string().chars().filter(char::is_ascii_digit).collect();
        if digits.is_empty() {
            None
        } else {
            Some(format!("{digits}{PERSONAL_SUFFIX}"))
        }
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(t) => f.write_str(t),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for PeerRef {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// One peer or a list of peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Peers {
    One(PeerRef),
    Many(Vec<PeerRef>),
}

impl Default for Peers {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl Peers {
    /// Peers in order.
    ///
    /// An empty single peer means no peer at all; empty entries of a list are
    /// kept so their failed delivery gets reported.
    #[must_use]
    pub fn to_vec(&self) -> Vec<&PeerRef> {
        match self {
            Self::One(p) if p.is_present() => vec![p],
            Self::One(_) => Vec::new(),
            Self::Many(ps) => ps.iter().collect(),
        }
    }
}

/// A single piece of media to forward.
#[derive(Debug, Clone, PartialEq)]
pub enum Media {
    Image(String),
    Audio(String),
    Video(String),
    Location(Location),
}

/// Media attached to an envelope; at most one of each kind.
///
/// Unknown media kinds are rejected when parsing rather than ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediaSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl MediaSet {
    /// Attached media in send order: image, audio, video, location.
    #[must_use]
    pub fn items(&self) -> Vec<Media> {
        let reference = |r: &Option<String>| r.as_ref().filter(|r| !r.is_empty()).cloned();
        let mut items = Vec::new();
        if let Some(url) = reference(&self.image) {
            items.push(Media::Image(url));
        }
        if let Some(url) = reference(&self.audio) {
            items.push(Media::Audio(url));
        }
        if let Some(url) = reference(&self.video) {
            items.push(Media::Video(url));
        }
        if let Some(location) = self.location {
            items.push(Media::Location(location));
        }
        items
    }

    /// Whether nothing is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}

/// Completion callback request carried by external envelopes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    #[serde(default)]
    pub id: Option<PeerRef>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The canonical bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    #[serde(rename = "transmitter")]
    pub origin: Origin,
    #[serde(rename = "phone", default, deserialize_with = "null_as_default")]
    pub peers: Peers,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "message", default, deserialize_with = "null_as_default")]
    pub text: String,
    #[serde(rename = "send", default, deserialize_with = "null_as_default")]
    pub media: MediaSet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<Verification>,
}

impl RelayEnvelope {
    /// Build the bus envelope for a protocol message.
    ///
    /// Returns `None` for messages this account sent and messages without a
    /// conversation id.
    #[must_use]
    pub fn from_inbound(msg: &InboundMessage) -> Option<Self> {
        if msg.key.from_me {
            return None;
        }
        let jid = msg.key.remote_jid.as_deref().filter(|j| !j.is_empty())?;

        let name = msg
            .push_name
            .clone()
            .or_else(|| msg.key.participant.clone())
            .unwrap_or_default();
        let text = msg
            .content
            .text()
            .unwrap_or(NON_TEXT_PLACEHOLDER)
            .to_string();
        let marker = |present: bool, tag: &str| present.then(|| tag.to_string());

        Some(Self {
            origin: Origin::Protocol,
            peers: Peers::One(PeerRef::Text(normalize_peer(jid))),
            name,
            text,
            media: MediaSet {
                image: marker(msg.content.has_image, "[image]"),
                audio: marker(msg.content.has_audio, "[audio]"),
                video: marker(msg.content.has_video, "[video]"),
                location: msg.content.location,
            },
            verification: None,
        })
    }

    /// Sanitize and parse a raw bus payload.
    ///
    /// # Errors
    /// Returns error if the sanitized text is not a valid envelope.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(&sanitize(raw))
    }

    /// Serialize for publishing.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Verification token, when one was supplied.
    #[must_use]
    pub fn verification_token(&self) -> Option<&PeerRef> {
        self.verification
            .as_ref()
            .and_then(|v| v.id.as_ref())
            .filter(|id| id.is_present())
    }
}

/// Clean a raw bus payload before JSON parsing.
///
/// Newlines become a literal `\n` escape, bullets (`•`) become hyphens and
/// remaining control characters are dropped.
#[must_use]
pub fn sanitize(raw: &str) -> String {
    raw.replace('\n', "\\n")
        .replace('\u{2022}', "-")
        .chars()
        .filter(|c| !matches!(c, '\u{0}'..='\u{1f}' | '\u{7f}'))
        .collect()
}

/// Reduce a protocol peer id to the bare number relayed on the bus.
///
/// Personal ids lose their domain and any `:device` suffix; group ids
/// `<creator>-<stamp>@g.us` reduce to the creator. Anything else passes through.
#[must_use]
pub fn normalize_peer(jid: &str) -> String {
    if let Some(user) = jid.strip_suffix(PERSONAL_SUFFIX) {
        return user.split(':').next().unwrap_or(user).to_string();
    }
    if jid.ends_with(GROUP_SUFFIX) && jid.contains('-') {
        return jid.split('-').next().unwrap_or(jid).to_string();
    }
    jid.to_string()
}
