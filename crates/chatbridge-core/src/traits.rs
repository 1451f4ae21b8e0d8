//! Core traits for storage and publish/subscribe.

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Page size hint passed to cursor scans.
pub const SCAN_COUNT: usize = 100;

/// Session identifier.
///
/// Identifiers are embedded in store keys and scan patterns, so they may not
/// contain the key separator, glob metacharacters or whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

/// Rejected session identifier.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid session id {0:?}: must be non-empty without ':', glob characters or whitespace")]
pub struct InvalidSessionId(pub String);

impl SessionId {
    /// Validate and wrap an identifier.
    ///
    /// # Errors
    /// Returns error if the identifier would break key namespace isolation.
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidSessionId> {
        let id = id.into();
        let valid = !id.is_empty()
            && !id
                .chars()
                .any(|c| matches!(c, ':' | '*' | '?' | '[' | ']' | '\\') || c.is_whitespace());
        if valid { Ok(Self(id)) } else { Err(InvalidSessionId(id)) }
    }

    /// Borrow the identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = InvalidSessionId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for SessionId {
    type Error = InvalidSessionId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

/// Session lifecycle status as reported in the heartbeat record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Connection attempt in progress.
    Connecting,
    /// Connection established.
    Open,
    /// Connection closed.
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        })
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Store error: {0}")]
    Internal(String),
}

/// One page of a cursor scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next page; `0` means the enumeration is complete.
    pub cursor: u64,
    /// Keys matched on this page. May be empty even when `cursor != 0`.
    pub keys: Vec<String>,
}

/// Trait for key-value store backends.
///
/// Patterns follow glob rules: `*` matches any run of characters, `?` a single
/// character, and `\` escapes the next character.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a plain value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a plain value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Delete a key of any kind. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Read several fields of a hash. Every requested field is present in the
    /// result, mapped to `None` when absent.
    async fn hash_get(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<HashMap<String, Option<Vec<u8>>>, StoreError>;

    /// Write several fields of a hash in one call.
    async fn hash_set_many(&self, key: &str, entries: &[(String, Vec<u8>)])
    -> Result<(), StoreError>;

    /// Remove fields from a hash.
    async fn hash_delete(&self, key: &str, fields: &[String]) -> Result<(), StoreError>;

    /// Fetch one page of keys matching `pattern`, starting at `cursor`.
    async fn scan_page(&self, pattern: &str, cursor: u64, count: usize)
    -> Result<ScanPage, StoreError>;

    /// Delete many keys in a single batched round trip.
    async fn delete_batch(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Enumerate every key matching `pattern`.
    ///
    /// Follows the cursor until it returns to `0`; a partially drained scan is
    /// never reported as complete.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut cursor = 0;
        loop {
            let page = self.scan_page(pattern, cursor, SCAN_COUNT).await?;
            keys.extend(page.keys);
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }
}

/// Bus error.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus unavailable: {0}")]
    Unavailable(String),
    #[error("Bus channel closed: {0}")]
    Closed(String),
}

/// Trait for publish/subscribe backends.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload on a channel.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    /// Subscribe to a channel, yielding raw payloads as they arrive.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_validation() {
        assert!(SessionId::new("default").is_ok());
        assert!(SessionId::new("tenant-42_a.b").is_ok());
        assert!(SessionId::new("").is_err());
        assert!(SessionId::new("a:b").is_err());
        assert!(SessionId::new("a*").is_err());
        assert!(SessionId::new("a b").is_err());
    }

    #[test]
    fn test_session_id_serde() {
        let id: SessionId = serde_json::from_str("\"main\"").unwrap();
        assert_eq!(id.as_str(), "main");
        assert!(serde_json::from_str::<SessionId>("\"x:y\"").is_err());
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"main\"");
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SessionStatus::Connecting).unwrap();
        assert_eq!(json, "\"connecting\"");
        assert_eq!(SessionStatus::Open.to_string(), "open");
    }
}
