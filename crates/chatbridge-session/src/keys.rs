//! Store key layout.
//!
//! Every record lives under `<prefix>:<kind>:<session>`, one kind per concern:
//! `creds`, `keys`, `messages` and `sessions` (heartbeats).

use chatbridge_core::SessionId;

/// Builds store keys and scan patterns for one namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNamespace {
    prefix: String,
}

impl Default for KeyNamespace {
    fn default() -> Self {
        Self::new("chatbridge")
    }
}

impl KeyNamespace {
    /// Create a namespace rooted at `prefix`.
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Credential blob of a session.
    #[must_use]
    pub fn creds(&self, session: &SessionId) -> String {
        format!("{}:creds:{session}", self.prefix)
    }

    /// Hash holding every key of one type for a session.
    #[must_use]
    pub fn key_group(&self, session: &SessionId, key_type: &str) -> String {
        format!("{}:keys:{session}:{key_type}", self.prefix)
    }

    /// Pattern matching all key groups of a session, whatever their type.
    #[must_use]
    pub fn key_groups_pattern(&self, session: &SessionId) -> String {
        format!("{}:keys:{session}:*", escape_glob(&self.prefix))
    }

    /// Cached message of a session.
    #[must_use]
    pub fn message(&self, session: &SessionId, peer: &str, id: &str) -> String {
        format!("{}:messages:{session}:{peer}:{id}", self.prefix)
    }

    /// Pattern matching all cached messages of a session.
    #[must_use]
    pub fn messages_pattern(&self, session: &SessionId) -> String {
        format!("{}:messages:{session}:*", escape_glob(&self.prefix))
    }

    /// Heartbeat record of a session.
    #[must_use]
    pub fn heartbeat(&self, session: &SessionId) -> String {
        format!("{}:sessions:{session}", self.prefix)
    }

    /// Pattern matching every heartbeat record.
    #[must_use]
    pub fn heartbeats_pattern(&self) -> String {
        format!("{}:sessions:*", escape_glob(&self.prefix))
    }

    /// Recover the session id from a heartbeat key.
    #[must_use]
    pub fn session_of_heartbeat(&self, key: &str) -> Option<SessionId> {
        key.strip_prefix(&self.prefix)?
            .strip_prefix(":sessions:")
            .and_then(|id| SessionId::new(id).ok())
    }
}

/// Escape glob metacharacters so `text` matches literally inside a pattern.
#[must_use]
pub fn escape_glob(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
