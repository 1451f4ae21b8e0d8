//! Registry of live sessions, driven by heartbeat records.

use std::{sync::Arc, time::Duration};

use chatbridge_core::{KeyValueStore, SessionId, SessionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;

use crate::{
    auth_state::{SessionError, SessionStateStore},
    keys::KeyNamespace,
};

/// Heartbeat fields owned by the record itself; metadata may not shadow them.
const RESERVED_FIELDS: [&str; 3] = ["sessionId", "lastActive", "status"];

/// Heartbeat record of one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub last_active: DateTime<Utc>,
    pub status: SessionStatus,
    /// Extra fields supplied with the last status update.
    #[serde(flatten)]
    pub metadata: Map<String, serde_json::Value>,
}

impl SessionRecord {
    /// Build a record stamped with the current time.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        status: SessionStatus,
        mut metadata: Map<String, serde_json::Value>,
    ) -> Self {
        for field in RESERVED_FIELDS {
            metadata.remove(field);
        }
        Self {
            session_id,
            last_active: Utc::now(),
            status,
            metadata,
        }
    }

    /// Time since the last heartbeat.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_active).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Enumerates heartbeats and sweeps abandoned sessions.
///
/// Only ever reads heartbeat records; clearing goes through
/// [`SessionStateStore::clear_session`].
#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn KeyValueStore>,
    namespace: KeyNamespace,
}

impl SessionRegistry {
    /// Create a registry over the default namespace.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            namespace: KeyNamespace::default(),
        }
    }

    /// Use a different key namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: KeyNamespace) -> Self {
        self.namespace = namespace;
        self
    }

    /// List every session with a live heartbeat.
    ///
    /// Records that cannot be read or parsed are logged and skipped.
    ///
    /// # Errors
    /// Returns error if the heartbeat namespace cannot be scanned.
    pub async fn list_active(&self) -> Result<Vec<SessionRecord>, SessionError> {
        let keys = self.store.scan(&self.namespace.heartbeats_pattern()).await?;
        let mut sessions = Vec::with_capacity(keys.len());

        for key in keys {
            let raw = match self.store.get(&key).await {
                Ok(Some(raw)) => raw,
                // expired between scan and read
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(key = %key, "Skipping heartbeat that could not be read: {e}");
                    continue;
                }
            };
            let record = match serde_json::from_slice::<SessionRecord>(&raw) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(key = %key, "Skipping unreadable heartbeat: {e}");
                    continue;
                }
            };
            // a sweep clears by record id, so it must name the key's session
            if self.namespace.session_of_heartbeat(&key).as_ref() == Some(&record.session_id) {
                sessions.push(record);
            } else {
                tracing::warn!(
                    key = %key,
                    session = %record.session_id,
                    "Skipping heartbeat filed under another session"
                );
            }
        }

        Ok(sessions)
    }

    /// Clear every session whose heartbeat is older than `max_age`.
    ///
    /// A failure clearing one session is logged and does not stop the sweep.
    /// Returns the number of sessions cleared.
    ///
    /// # Errors
    /// Returns error only if the active sessions cannot be listed.
    pub async fn sweep_expired(&self, max_age: Duration) -> Result<usize, SessionError> {
        let now = Utc::now();
        let expired: Vec<SessionRecord> = self
            .list_active()
            .await?
            .into_iter()
            .filter(|s| s.age(now) > max_age)
            .collect();

        let mut cleared = 0;
        for session in expired {
            let state = SessionStateStore::new(Arc::clone(&self.store), session.session_id.clone())
                .with_namespace(self.namespace.clone());
            match state.clear_session().await {
                Ok(_) => {
                    cleared += 1;
                    tracing::info!(session = %session.session_id, "Cleaned up expired session");
                }
                Err(e) => {
                    tracing::error!(session = %session.session_id, "Failed to clean up expired session: {e}");
                }
            }
        }

        Ok(cleared)
    }

    /// Run [`Self::sweep_expired`] every `interval` until the task is aborted.
    #[must_use]
    pub fn spawn_sweeper(self, interval: Duration, max_age: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sweep_expired(max_age).await {
                    Ok(0) => tracing::debug!("Expiry sweep found nothing to clear"),
                    Ok(n) => tracing::info!(cleared = n, "Expiry sweep finished"),
                    Err(e) => tracing::error!("Expiry sweep failed: {e}"),
                }
            }
        })
    }
}
