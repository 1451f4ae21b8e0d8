//! Per-session credential, key material and message cache persistence.
//!
//! The store is the single source of truth: nothing here caches key material
//! in process, so several processes serving one session observe each other's
//! writes immediately.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chatbridge_core::{
    KeyValueStore, SessionId, SessionStatus, StoreError, Value,
    codec::{self, CodecError},
};
use chrono::Utc;
use serde_json::Map;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::{keys::KeyNamespace, registry::SessionRecord};

/// Lifetime of a heartbeat record without refresh.
pub const HEARTBEAT_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Retention of cached messages.
pub const MESSAGE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Upper bound on delete-then-rescan rounds in [`SessionStateStore::clear_session`].
const CLEAR_PASSES: usize = 3;

/// Session state error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Stored record is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("Heartbeat record error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Key material updates grouped by key type, then key id. `None` deletes.
pub type KeyUpdates = HashMap<String, HashMap<String, Option<Value>>>;

type CredsFactory = Arc<dyn Fn() -> Value + Send + Sync>;

fn decode_record(raw: &[u8]) -> Result<Value, SessionError> {
    Ok(codec::decode(std::str::from_utf8(raw)?)?)
}

/// Owns every persisted record of one session.
#[derive(Clone)]
pub struct SessionStateStore {
    store: Arc<dyn KeyValueStore>,
    namespace: KeyNamespace,
    session_id: SessionId,
    creds_factory: CredsFactory,
}

impl SessionStateStore {
    /// Create a state store for `session_id` in the default namespace.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, session_id: SessionId) -> Self {
        Self {
            store,
            namespace: KeyNamespace::default(),
            session_id,
            creds_factory: Arc::new(Value::object),
        }
    }

    /// Use a different key namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: KeyNamespace) -> Self {
        self.namespace = namespace;
        self
    }

    /// Produce fresh credentials with `factory` when none are stored.
    #[must_use]
    pub fn with_creds_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.creds_factory = Arc::new(factory);
        self
    }

    /// Session this store serves.
    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Load (or create) credentials and register the session heartbeat.
    ///
    /// # Errors
    /// Returns error if the store is unreachable or the stored blob is corrupt.
    pub async fn initialize(&self) -> Result<AuthState, SessionError> {
        let creds = match self.store.get(&self.namespace.creds(&self.session_id)).await? {
            Some(raw) => decode_record(&raw)?,
            None => {
                tracing::info!(session = %self.session_id, "No stored credentials, starting fresh");
                (self.creds_factory)()
            }
        };

        self.write_heartbeat(SessionStatus::Connecting, Map::new())
            .await?;

        Ok(AuthState {
            creds: Arc::new(RwLock::new(creds)),
            keys: KeyAccess {
                store: Arc::clone(&self.store),
                namespace: self.namespace.clone(),
                session_id: self.session_id.clone(),
            },
            session: self.clone(),
        })
    }

    /// Persist a credential structure.
    ///
    /// # Errors
    /// Returns error if the write fails; a lost credential save forces re-authentication.
    pub async fn save_creds(&self, creds: &Value) -> Result<(), SessionError> {
        let key = self.namespace.creds(&self.session_id);
        if let Err(e) = self
            .store
            .set(&key, codec::encode(creds).as_bytes(), None)
            .await
        {
            tracing::error!(session = %self.session_id, "Failed to save credentials: {e}");
            return Err(e.into());
        }
        tracing::info!(session = %self.session_id, "Credentials saved");
        Ok(())
    }

    /// Look up a previously cached message. Any failure reads as a miss.
    pub async fn get_message(&self, peer: &str, id: &str) -> Option<Value> {
        let key = self.namespace.message(&self.session_id, peer, id);
        match self.store.get(&key).await {
            Ok(Some(raw)) => match decode_record(&raw) {
                Ok(record) => record.get("message").cloned(),
                Err(e) => {
                    tracing::warn!(session = %self.session_id, peer, id, "Corrupt cached message: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::error!(session = %self.session_id, "Error getting message: {e}");
                None
            }
        }
    }

    /// Cache a message for later lookups. Failures are logged and dropped.
    pub async fn save_message(&self, peer: &str, id: &str, content: &Value) {
        let mut key_field = Value::object();
        key_field.insert("remoteJid", peer);
        key_field.insert("id", id);

        let mut record = Value::object();
        record.insert("key", key_field);
        record.insert("message", content.clone());
        record.insert("timestamp", Utc::now().to_rfc3339());

        let key = self.namespace.message(&self.session_id, peer, id);
        if let Err(e) = self
            .store
            .set(&key, codec::encode(&record).as_bytes(), Some(MESSAGE_TTL))
            .await
        {
            tracing::error!(session = %self.session_id, "Error saving message: {e}");
        }
    }

    /// Overwrite the heartbeat with a new status. Failures are logged and dropped.
    pub async fn update_status(&self, status: SessionStatus, metadata: Map<String, serde_json::Value>) {
        match self.write_heartbeat(status, metadata).await {
            Ok(()) => {
                tracing::info!(session = %self.session_id, %status, "Session status updated");
            }
            Err(e) => {
                tracing::error!(session = %self.session_id, "Error updating session status: {e}");
            }
        }
    }

    async fn write_heartbeat(
        &self,
        status: SessionStatus,
        metadata: Map<String, serde_json::Value>,
    ) -> Result<(), SessionError> {
        let record = SessionRecord::new(self.session_id.clone(), status, metadata);
        let payload = serde_json::to_vec(&record)?;
        self.store
            .set(
                &self.namespace.heartbeat(&self.session_id),
                &payload,
                Some(HEARTBEAT_TTL),
            )
            .await?;
        Ok(())
    }

    /// Delete credentials, every key group, every cached message and the heartbeat.
    ///
    /// Key types are discovered by scanning, never from a fixed list. Each round
    /// deletes everything found in one batched round trip (key material first,
    /// credentials and heartbeat last), then rescans; writes that raced the
    /// previous round are swept by the next one.
    ///
    /// Returns the number of records deleted.
    ///
    /// # Errors
    /// Returns error if any scan or delete fails; the caller must not assume
    /// the session is cleared.
    pub async fn clear_session(&self) -> Result<usize, SessionError> {
        let mut removed = 0;
        for _ in 0..CLEAR_PASSES {
            let keys = self.residual_keys().await?;
            if keys.is_empty() {
                tracing::info!(session = %self.session_id, removed, "Session cleared");
                return Ok(removed);
            }
            if let Err(e) = self.store.delete_batch(&keys).await {
                tracing::error!(session = %self.session_id, "Error clearing session: {e}");
                return Err(e.into());
            }
            removed += keys.len();
        }

        let leftover = self.residual_keys().await?;
        if leftover.is_empty() {
            tracing::info!(session = %self.session_id, removed, "Session cleared");
        } else {
            tracing::warn!(
                session = %self.session_id,
                remaining = leftover.len(),
                "Concurrent writes outlived the clear; they expire with their TTL"
            );
        }
        Ok(removed)
    }

    async fn residual_keys(&self) -> Result<Vec<String>, SessionError> {
        let mut keys = self
            .store
            .scan(&self.namespace.key_groups_pattern(&self.session_id))
            .await?;
        keys.extend(
            self.store
                .scan(&self.namespace.messages_pattern(&self.session_id))
                .await?,
        );
        for key in [
            self.namespace.creds(&self.session_id),
            self.namespace.heartbeat(&self.session_id),
        ] {
            if self.store.get(&key).await?.is_some() {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// Direct, uncached access to a session's key material.
#[derive(Clone)]
pub struct KeyAccess {
    store: Arc<dyn KeyValueStore>,
    namespace: KeyNamespace,
    session_id: SessionId,
}

impl KeyAccess {
    /// Read keys of one type. Every requested id is present in the result,
    /// `None` marking an absent key.
    ///
    /// # Errors
    /// Returns error if the store is unreachable or a record is corrupt.
    pub async fn get(
        &self,
        key_type: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Option<Value>>, SessionError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let group = self.namespace.key_group(&self.session_id, key_type);
        let raw = self.store.hash_get(&group, ids).await?;

        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            let value = match raw.get(id) {
                Some(Some(bytes)) => Some(decode_record(bytes)?).filter(|v| *v != Value::Null),
                _ => None,
            };
            out.insert(id.clone(), value);
        }
        Ok(out)
    }

    /// Write key updates. A `None` (or null) value removes that key.
    ///
    /// # Errors
    /// Returns error if any write fails.
    pub async fn set(&self, data: &KeyUpdates) -> Result<(), SessionError> {
        for (key_type, entries) in data {
            let group = self.namespace.key_group(&self.session_id, key_type);
            let mut writes = Vec::new();
            let mut removals = Vec::new();
            for (id, value) in entries {
                match value {
                    Some(value) if *value != Value::Null => {
                        writes.push((id.clone(), codec::encode(value).into_bytes()));
                    }
                    _ => removals.push(id.clone()),
                }
            }
            self.store.hash_set_many(&group, &writes).await?;
            self.store.hash_delete(&group, &removals).await?;
        }
        Ok(())
    }
}

/// Everything the protocol layer needs to run a session.
#[derive(Clone)]
pub struct AuthState {
    /// Live credential structure. Mutate, then call [`AuthState::save_creds`].
    pub creds: Arc<RwLock<Value>>,
    /// Key material access.
    pub keys: KeyAccess,
    session: SessionStateStore,
}

impl AuthState {
    /// Session this state belongs to.
    #[must_use]
    pub const fn session_id(&self) -> &SessionId {
        self.session.session_id()
    }

    /// The backing state store.
    #[must_use]
    pub const fn store(&self) -> &SessionStateStore {
        &self.session
    }

    /// Persist the current in-memory credentials.
    ///
    /// # Errors
    /// Returns error if the write fails.
    pub async fn save_creds(&self) -> Result<(), SessionError> {
        let creds = self.creds.read().await.clone();
        self.session.save_creds(&creds).await
    }

    /// See [`SessionStateStore::get_message`].
    pub async fn get_message(&self, peer: &str, id: &str) -> Option<Value> {
        self.session.get_message(peer, id).await
    }

    /// See [`SessionStateStore::save_message`].
    pub async fn save_message(&self, peer: &str, id: &str, content: &Value) {
        self.session.save_message(peer, id, content).await;
    }

    /// See [`SessionStateStore::update_status`].
    pub async fn update_status(&self, status: SessionStatus, metadata: Map<String, serde_json::Value>) {
        self.session.update_status(status, metadata).await;
    }

    /// See [`SessionStateStore::clear_session`].
    ///
    /// # Errors
    /// Returns error if the session could not be fully cleared.
    pub async fn clear_session(&self) -> Result<usize, SessionError> {
        self.session.clear_session().await
    }
}
