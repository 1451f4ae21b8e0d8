//! Bounded store of recent inbound messages with live updates.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Number of inbound messages retained for introspection.
pub const RECENT_LIMIT: usize = 20;

/// Summary of one inbound message as it was relayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundRecord {
    /// Normalized sender.
    pub phone: String,
    /// Sender display name, empty when unknown.
    pub name: String,
    /// Relayed text or placeholder.
    pub message: String,
    pub received_at: DateTime<Utc>,
}

/// Recent message store with broadcast support.
///
/// Keeps the newest [`RECENT_LIMIT`] records; late subscribers can read the
/// snapshot and then follow live updates.
pub struct MsgStore {
    history: RwLock<VecDeque<InboundRecord>>,
    limit: usize,
    sender: broadcast::Sender<InboundRecord>,
}

impl Default for MsgStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MsgStore {
    /// Create a store holding [`RECENT_LIMIT`] records.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(RECENT_LIMIT)
    }

    /// Create a store holding at most `limit` records.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            history: RwLock::new(VecDeque::with_capacity(limit)),
            limit,
            sender,
        }
    }

    /// Record a message, evicting the oldest beyond the limit.
    pub fn push(&self, record: InboundRecord) {
        let _ = self.sender.send(record.clone()); // live listeners

        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        history.push_front(record);
        history.truncate(self.limit);
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn get_receiver(&self) -> broadcast::Receiver<InboundRecord> {
        self.sender.subscribe()
    }

    /// Snapshot of the retained records, newest first.
    #[must_use]
    pub fn get_history(&self) -> Vec<InboundRecord> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.history.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stream that yields the snapshot (oldest first), then live updates.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, InboundRecord> {
        let rx = self.get_receiver();
        let mut history = self.get_history();
        history.reverse();

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}
