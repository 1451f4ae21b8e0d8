//! Publish/subscribe backends.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use chatbridge_core::{BusError, MessageBus};
use futures::{StreamExt, stream::BoxStream};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

const CHANNEL_CAPACITY: usize = 1024;

/// In-process bus; each channel is a broadcast channel created on first use.
///
/// Payloads published while nobody is subscribed are dropped, as with Redis.
#[derive(Default)]
pub struct MemoryBus {
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        if let Some(tx) = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
        {
            return tx.clone();
        }
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Number of live subscribers on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        // Err only means there are no subscribers right now.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BusError> {
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |res| {
            let channel = channel.clone();
            async move {
                match res {
                    Ok(payload) => Some(payload),
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        tracing::warn!(channel = %channel, skipped = n, "Bus subscriber lagged");
                        None
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(feature = "redis")]
pub use self::redis_bus::RedisBus;

#[cfg(feature = "redis")]
mod redis_bus {
    use async_trait::async_trait;
    use chatbridge_core::{BusError, MessageBus};
    use futures::{StreamExt, stream::BoxStream};
    use redis::aio::MultiplexedConnection;

    fn unavailable(e: &redis::RedisError) -> BusError {
        BusError::Unavailable(e.to_string())
    }

    /// Redis pub/sub bus.
    ///
    /// Publishing shares one multiplexed connection; every subscription opens
    /// its own dedicated connection, as Redis requires.
    #[derive(Clone)]
    pub struct RedisBus {
        client: redis::Client,
        conn: MultiplexedConnection,
    }

    impl RedisBus {
        /// Connect to the server at `url`.
        ///
        /// # Errors
        /// Returns error if the URL is invalid or the server cannot be reached.
        pub async fn connect(url: &str) -> Result<Self, BusError> {
            let client = redis::Client::open(url).map_err(|e| unavailable(&e))?;
            let conn = client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| unavailable(&e))?;
            tracing::info!("Connected to Redis bus");
            Ok(Self { client, conn })
        }
    }

    #[async_trait]
    impl MessageBus for RedisBus {
        async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
            let mut conn = self.conn.clone();
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async::<_, i64>(&mut conn)
                .await
                .map_err(|e| unavailable(&e))?;
            Ok(())
        }

        async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, BusError> {
            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| unavailable(&e))?;
            pubsub
                .subscribe(channel)
                .await
                .map_err(|e| unavailable(&e))?;
            tracing::info!(channel = %channel, "Subscribed to bus channel");

            let stream = pubsub.into_on_message().filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!("Dropping non-text bus payload: {e}");
                        None
                    }
                }
            });
            Ok(Box::pin(stream))
        }
    }
}
