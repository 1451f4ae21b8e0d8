//! Redis key-value store (feature-gated).

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chatbridge_core::{KeyValueStore, ScanPage, StoreError};
use redis::{AsyncCommands as _, aio::MultiplexedConnection};

/// Redis store implementation.
///
/// Uses one multiplexed connection; clones share the underlying socket, so no
/// lock is held across commands.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

fn unavailable(e: &redis::RedisError) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

impl RedisStore {
    /// Connect to the server at `url` (`redis://[:password@]host:port/`).
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the server cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|e| unavailable(&e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| unavailable(&e))?;
        tracing::info!("Connected to Redis store");
        Ok(Self { conn })
    }

    /// Wrap an existing connection.
    #[must_use]
    pub const fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    /// Round-trip a `PING`.
    ///
    /// # Errors
    /// Returns error if the server does not answer.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| unavailable(&e))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| unavailable(&e))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(ttl.as_secs().max(1));
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| unavailable(&e))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| unavailable(&e))
    }

    async fn hash_get(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<HashMap<String, Option<Vec<u8>>>, StoreError> {
        if fields.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable(&e))?;
        Ok(fields.iter().cloned().zip(values).collect())
    }

    async fn hash_set_many(
        &self,
        key: &str,
        entries: &[(String, Vec<u8>)],
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in entries {
            cmd.arg(field).arg(value);
        }
        cmd.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| unavailable(&e))
    }

    async fn hash_delete(&self, key: &str, fields: &[String]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        redis::cmd("HDEL")
            .arg(key)
            .arg(fields)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| unavailable(&e))
    }

    async fn scan_page(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<ScanPage, StoreError> {
        let mut conn = self.conn.clone();
        let (cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| unavailable(&e))?;
        Ok(ScanPage { cursor, keys })
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys {
            pipe.del(key).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| unavailable(&e))
    }
}
