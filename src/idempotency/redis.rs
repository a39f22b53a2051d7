//! Redis-backed idempotency store.
//!
//! Each key is a hash `{prefix}:idem:{key}` with `status`, `owner` and an
//! optional `result` field; the TTL is the hash's own expiry.

use super::{IdempotencyStore, Reservation};
use crate::error::{AnvilError, AnvilResult};
use crate::queue::redis::connect;
use async_trait::async_trait;
use redis::{RedisError, Script, aio::ConnectionManager};
use std::time::Duration;

fn unavailable(context: &str, err: RedisError) -> AnvilError {
    AnvilError::IdempotencyStoreUnavailable {
        message: format!("{}: {}", context, err),
        source: Some(Box::new(err)),
    }
}

/// Idempotency records in Redis
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
    prefix: String,
    reserve_script: Script,
    abandon_script: Script,
}

impl std::fmt::Debug for RedisIdempotencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisIdempotencyStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisIdempotencyStore {
    /// Connect a dedicated connection manager.
    pub async fn new(connection_string: &str, key_prefix: &str) -> AnvilResult<Self> {
        let conn = connect(connection_string).await.map_err(|e| {
            AnvilError::IdempotencyStoreUnavailable {
                message: e.to_string(),
                source: Some(Box::new(e)),
            }
        })?;
        Ok(Self::from_connection(conn, key_prefix))
    }

    /// Share an existing connection, e.g. [`RedisQueue::connection`](crate::queue::RedisQueue::connection).
    pub fn from_connection(conn: ConnectionManager, key_prefix: &str) -> Self {
        Self {
            conn,
            prefix: key_prefix.to_string(),
            reserve_script: Script::new(include_str!("scripts/reserve.lua")),
            abandon_script: Script::new(include_str!("scripts/abandon.lua")),
        }
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}:idem:{}", self.prefix, key)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn reserve(&self, key: &str, owner: &str, ttl: Duration) -> AnvilResult<Reservation> {
        let mut conn = self.conn.clone();
        let reply: Vec<Vec<u8>> = self
            .reserve_script
            .key(self.record_key(key))
            .arg(ttl.as_millis() as u64)
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| unavailable("Failed to reserve idempotency key", e))?;

        let mut parts = reply.into_iter();
        match parts.next().as_deref() {
            Some(b"proceed") => Ok(Reservation::Proceed),
            Some(b"duplicate") => Ok(Reservation::Duplicate {
                cached_result: parts.next(),
            }),
            _ => Err(AnvilError::idempotency_unavailable(
                "Unexpected reply from reserve script",
            )),
        }
    }

    async fn release(&self, key: &str, result: Option<&[u8]>, ttl: Duration) -> AnvilResult<()> {
        let mut conn = self.conn.clone();
        let record = self.record_key(key);

        let mut pipe = redis::pipe();
        pipe.atomic().hset(&record, "status", "completed").hdel(&record, "result");
        if let Some(result) = result {
            pipe.hset(&record, "result", result);
        }
        pipe.pexpire(&record, ttl.as_millis() as i64);

        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| unavailable("Failed to release idempotency key", e))
    }

    async fn abandon(&self, key: &str, owner: &str) -> AnvilResult<()> {
        let mut conn = self.conn.clone();
        let _deleted: i64 = self
            .abandon_script
            .key(self.record_key(key))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| unavailable("Failed to abandon idempotency key", e))?;
        Ok(())
    }
}
