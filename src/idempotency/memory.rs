//! In-process idempotency store.

use super::{IdempotencyRecord, IdempotencyStore, RecordStatus, Reservation};
use crate::error::AnvilResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

/// Idempotency records in a mutex-guarded map. Lapsed records are replaced
/// on the next reservation and swept by [`IdempotencyStore::purge_expired`].
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl InMemoryIdempotencyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the live record for `key`.
    pub async fn record(&self, key: &str) -> Option<IdempotencyRecord> {
        let records = self.records.lock().await;
        records
            .get(key)
            .filter(|r| r.is_live(SystemTime::now()))
            .cloned()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn reserve(&self, key: &str, owner: &str, ttl: Duration) -> AnvilResult<Reservation> {
        let now = SystemTime::now();
        let mut records = self.records.lock().await;

        if let Some(existing) = records.get_mut(key).filter(|r| r.is_live(now)) {
            if existing.status == RecordStatus::InProgress && existing.owner == owner {
                existing.expires_at = now + ttl;
                return Ok(Reservation::Proceed);
            }
            return Ok(Reservation::Duplicate {
                cached_result: existing.cached_result.clone(),
            });
        }

        records.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                status: RecordStatus::InProgress,
                owner: owner.to_string(),
                cached_result: None,
                expires_at: now + ttl,
            },
        );
        Ok(Reservation::Proceed)
    }

    async fn release(&self, key: &str, result: Option<&[u8]>, ttl: Duration) -> AnvilResult<()> {
        let mut records = self.records.lock().await;
        let owner = records.get(key).map(|r| r.owner.clone()).unwrap_or_default();
        records.insert(
            key.to_string(),
            IdempotencyRecord {
                key: key.to_string(),
                status: RecordStatus::Completed,
                owner,
                cached_result: result.map(<[u8]>::to_vec),
                expires_at: SystemTime::now() + ttl,
            },
        );
        Ok(())
    }

    async fn abandon(&self, key: &str, owner: &str) -> AnvilResult<()> {
        let mut records = self.records.lock().await;
        if records
            .get(key)
            .is_some_and(|r| r.status == RecordStatus::InProgress && r.owner == owner)
        {
            records.remove(key);
        }
        Ok(())
    }

    async fn purge_expired(&self) -> AnvilResult<u64> {
        let now = SystemTime::now();
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| r.is_live(now));
        Ok((before - records.len()) as u64)
    }
}
