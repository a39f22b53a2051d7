//! Idempotency guard: at most one execution per key within a TTL window.
//!
//! A worker reserves a key before invoking a handler. The first reservation
//! wins; later ones see the record and skip the handler, receiving the cached
//! result once the winner has released the key. A failed attempt abandons
//! its reservation so the retry can reserve again.
//!
//! Every reservation names an owner, the id of the task holding it. An
//! `InProgress` record can only be abandoned by its owner, and the owner may
//! reserve it again: a retry whose earlier attempt could not abandon the key
//! reclaims it and runs, instead of being taken for a finished duplicate.

use crate::error::{AnvilError, AnvilResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub mod memory;
pub use memory::InMemoryIdempotencyStore;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub mod redis;

#[cfg(feature = "redis-queue")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-queue")))]
pub use redis::RedisIdempotencyStore;

/// What to do when the idempotency store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdempotencyMode {
    /// Proceed without the guard; duplicates become possible
    #[default]
    FailOpen,
    /// Refuse to run the handler; the attempt is a transient failure
    FailClosed,
}

/// Status of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// A worker holds the reservation
    InProgress,
    /// The handler succeeded
    Completed,
}

/// One record per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    /// Idempotency key
    pub key: String,
    /// Current status
    pub status: RecordStatus,
    /// Task that took the reservation
    pub owner: String,
    /// Result cached by [`IdempotencyStore::release`]
    pub cached_result: Option<Vec<u8>>,
    /// Record lapses after this instant
    pub expires_at: SystemTime,
}

impl IdempotencyRecord {
    /// Whether the record is still live at `now`.
    pub fn is_live(&self, now: SystemTime) -> bool {
        self.expires_at > now
    }
}

/// Outcome of a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// Caller owns the key and must run the handler. Also returned to the
    /// owner of an unfinished reservation, which it takes over.
    Proceed,
    /// Key was already reserved or completed within the TTL
    Duplicate {
        /// Result stored on release, if any
        cached_result: Option<Vec<u8>>,
    },
}

impl Reservation {
    /// `true` when the handler must be skipped.
    pub fn already_handled(&self) -> bool {
        matches!(self, Reservation::Duplicate { .. })
    }
}

/// Atomic key/TTL store backing the guard.
///
/// Implementations report any failure to reach the store as
/// [`AnvilError::IdempotencyStoreUnavailable`].
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Create an `InProgress` record owned by `owner` unless a live record
    /// exists. A live `InProgress` record of the same owner is renewed and
    /// reported as [`Reservation::Proceed`].
    async fn reserve(&self, key: &str, owner: &str, ttl: Duration) -> AnvilResult<Reservation>;

    /// Mark the record `Completed`, optionally caching `result`.
    async fn release(&self, key: &str, result: Option<&[u8]>, ttl: Duration) -> AnvilResult<()>;

    /// Drop the `InProgress` record held by `owner`. Completed records and
    /// other owners' reservations are left alone.
    async fn abandon(&self, key: &str, owner: &str) -> AnvilResult<()>;

    /// Remove lapsed records, for stores without native expiry.
    async fn purge_expired(&self) -> AnvilResult<u64> {
        Ok(0)
    }
}

/// Mode-aware wrapper around an [`IdempotencyStore`].
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
}

impl std::fmt::Debug for IdempotencyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotencyGuard").finish_non_exhaustive()
    }
}

impl IdempotencyGuard {
    /// Wrap a store.
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self { store }
    }

    /// Guard backed by an [`InMemoryIdempotencyStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryIdempotencyStore::new()))
    }

    /// Reserve `key`, applying `mode` when the store is unreachable.
    ///
    /// Fail-open degrades to `Proceed`; fail-closed returns
    /// [`AnvilError::IdempotencyStoreUnavailable`].
    pub async fn reserve(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
        mode: IdempotencyMode,
    ) -> AnvilResult<Reservation> {
        match self.store.reserve(key, owner, ttl).await {
            Ok(reservation) => Ok(reservation),
            Err(err) => match mode {
                IdempotencyMode::FailOpen => {
                    tracing::warn!(key, error = %err, "Idempotency store unavailable, proceeding unguarded");
                    Ok(Reservation::Proceed)
                }
                IdempotencyMode::FailClosed => match err {
                    AnvilError::IdempotencyStoreUnavailable { .. } => Err(err),
                    other => Err(AnvilError::IdempotencyStoreUnavailable {
                        message: other.to_string(),
                        source: Some(Box::new(other)),
                    }),
                },
            },
        }
    }

    /// Release after success. Failures are logged, never surfaced: the
    /// handler already ran.
    pub async fn release(&self, key: &str, result: Option<&[u8]>, ttl: Duration) {
        if let Err(err) = self.store.release(key, result, ttl).await {
            tracing::warn!(key, error = %err, "Failed to release idempotency key");
        }
    }

    /// Abandon after a failed attempt so the retry can reserve again.
    ///
    /// Errors are returned so the caller can retry; a reservation that could
    /// not be abandoned is reclaimed by the owner's next attempt.
    pub async fn abandon(&self, key: &str, owner: &str) -> AnvilResult<()> {
        self.store.abandon(key, owner).await
    }

    /// Remove lapsed records.
    pub async fn purge_expired(&self) -> AnvilResult<u64> {
        self.store.purge_expired().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Store that is always unreachable.
    pub(crate) struct DownStore;

    #[async_trait]
    impl IdempotencyStore for DownStore {
        async fn reserve(&self, _key: &str, _owner: &str, _ttl: Duration) -> AnvilResult<Reservation> {
            Err(AnvilError::idempotency_unavailable("connection refused"))
        }

        async fn release(&self, _key: &str, _result: Option<&[u8]>, _ttl: Duration) -> AnvilResult<()> {
            Err(AnvilError::idempotency_unavailable("connection refused"))
        }

        async fn abandon(&self, _key: &str, _owner: &str) -> AnvilResult<()> {
            Err(AnvilError::idempotency_unavailable("connection refused"))
        }
    }

    #[tokio::test]
    async fn test_fail_open_proceeds() {
        let guard = IdempotencyGuard::new(Arc::new(DownStore));
        let reservation = guard
            .reserve("order-1", "task-1", Duration::from_secs(60), IdempotencyMode::FailOpen)
            .await
            .unwrap();
        assert_eq!(reservation, Reservation::Proceed);

        // Release failures are swallowed
        guard.release("order-1", None, Duration::from_secs(60)).await;
    }

    #[tokio::test]
    async fn test_fail_closed_refuses() {
        let guard = IdempotencyGuard::new(Arc::new(DownStore));
        let err = guard
            .reserve("order-1", "task-1", Duration::from_secs(60), IdempotencyMode::FailClosed)
            .await
            .unwrap_err();
        assert!(matches!(err, AnvilError::IdempotencyStoreUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_already_handled() {
        let guard = IdempotencyGuard::in_memory();
        let ttl = Duration::from_secs(60);
        let first = guard.reserve("k", "task-1", ttl, IdempotencyMode::FailClosed).await.unwrap();
        assert!(!first.already_handled());
        let second = guard.reserve("k", "task-2", ttl, IdempotencyMode::FailClosed).await.unwrap();
        assert!(second.already_handled());
    }

    #[tokio::test]
    async fn test_abandon_errors_surface() {
        let guard = IdempotencyGuard::new(Arc::new(DownStore));
        let err = guard.abandon("order-1", "task-1").await.unwrap_err();
        assert!(matches!(err, AnvilError::IdempotencyStoreUnavailable { .. }));
    }
}
