//! Saga state persistence
//!
//! The store trait covers instance persistence with optimistic
//! concurrency, correlation lookup, monitoring queries, and the timeout
//! subtable. The in-memory implementation is the reference semantics;
//! durable implementations must preserve the same invariants:
//!
//! - `version` is assigned atomically with the write
//! - cancelling an already-delivered timeout is a no-op success
//! - `mark_delivered` is idempotent

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use excalibur_types::{DispatchError, Result, SagaId, TimeoutId};

use crate::state::{SagaState, SagaStatus, SagaTimeout};

/// Persistence contract for saga instances and their timeouts
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Persist a saga state with optimistic concurrency on `version`
    ///
    /// The caller passes the state at the version it loaded; the store
    /// increments the version atomically with the write. A stale version
    /// fails with `concurrency-conflict`, which callers may retry.
    async fn save(&self, state: SagaState) -> Result<SagaState>;

    /// Load an instance by id
    async fn get_by_id(&self, saga_id: &SagaId) -> Result<Option<SagaState>>;

    /// Load an instance by (saga type, correlation key)
    async fn get_by_correlation(
        &self,
        saga_type: &str,
        correlation_key: &str,
    ) -> Result<Option<SagaState>>;

    /// Delete an instance; true when it existed
    async fn delete(&self, saga_id: &SagaId) -> Result<bool>;

    // ------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------

    /// Instance counts by status
    async fn counts_by_status(&self) -> Result<HashMap<SagaStatus, u64>>;

    /// Running instances whose last update is older than the threshold
    async fn stuck_sagas(&self, older_than: DateTime<Utc>) -> Result<Vec<SagaState>>;

    /// Average wall-clock completion time over instances completed in the
    /// window, when any
    async fn average_completion_time(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Option<Duration>>;

    // ------------------------------------------------------------------
    // Timeout subtable
    // ------------------------------------------------------------------

    /// Schedule a timeout
    async fn schedule_timeout(&self, timeout: SagaTimeout) -> Result<()>;

    /// Cancel one timeout; deleting it. A no-op success when the timeout
    /// was already delivered or never existed
    async fn cancel_timeout(&self, saga_id: &SagaId, timeout_id: &TimeoutId) -> Result<()>;

    /// Cancel every undelivered timeout for a saga
    async fn cancel_all_timeouts(&self, saga_id: &SagaId) -> Result<()>;

    /// Mark a timeout delivered; idempotent, the first delivery time wins
    async fn mark_delivered(&self, timeout_id: &TimeoutId, at: DateTime<Utc>) -> Result<()>;

    /// Undelivered, non-dead-lettered timeouts due at or before `now`,
    /// ordered by non-decreasing `due_at`, limited to `limit`
    async fn poll_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SagaTimeout>>;

    /// Record a failed delivery attempt and push the due time out
    ///
    /// Returns the updated attempt count.
    async fn record_delivery_error(
        &self,
        timeout_id: &TimeoutId,
        reason: &str,
        next_due_at: DateTime<Utc>,
    ) -> Result<u32>;

    /// Move a timeout to the dead-letter state
    async fn dead_letter(&self, timeout_id: &TimeoutId) -> Result<()>;
}

/// In-memory saga store
///
/// Thread-safe and designed for concurrent access; the reference
/// implementation for tests and single-process hosts.
#[derive(Default)]
pub struct InMemorySagaStore {
    sagas: Arc<RwLock<HashMap<SagaId, SagaState>>>,
    timeouts: Arc<RwLock<HashMap<TimeoutId, SagaTimeout>>>,
}

impl InMemorySagaStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn save(&self, mut state: SagaState) -> Result<SagaState> {
        let mut sagas = self.sagas.write().await;
        match sagas.get(&state.saga_id) {
            Some(existing) => {
                if existing.version != state.version {
                    return Err(DispatchError::ConcurrencyConflict {
                        saga_id: state.saga_id.to_string(),
                        expected_version: state.version,
                        actual_version: existing.version,
                    });
                }
                state.version += 1;
            }
            None => {
                // First write; version moves off zero with the insert.
                state.version += 1;
            }
        }
        state.last_updated_at = Utc::now();
        sagas.insert(state.saga_id.clone(), state.clone());
        Ok(state)
    }

    async fn get_by_id(&self, saga_id: &SagaId) -> Result<Option<SagaState>> {
        Ok(self.sagas.read().await.get(saga_id).cloned())
    }

    async fn get_by_correlation(
        &self,
        saga_type: &str,
        correlation_key: &str,
    ) -> Result<Option<SagaState>> {
        Ok(self
            .sagas
            .read()
            .await
            .values()
            .find(|s| {
                s.saga_type == saga_type
                    && s.correlation_key.as_deref() == Some(correlation_key)
            })
            .cloned())
    }

    async fn delete(&self, saga_id: &SagaId) -> Result<bool> {
        Ok(self.sagas.write().await.remove(saga_id).is_some())
    }

    async fn counts_by_status(&self) -> Result<HashMap<SagaStatus, u64>> {
        let sagas = self.sagas.read().await;
        let mut counts = HashMap::new();
        for state in sagas.values() {
            *counts.entry(state.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn stuck_sagas(&self, older_than: DateTime<Utc>) -> Result<Vec<SagaState>> {
        let sagas = self.sagas.read().await;
        let mut stuck: Vec<SagaState> = sagas
            .values()
            .filter(|s| s.status == SagaStatus::Running && s.last_updated_at < older_than)
            .cloned()
            .collect();
        stuck.sort_by_key(|s| s.last_updated_at);
        Ok(stuck)
    }

    async fn average_completion_time(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Option<Duration>> {
        let sagas = self.sagas.read().await;
        let durations: Vec<Duration> = sagas
            .values()
            .filter(|s| {
                s.status == SagaStatus::Completed
                    && s.last_updated_at >= window_start
                    && s.last_updated_at <= window_end
            })
            .map(|s| s.last_updated_at - s.created_at)
            .collect();
        if durations.is_empty() {
            return Ok(None);
        }
        let total: Duration = durations.iter().fold(Duration::zero(), |acc, d| acc + *d);
        Ok(Some(total / durations.len() as i32))
    }

    async fn schedule_timeout(&self, timeout: SagaTimeout) -> Result<()> {
        self.timeouts
            .write()
            .await
            .insert(timeout.timeout_id.clone(), timeout);
        Ok(())
    }

    async fn cancel_timeout(&self, saga_id: &SagaId, timeout_id: &TimeoutId) -> Result<()> {
        let mut timeouts = self.timeouts.write().await;
        if let Some(timeout) = timeouts.get(timeout_id) {
            if timeout.saga_id != *saga_id || timeout.delivered_at.is_some() {
                // Delivered timeouts stay; cancellation is a no-op success.
                return Ok(());
            }
            timeouts.remove(timeout_id);
        }
        Ok(())
    }

    async fn cancel_all_timeouts(&self, saga_id: &SagaId) -> Result<()> {
        let mut timeouts = self.timeouts.write().await;
        timeouts.retain(|_, t| t.saga_id != *saga_id || t.delivered_at.is_some());
        Ok(())
    }

    async fn mark_delivered(&self, timeout_id: &TimeoutId, at: DateTime<Utc>) -> Result<()> {
        let mut timeouts = self.timeouts.write().await;
        if let Some(timeout) = timeouts.get_mut(timeout_id) {
            if timeout.delivered_at.is_none() {
                timeout.delivered_at = Some(at);
            }
        }
        Ok(())
    }

    async fn poll_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SagaTimeout>> {
        let timeouts = self.timeouts.read().await;
        let mut due: Vec<SagaTimeout> = timeouts
            .values()
            .filter(|t| t.delivered_at.is_none() && !t.dead_lettered && t.due_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|t| t.due_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn record_delivery_error(
        &self,
        timeout_id: &TimeoutId,
        reason: &str,
        next_due_at: DateTime<Utc>,
    ) -> Result<u32> {
        let mut timeouts = self.timeouts.write().await;
        let timeout = timeouts.get_mut(timeout_id).ok_or_else(|| {
            DispatchError::argument("timeout_id", format!("unknown timeout {}", timeout_id))
        })?;
        timeout.attempts += 1;
        timeout.last_error = Some(reason.to_string());
        timeout.due_at = next_due_at;
        Ok(timeout.attempts)
    }

    async fn dead_letter(&self, timeout_id: &TimeoutId) -> Result<()> {
        let mut timeouts = self.timeouts.write().await;
        if let Some(timeout) = timeouts.get_mut(timeout_id) {
            timeout.dead_lettered = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_increments_version_and_detects_conflicts() {
        let store = InMemorySagaStore::new();
        let state = SagaState::new("order", Some("o-1".to_string()), Utc::now());

        let saved = store.save(state.clone()).await.unwrap();
        assert_eq!(saved.version, 1);

        let saved_again = store.save(saved.clone()).await.unwrap();
        assert_eq!(saved_again.version, 2);

        // Writing from the stale copy conflicts.
        let err = store.save(saved).await.unwrap_err();
        assert_eq!(err.error_code(), "CONCURRENCY_CONFLICT");
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_correlation_lookup() {
        let store = InMemorySagaStore::new();
        let state = SagaState::new("order", Some("o-42".to_string()), Utc::now());
        store.save(state).await.unwrap();

        let found = store.get_by_correlation("order", "o-42").await.unwrap();
        assert!(found.is_some());
        assert!(store
            .get_by_correlation("order", "o-43")
            .await
            .unwrap()
            .is_none());
        assert!(store
            .get_by_correlation("shipment", "o-42")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_mark_delivered_is_idempotent() {
        let store = InMemorySagaStore::new();
        let timeout = SagaTimeout::new(SagaId::new(), Utc::now(), "Tick", "{}");
        let id = timeout.timeout_id.clone();
        store.schedule_timeout(timeout).await.unwrap();

        let first = Utc::now();
        store.mark_delivered(&id, first).await.unwrap();
        store
            .mark_delivered(&id, first + Duration::seconds(10))
            .await
            .unwrap();

        let due = store
            .poll_due(Utc::now() + Duration::seconds(60), 10)
            .await
            .unwrap();
        assert!(due.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_delivered_timeout_is_noop_success() {
        let store = InMemorySagaStore::new();
        let saga_id = SagaId::new();
        let timeout = SagaTimeout::new(saga_id.clone(), Utc::now(), "Tick", "{}");
        let id = timeout.timeout_id.clone();
        store.schedule_timeout(timeout).await.unwrap();
        store.mark_delivered(&id, Utc::now()).await.unwrap();

        store.cancel_timeout(&saga_id, &id).await.unwrap();
        // Unknown timeouts cancel cleanly too.
        store.cancel_timeout(&saga_id, &TimeoutId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_due_orders_by_due_at() {
        let store = InMemorySagaStore::new();
        let saga_id = SagaId::new();
        let base = Utc::now();
        for offset in [30i64, 10, 20] {
            store
                .schedule_timeout(SagaTimeout::new(
                    saga_id.clone(),
                    base + Duration::seconds(offset),
                    "Tick",
                    "{}",
                ))
                .await
                .unwrap();
        }

        let due = store
            .poll_due(base + Duration::seconds(60), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 3);
        assert!(due.windows(2).all(|w| w[0].due_at <= w[1].due_at));

        let limited = store
            .poll_due(base + Duration::seconds(60), 2)
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn test_stuck_saga_enumeration() {
        let store = InMemorySagaStore::new();
        let mut running = SagaState::new("order", None, Utc::now());
        running.status = SagaStatus::Running;
        store.save(running).await.unwrap();

        // Saved just now, so an old threshold finds nothing.
        let stuck = store
            .stuck_sagas(Utc::now() - Duration::minutes(5))
            .await
            .unwrap();
        assert!(stuck.is_empty());

        let stuck = store
            .stuck_sagas(Utc::now() + Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
    }
}
