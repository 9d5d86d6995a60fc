//! The append-only audit journal
//!
//! Appends are serialized per tenant so the hash chain has a total order
//! within each tenant; writes for different tenants proceed concurrently.
//! The journal owns identity, time, sequence, and hash assignment: the
//! producer's values for those fields are overwritten from the trusted
//! clock and the chain tail.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use excalibur_types::{
    AuditEventId, Clock, Result, SharedClock, SystemClock, TenantId,
};

use crate::event::AuditEvent;
use crate::query::AuditQuery;

/// Cap on violations counted by a single verification walk
pub const DEFAULT_VIOLATION_CAP: usize = 1_000;

/// Result of an integrity verification walk
#[derive(Debug, Clone)]
pub struct AuditIntegrityResult {
    /// True when every hash in the range checked out
    pub is_valid: bool,
    /// Events inspected
    pub events_verified: u64,
    /// Range start
    pub start_date: DateTime<Utc>,
    /// Range end
    pub end_date: DateTime<Utc>,
    /// When the walk ran
    pub verified_at: DateTime<Utc>,
    /// First event whose hash did not verify
    pub first_violation_event_id: Option<AuditEventId>,
    /// Diagnostic for the first violation
    pub violation_description: Option<String>,
    /// Violations found, at least 1 when invalid, capped
    pub violation_count: u64,
}

/// The audit journal contract
///
/// Writes are unrestricted at this layer; read-side access control lives
/// in the RBAC wrapper.
#[async_trait]
pub trait AuditJournal: Send + Sync {
    /// Append an event to its tenant's chain; returns the assigned id
    async fn append(&self, event: AuditEvent) -> Result<AuditEventId>;

    /// Fetch one event by id
    async fn get_by_id(&self, event_id: &AuditEventId) -> Result<Option<AuditEvent>>;

    /// Query events
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>>;

    /// Count events matching a query (pagination ignored)
    async fn count(&self, query: &AuditQuery) -> Result<u64>;

    /// The most recent event, optionally per tenant
    async fn get_last(&self, tenant_id: Option<&TenantId>) -> Result<Option<AuditEvent>>;

    /// Verify the hash chain over a date range
    async fn verify_chain(
        &self,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Result<AuditIntegrityResult>;
}

/// One tenant's chain: ordered events plus the running sequence
#[derive(Default)]
struct TenantChain {
    events: Vec<AuditEvent>,
    sequence: u64,
}

/// In-memory audit journal
///
/// The reference implementation: a per-tenant vector guarded by a
/// per-tenant mutex (single-writer discipline), and a map of chains
/// guarded by a read-write lock.
pub struct InMemoryAuditJournal {
    chains: RwLock<HashMap<String, Arc<Mutex<TenantChain>>>>,
    clock: SharedClock,
    violation_cap: usize,
}

impl InMemoryAuditJournal {
    /// Create a journal on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a journal with an explicit clock
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            chains: RwLock::new(HashMap::new()),
            clock,
            violation_cap: DEFAULT_VIOLATION_CAP,
        }
    }

    fn chain_key(tenant_id: Option<&TenantId>) -> String {
        tenant_id
            .map(|t| t.to_string())
            .unwrap_or_else(|| "<global>".to_string())
    }

    async fn chain_for(&self, key: &str) -> Arc<Mutex<TenantChain>> {
        {
            let chains = self.chains.read().await;
            if let Some(chain) = chains.get(key) {
                return Arc::clone(chain);
            }
        }
        let mut chains = self.chains.write().await;
        Arc::clone(chains.entry(key.to_string()).or_default())
    }

    /// Snapshot every chain's events (for queries and verification)
    async fn snapshot(&self) -> Vec<AuditEvent> {
        let chains: Vec<Arc<Mutex<TenantChain>>> = {
            let chains = self.chains.read().await;
            chains.values().map(Arc::clone).collect()
        };
        let mut events = Vec::new();
        for chain in chains {
            let chain = chain.lock().await;
            events.extend(chain.events.iter().cloned());
        }
        events
    }

    /// Flip metadata on a stored event in place, bypassing the hash chain
    ///
    /// Exists so integrity tests can simulate at-rest tampering; nothing
    /// in the runtime calls this.
    #[doc(hidden)]
    pub async fn tamper_metadata(
        &self,
        event_id: &AuditEventId,
        key: &str,
        value: &str,
    ) -> bool {
        let chains: Vec<Arc<Mutex<TenantChain>>> = {
            let chains = self.chains.read().await;
            chains.values().map(Arc::clone).collect()
        };
        for chain in chains {
            let mut chain = chain.lock().await;
            if let Some(event) = chain.events.iter_mut().find(|e| e.event_id == *event_id) {
                event.metadata.insert(key.to_string(), value.to_string());
                return true;
            }
        }
        false
    }
}

impl Default for InMemoryAuditJournal {
    fn default() -> Self {
        Self::new()
    }
}

/// Constant-time hash equality; integrity audits must not leak timing
fn hashes_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[async_trait]
impl AuditJournal for InMemoryAuditJournal {
    async fn append(&self, mut event: AuditEvent) -> Result<AuditEventId> {
        let key = Self::chain_key(event.tenant_id.as_ref());
        let chain = self.chain_for(&key).await;
        let mut chain = chain.lock().await;

        event.event_id = AuditEventId::new();
        event.timestamp_utc = self.clock.now_utc();
        chain.sequence += 1;
        event.sequence_number = chain.sequence;

        let previous_hash = chain
            .events
            .last()
            .and_then(|last| last.event_hash.clone());
        event.previous_event_hash = previous_hash.clone();
        event.event_hash = Some(event.compute_hash(previous_hash.as_deref()));

        let event_id = event.event_id;
        debug!(
            %event_id,
            tenant = %key,
            sequence = event.sequence_number,
            "audit event appended"
        );
        chain.events.push(event);
        Ok(event_id)
    }

    async fn get_by_id(&self, event_id: &AuditEventId) -> Result<Option<AuditEvent>> {
        Ok(self
            .snapshot()
            .await
            .into_iter()
            .find(|e| e.event_id == *event_id))
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let mut matched: Vec<AuditEvent> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|e| query.matches(e))
            .collect();
        // Ties on timestamp break by event id so paging is deterministic.
        if query.sort_descending {
            matched.sort_by(|a, b| {
                b.timestamp_utc
                    .cmp(&a.timestamp_utc)
                    .then(b.event_id.cmp(&a.event_id))
            });
        } else {
            matched.sort_by(|a, b| {
                a.timestamp_utc
                    .cmp(&b.timestamp_utc)
                    .then(a.event_id.cmp(&b.event_id))
            });
        }
        Ok(matched
            .into_iter()
            .skip(query.skip)
            .take(query.max_results)
            .collect())
    }

    async fn count(&self, query: &AuditQuery) -> Result<u64> {
        Ok(self
            .snapshot()
            .await
            .iter()
            .filter(|e| query.matches(e))
            .count() as u64)
    }

    async fn get_last(&self, tenant_id: Option<&TenantId>) -> Result<Option<AuditEvent>> {
        match tenant_id {
            Some(tenant) => {
                let chain = self.chain_for(&Self::chain_key(Some(tenant))).await;
                let chain = chain.lock().await;
                Ok(chain.events.last().cloned())
            }
            None => {
                let events = self.snapshot().await;
                Ok(events
                    .into_iter()
                    .max_by_key(|e| (e.timestamp_utc, e.event_id)))
            }
        }
    }

    async fn verify_chain(
        &self,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Result<AuditIntegrityResult> {
        let chains: Vec<Arc<Mutex<TenantChain>>> = {
            let chains = self.chains.read().await;
            chains.values().map(Arc::clone).collect()
        };

        let mut events_verified = 0u64;
        let mut violation_count = 0u64;
        let mut first_violation: Option<(AuditEventId, String)> = None;

        for chain in chains {
            let chain = chain.lock().await;
            let mut previous_hash: Option<String> = None;
            for event in &chain.events {
                let in_range =
                    event.timestamp_utc >= start_date && event.timestamp_utc <= end_date;

                if in_range {
                    events_verified += 1;

                    let expected = event.compute_hash(event.previous_event_hash.as_deref());
                    let stored = event.event_hash.as_deref().unwrap_or("");
                    if !hashes_equal(stored, &expected) {
                        violation_count += 1;
                        if first_violation.is_none() {
                            first_violation = Some((
                                event.event_id,
                                format!(
                                    "event hash mismatch at sequence {}",
                                    event.sequence_number
                                ),
                            ));
                        }
                    } else if let Some(previous) = &previous_hash {
                        let linked = event.previous_event_hash.as_deref().unwrap_or("");
                        if !hashes_equal(linked, previous) {
                            violation_count += 1;
                            if first_violation.is_none() {
                                first_violation = Some((
                                    event.event_id,
                                    format!(
                                        "previous hash broken at sequence {}",
                                        event.sequence_number
                                    ),
                                ));
                            }
                        }
                    }

                    if violation_count as usize >= self.violation_cap {
                        break;
                    }
                }

                previous_hash = event.event_hash.clone();
            }
        }

        let is_valid = violation_count == 0;
        let (first_violation_event_id, violation_description) = match first_violation {
            Some((id, description)) => (Some(id), Some(description)),
            None => (None, None),
        };
        Ok(AuditIntegrityResult {
            is_valid,
            events_verified,
            start_date,
            end_date,
            verified_at: self.clock.now_utc(),
            first_violation_event_id,
            violation_description,
            violation_count: if is_valid { 0 } else { violation_count.max(1) },
        })
    }
}
