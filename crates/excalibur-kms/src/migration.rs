//! Key migration
//!
//! Re-encrypts data at rest onto current keys. A policy decides which
//! items need migration (key age, version floor, deprecated keys and
//! algorithms, FIPS requirement, tenant whitelist); the migrator
//! estimates the work, then executes batches with bounded parallelism,
//! per-item timeouts, and progress tracking.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tracing::{info, warn};

use excalibur_types::{DispatchError, MigrationId, Result};

use crate::envelope::{EncryptedData, EnvelopeEncryptor};
use crate::key::{KeyAlgorithm, KeyMetadata};
use crate::provider::{InMemoryKmsProvider, KmsProvider};

/// Selects which items need migration
#[derive(Debug, Clone, Default)]
pub struct MigrationPolicy {
    /// Migrate data whose key is older than this many days
    pub max_key_age_days: Option<u32>,
    /// Migrate data encrypted under versions below this floor
    pub min_key_version: Option<u32>,
    /// Migrate data not yet on this algorithm
    pub target_algorithm: Option<KeyAlgorithm>,
    /// Keys that must be migrated away from
    pub deprecated_key_ids: HashSet<String>,
    /// Algorithms that must be migrated away from
    pub deprecated_algorithms: HashSet<KeyAlgorithm>,
    /// Migrate data under non-FIPS keys
    pub require_fips: bool,
    /// Restrict migration to these tenants, when set
    pub tenant_whitelist: Option<HashSet<String>>,
}

impl MigrationPolicy {
    /// Why an item matches, or `None` when it does not
    pub fn match_reason(
        &self,
        data: &EncryptedData,
        key: &KeyMetadata,
        now: DateTime<Utc>,
    ) -> Option<&'static str> {
        if let Some(whitelist) = &self.tenant_whitelist {
            match &data.tenant_id {
                Some(tenant) if whitelist.contains(tenant) => {}
                _ => return None,
            }
        }
        if self.deprecated_key_ids.contains(&key.key_id) {
            return Some("deprecated-key");
        }
        if self.deprecated_algorithms.contains(&key.algorithm) {
            return Some("deprecated-algorithm");
        }
        if let Some(max_age) = self.max_key_age_days {
            if now - key.created_at > Duration::days(max_age as i64) {
                return Some("key-age");
            }
        }
        if let Some(floor) = self.min_key_version {
            if data.key_version < floor {
                return Some("key-version");
            }
        }
        if let Some(target) = self.target_algorithm {
            if data.algorithm != target {
                return Some("algorithm");
            }
        }
        if self.require_fips && !key.is_fips_compliant {
            return Some("fips");
        }
        None
    }
}

/// Migration execution knobs
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Concurrent item migrations
    pub max_degree_of_parallelism: usize,
    /// Items per tracked batch
    pub batch_size: usize,
    /// Keep migrating after an item fails
    pub continue_on_error: bool,
    /// Wall-clock budget per item
    pub item_timeout: std::time::Duration,
    /// Record progress in the status table
    pub track_progress: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            max_degree_of_parallelism: 4,
            batch_size: 100,
            continue_on_error: true,
            item_timeout: std::time::Duration::from_secs(60),
            track_progress: true,
        }
    }
}

/// Forecast of a migration run
#[derive(Debug, Clone)]
pub struct MigrationEstimate {
    /// Items needing migration
    pub item_count: u64,
    /// Bytes of ciphertext to re-encrypt
    pub byte_size: u64,
    /// Rough wall-clock forecast
    pub duration: std::time::Duration,
    /// Item counts by match reason
    pub breakdowns: HashMap<String, u64>,
    /// Non-fatal observations (missing keys, unreadable items)
    pub warnings: Vec<String>,
    /// When the estimate was computed
    pub estimated_at: DateTime<Utc>,
}

/// Migration run lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Queued, not yet started
    Pending,
    /// Executing
    Running,
    /// Paused by an operator
    Paused,
    /// Finished with zero failures
    Completed,
    /// Finished with failures
    Failed,
    /// Cancelled before completion
    Cancelled,
}

/// Tracked progress of a migration run
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Run identity
    pub migration_id: MigrationId,
    /// Lifecycle state
    pub state: MigrationState,
    /// Items in the run
    pub total_items: u64,
    /// Items finished (either way)
    pub completed_items: u64,
    /// Items migrated successfully
    pub succeeded_items: u64,
    /// Items that failed
    pub failed_items: u64,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Last progress update
    pub last_updated_at: DateTime<Utc>,
    /// Run end, once finished
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure summary, when the run failed
    pub error_message: Option<String>,
    /// Free-form detail
    pub details: Option<String>,
}

impl MigrationStatus {
    /// Percentage of items completed; 0 when the run is empty
    pub fn percent_complete(&self) -> f64 {
        if self.total_items == 0 {
            0.0
        } else {
            100.0 * self.completed_items as f64 / self.total_items as f64
        }
    }
}

/// Outcome of one batch migration
#[derive(Debug)]
pub struct BatchMigrationResult {
    /// True when zero items failed
    pub success: bool,
    /// Run identity
    pub migration_id: MigrationId,
    /// Items in the run
    pub total_items: u64,
    /// Items migrated successfully
    pub succeeded: u64,
    /// Items that failed
    pub failed: u64,
    /// Wall-clock duration
    pub duration: std::time::Duration,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub completed_at: DateTime<Utc>,
    /// Re-encrypted items, indexed as submitted (`None` for failures)
    pub migrated: Vec<Option<EncryptedData>>,
    /// Per-item failures
    pub errors: Vec<DispatchError>,
}

impl BatchMigrationResult {
    /// Some items succeeded even though the run failed
    pub fn is_partial_success(&self) -> bool {
        !self.success && self.succeeded > 0
    }
}

/// Plans and executes key migrations
pub struct KeyMigrator {
    provider: Arc<InMemoryKmsProvider>,
    encryptor: Arc<EnvelopeEncryptor>,
    options: MigrationOptions,
    statuses: Arc<RwLock<HashMap<MigrationId, MigrationStatus>>>,
}

impl KeyMigrator {
    /// Create a migrator with default options
    pub fn new(provider: Arc<InMemoryKmsProvider>) -> Self {
        Self {
            encryptor: Arc::new(EnvelopeEncryptor::new(provider.clone())),
            provider,
            options: MigrationOptions::default(),
            statuses: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Replace the options
    pub fn with_options(mut self, options: MigrationOptions) -> Self {
        self.options = options;
        self
    }

    /// Tracked status of a run
    pub async fn status(&self, migration_id: &MigrationId) -> Option<MigrationStatus> {
        self.statuses.read().await.get(migration_id).cloned()
    }

    /// Estimate the work a policy selects out of the given items
    pub async fn estimate(
        &self,
        items: &[EncryptedData],
        policy: &MigrationPolicy,
    ) -> Result<MigrationEstimate> {
        let now = Utc::now();
        let mut item_count = 0u64;
        let mut byte_size = 0u64;
        let mut breakdowns: HashMap<String, u64> = HashMap::new();
        let mut warnings = Vec::new();

        for data in items {
            let key = self
                .provider
                .get_key_version(&data.key_id, data.key_version)
                .await?;
            let Some(key) = key else {
                warnings.push(format!(
                    "key {} v{} not found; item skipped",
                    data.key_id, data.key_version
                ));
                continue;
            };
            if let Some(reason) = policy.match_reason(data, &key, now) {
                item_count += 1;
                byte_size += data.ciphertext.len() as u64;
                *breakdowns.entry(reason.to_string()).or_insert(0) += 1;
            }
        }

        // Forecast from per-item cost spread over the configured lanes.
        let per_item_ms = 5u64;
        let lanes = self.options.max_degree_of_parallelism.max(1) as u64;
        let duration = std::time::Duration::from_millis(per_item_ms * item_count / lanes.max(1));

        Ok(MigrationEstimate {
            item_count,
            byte_size,
            duration,
            breakdowns,
            warnings,
            estimated_at: now,
        })
    }

    /// Re-encrypt items onto the current active key
    ///
    /// Items run concurrently up to `max_degree_of_parallelism`, each
    /// bounded by `item_timeout`. With `continue_on_error` unset, the
    /// first failure stops scheduling of not-yet-started items.
    pub async fn batch_migrate(&self, items: Vec<EncryptedData>) -> BatchMigrationResult {
        let migration_id = MigrationId::new();
        let started_at = Utc::now();
        let started = std::time::Instant::now();
        let total_items = items.len() as u64;

        if self.options.track_progress {
            self.statuses.write().await.insert(
                migration_id.clone(),
                MigrationStatus {
                    migration_id: migration_id.clone(),
                    state: MigrationState::Running,
                    total_items,
                    completed_items: 0,
                    succeeded_items: 0,
                    failed_items: 0,
                    started_at,
                    last_updated_at: started_at,
                    completed_at: None,
                    error_message: None,
                    details: None,
                },
            );
        }

        let semaphore = Arc::new(Semaphore::new(self.options.max_degree_of_parallelism.max(1)));
        let abort = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(items.len());

        for (index, item) in items.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let abort = Arc::clone(&abort);
            let encryptor = Arc::clone(&self.encryptor);
            let continue_on_error = self.options.continue_on_error;
            let item_timeout = self.options.item_timeout;

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                if abort.load(Ordering::SeqCst) {
                    return (
                        index,
                        Err(DispatchError::MigrationItemFailed {
                            item_id: index.to_string(),
                            reason: "migration aborted after earlier failure".to_string(),
                        }),
                    );
                }

                let outcome = tokio::time::timeout(item_timeout, async {
                    let plaintext = encryptor.decrypt(&item).await?;
                    let mut migrated = encryptor
                        .encrypt(&plaintext, None, item.associated_data.as_deref())
                        .await?;
                    migrated.tenant_id = item.tenant_id.clone();
                    Ok::<EncryptedData, DispatchError>(migrated)
                })
                .await;

                let result = match outcome {
                    Ok(Ok(migrated)) => Ok(migrated),
                    Ok(Err(err)) => Err(DispatchError::MigrationItemFailed {
                        item_id: index.to_string(),
                        reason: err.to_string(),
                    }),
                    Err(_elapsed) => Err(DispatchError::MigrationItemFailed {
                        item_id: index.to_string(),
                        reason: "item migration timed out".to_string(),
                    }),
                };
                if result.is_err() && !continue_on_error {
                    abort.store(true, Ordering::SeqCst);
                }
                (index, result)
            }));
        }

        let mut migrated: Vec<Option<EncryptedData>> = (0..total_items).map(|_| None).collect();
        let mut errors = Vec::new();
        let mut succeeded = 0u64;
        let mut failed = 0u64;

        for handle in handles {
            let (index, result) = match handle.await {
                Ok(entry) => entry,
                Err(join_error) => {
                    failed += 1;
                    errors.push(DispatchError::internal(format!(
                        "migration worker panicked: {}",
                        join_error
                    )));
                    continue;
                }
            };
            match result {
                Ok(data) => {
                    migrated[index] = Some(data);
                    succeeded += 1;
                }
                Err(err) => {
                    warn!(item = index, error = %err, "migration item failed");
                    failed += 1;
                    errors.push(err);
                }
            }
            if self.options.track_progress {
                let mut statuses = self.statuses.write().await;
                if let Some(status) = statuses.get_mut(&migration_id) {
                    status.completed_items += 1;
                    status.succeeded_items = succeeded;
                    status.failed_items = failed;
                    status.last_updated_at = Utc::now();
                }
            }
        }

        let completed_at = Utc::now();
        let success = failed == 0;
        if self.options.track_progress {
            let mut statuses = self.statuses.write().await;
            if let Some(status) = statuses.get_mut(&migration_id) {
                status.state = if success {
                    MigrationState::Completed
                } else {
                    MigrationState::Failed
                };
                status.completed_at = Some(completed_at);
                if !success {
                    status.error_message = Some(format!("{} item(s) failed", failed));
                }
            }
        }

        info!(
            migration_id = %migration_id,
            total = total_items,
            succeeded,
            failed,
            "batch migration finished"
        );
        BatchMigrationResult {
            success,
            migration_id,
            total_items,
            succeeded,
            failed,
            duration: started.elapsed(),
            started_at,
            completed_at,
            migrated,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn provider_with_data(count: usize) -> (Arc<InMemoryKmsProvider>, Vec<EncryptedData>) {
        let provider = Arc::new(InMemoryKmsProvider::new());
        let encryptor = EnvelopeEncryptor::new(provider.clone());
        let mut items = Vec::new();
        for i in 0..count {
            items.push(
                encryptor
                    .encrypt(format!("record-{}", i).as_bytes(), None, None)
                    .await
                    .unwrap(),
            );
        }
        (provider, items)
    }

    #[tokio::test]
    async fn test_estimate_with_version_floor() {
        let (provider, items) = provider_with_data(3).await;
        // Rotate so the existing items sit on an old version.
        let key_id = items[0].key_id.clone();
        provider
            .rotate(&key_id, KeyAlgorithm::Aes256Gcm, None)
            .await
            .unwrap();

        let migrator = KeyMigrator::new(provider);
        let policy = MigrationPolicy {
            min_key_version: Some(2),
            ..MigrationPolicy::default()
        };
        let estimate = migrator.estimate(&items, &policy).await.unwrap();

        assert_eq!(estimate.item_count, 3);
        assert_eq!(estimate.breakdowns.get("key-version"), Some(&3));
        assert!(estimate.byte_size > 0);
        assert!(estimate.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_batch_migrate_re_encrypts_onto_active_version() {
        let (provider, items) = provider_with_data(4).await;
        let key_id = items[0].key_id.clone();
        provider
            .rotate(&key_id, KeyAlgorithm::Aes256Gcm, None)
            .await
            .unwrap();

        let migrator = KeyMigrator::new(provider.clone());
        let result = migrator.batch_migrate(items).await;

        assert!(result.success);
        assert_eq!(result.succeeded, 4);
        assert_eq!(result.failed, 0);
        assert!(!result.is_partial_success());
        for migrated in result.migrated.iter().flatten() {
            assert_eq!(migrated.key_version, 2);
        }

        let status = migrator.status(&result.migration_id).await.unwrap();
        assert_eq!(status.state, MigrationState::Completed);
        assert_eq!(status.percent_complete(), 100.0);
    }

    #[tokio::test]
    async fn test_partial_success_when_an_item_is_corrupt() {
        let (provider, mut items) = provider_with_data(3).await;
        // Corrupt one ciphertext so its migration fails.
        items[1].ciphertext[0] ^= 0xFF;

        let migrator = KeyMigrator::new(provider);
        let result = migrator.batch_migrate(items).await;

        assert!(!result.success);
        assert_eq!(result.succeeded, 2);
        assert_eq!(result.failed, 1);
        assert!(result.is_partial_success());
        assert_eq!(result.errors.len(), 1);
        assert!(result.migrated[1].is_none());
    }

    #[tokio::test]
    async fn test_empty_run_percent_is_zero() {
        let (provider, _) = provider_with_data(0).await;
        let migrator = KeyMigrator::new(provider);
        let result = migrator.batch_migrate(Vec::new()).await;
        assert!(result.success);

        let status = migrator.status(&result.migration_id).await.unwrap();
        assert_eq!(status.percent_complete(), 0.0);
    }

    #[tokio::test]
    async fn test_tenant_whitelist_scopes_estimate() {
        let (provider, mut items) = provider_with_data(2).await;
        items[0].tenant_id = Some("tenant-a".to_string());
        items[1].tenant_id = Some("tenant-b".to_string());

        let migrator = KeyMigrator::new(provider);
        let policy = MigrationPolicy {
            min_key_version: Some(99),
            tenant_whitelist: Some(HashSet::from(["tenant-a".to_string()])),
            ..MigrationPolicy::default()
        };
        let estimate = migrator.estimate(&items, &policy).await.unwrap();
        assert_eq!(estimate.item_count, 1);
    }
}
