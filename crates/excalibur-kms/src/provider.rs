//! The key provider
//!
//! Provider-facing operations over key families: lookup, listing,
//! rotation, suspension, and scheduled deletion. Rotation is atomic: a
//! reader fetching the active key sees the old version until the commit,
//! the new version after it, and never a partial state.
//!
//! **Security Invariant: key material NEVER leaves the provider.**
//! Encrypt and decrypt are operations on the provider, not accessors.

use async_trait::async_trait;
use chrono::Duration;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use excalibur_types::{Clock, DispatchError, Result, SharedClock, SystemClock};

use crate::config::KmsConfig;
use crate::key::{clamp_retention_days, KeyAlgorithm, KeyMetadata, KeyStatus, RotationResult};

/// Provider-facing key operations
#[async_trait]
pub trait KmsProvider: Send + Sync {
    /// Current metadata for a key family (its newest version)
    async fn get_key(&self, key_id: &str) -> Result<Option<KeyMetadata>>;

    /// Metadata for a specific version
    async fn get_key_version(&self, key_id: &str, version: u32) -> Result<Option<KeyMetadata>>;

    /// List keys this runtime owns, optionally filtered
    async fn list_keys(
        &self,
        status: Option<KeyStatus>,
        purpose: Option<&str>,
    ) -> Result<Vec<KeyMetadata>>;

    /// The Active key for a purpose
    ///
    /// With no purpose and no existing key, a default key is created;
    /// with an explicit purpose and no key, `None` is returned.
    async fn get_active_key(&self, purpose: Option<&str>) -> Result<Option<KeyMetadata>>;

    /// Rotate a family: the new version becomes Active, the prior Active
    /// moves to DecryptOnly, and the alias follows, atomically
    ///
    /// Rotating a missing key id creates a first-version key.
    async fn rotate(
        &self,
        key_id: &str,
        algorithm: KeyAlgorithm,
        purpose: Option<&str>,
    ) -> Result<RotationResult>;

    /// Schedule a family for destruction after the retention window
    /// (clamped to 7-30 days); true when the key existed
    async fn delete(&self, key_id: &str, retention_days: u32) -> Result<bool>;

    /// Suspend an Active key, tagging the reason; true when suspended
    async fn suspend(&self, key_id: &str, reason: &str) -> Result<bool>;

    /// Return a Suspended key to Active; true when resumed
    async fn resume(&self, key_id: &str) -> Result<bool>;
}

/// One stored version: metadata plus the material that never leaves
struct KeyRecord {
    metadata: KeyMetadata,
    material: [u8; 32],
}

/// In-memory key provider
///
/// The reference implementation for tests and single-process hosts; a
/// cloud KMS binding implements the same trait against its SDK.
pub struct InMemoryKmsProvider {
    config: KmsConfig,
    families: RwLock<HashMap<String, Vec<KeyRecord>>>,
    clock: SharedClock,
}

impl InMemoryKmsProvider {
    /// Create a provider with the default configuration
    pub fn new() -> Self {
        Self::with_config(KmsConfig::default())
    }

    /// Create a provider with an explicit configuration
    pub fn with_config(config: KmsConfig) -> Self {
        Self {
            config,
            families: RwLock::new(HashMap::new()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// The configuration in effect
    pub fn config(&self) -> &KmsConfig {
        &self.config
    }

    fn fresh_material() -> [u8; 32] {
        let mut material = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut material);
        material
    }

    fn new_key_id(&self, purpose: Option<&str>) -> String {
        format!(
            "{}-{}",
            self.config.alias_for(purpose),
            uuid_suffix()
        )
    }

    /// Read the material for a version that may decrypt
    pub(crate) async fn decryption_material(
        &self,
        key_id: &str,
        version: u32,
    ) -> Result<[u8; 32]> {
        let families = self.families.read().await;
        let record = families
            .get(key_id)
            .and_then(|versions| versions.iter().find(|r| r.metadata.version == version))
            .ok_or_else(|| DispatchError::KeyNotFound {
                key_id: key_id.to_string(),
            })?;
        if !record.metadata.status.can_decrypt() {
            return Err(DispatchError::KeyStateInvalid {
                key_id: key_id.to_string(),
                status: record.metadata.status.to_string(),
                operation: "decrypt".to_string(),
            });
        }
        Ok(record.material)
    }

    /// Read the material for the Active version of a purpose, creating a
    /// default key when necessary
    pub(crate) async fn encryption_material(
        &self,
        purpose: Option<&str>,
    ) -> Result<(KeyMetadata, [u8; 32])> {
        if let Some(found) = self.find_active_with_material(purpose).await {
            return Ok(found);
        }
        if purpose.is_some() {
            return Err(DispatchError::KeyNotFound {
                key_id: self.config.alias_for(purpose),
            });
        }
        self.get_active_key(None).await?;
        self.find_active_with_material(None)
            .await
            .ok_or_else(|| DispatchError::internal("default key creation did not yield an active key"))
    }

    async fn find_active_with_material(
        &self,
        purpose: Option<&str>,
    ) -> Option<(KeyMetadata, [u8; 32])> {
        let families = self.families.read().await;
        for versions in families.values() {
            for record in versions {
                if record.metadata.status == KeyStatus::Active
                    && record.metadata.purpose.as_deref() == purpose
                {
                    return Some((record.metadata.clone(), record.material));
                }
            }
        }
        None
    }
}

impl Default for InMemoryKmsProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn uuid_suffix() -> String {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[async_trait]
impl KmsProvider for InMemoryKmsProvider {
    async fn get_key(&self, key_id: &str) -> Result<Option<KeyMetadata>> {
        let families = self.families.read().await;
        Ok(families
            .get(key_id)
            .and_then(|versions| versions.last())
            .map(|record| record.metadata.clone()))
    }

    async fn get_key_version(&self, key_id: &str, version: u32) -> Result<Option<KeyMetadata>> {
        let families = self.families.read().await;
        Ok(families.get(key_id).and_then(|versions| {
            versions
                .iter()
                .find(|record| record.metadata.version == version)
                .map(|record| record.metadata.clone())
        }))
    }

    async fn list_keys(
        &self,
        status: Option<KeyStatus>,
        purpose: Option<&str>,
    ) -> Result<Vec<KeyMetadata>> {
        let families = self.families.read().await;
        let mut keys: Vec<KeyMetadata> = families
            .iter()
            .filter(|(key_id, _)| self.config.owns_key(key_id))
            .flat_map(|(_, versions)| versions.iter().map(|record| record.metadata.clone()))
            .filter(|metadata| status.map_or(true, |s| metadata.status == s))
            .filter(|metadata| {
                purpose.map_or(true, |p| metadata.purpose.as_deref() == Some(p))
            })
            .collect();
        keys.sort_by(|a, b| a.key_id.cmp(&b.key_id).then(a.version.cmp(&b.version)));
        Ok(keys)
    }

    async fn get_active_key(&self, purpose: Option<&str>) -> Result<Option<KeyMetadata>> {
        {
            let families = self.families.read().await;
            for versions in families.values() {
                for record in versions {
                    if record.metadata.status == KeyStatus::Active
                        && record.metadata.purpose.as_deref() == purpose
                    {
                        return Ok(Some(record.metadata.clone()));
                    }
                }
            }
        }

        if purpose.is_some() {
            return Ok(None);
        }

        // No default key yet: create one.
        let now = self.clock.now_utc();
        let key_id = self.new_key_id(None);
        let metadata = KeyMetadata {
            key_id: key_id.clone(),
            version: 1,
            status: KeyStatus::Active,
            algorithm: KeyAlgorithm::Aes256Gcm,
            created_at: now,
            expires_at: None,
            last_rotated_at: None,
            purpose: None,
            is_fips_compliant: true,
            suspension_reason: None,
            suspended_at: None,
            pending_destruction_at: None,
        };
        let mut families = self.families.write().await;
        // A concurrent creator may have won the race; re-check under the
        // write lock before inserting.
        for versions in families.values() {
            for record in versions {
                if record.metadata.status == KeyStatus::Active && record.metadata.purpose.is_none()
                {
                    return Ok(Some(record.metadata.clone()));
                }
            }
        }
        info!(key_id = %key_id, "default key created");
        families.insert(
            key_id,
            vec![KeyRecord {
                metadata: metadata.clone(),
                material: Self::fresh_material(),
            }],
        );
        Ok(Some(metadata))
    }

    async fn rotate(
        &self,
        key_id: &str,
        algorithm: KeyAlgorithm,
        purpose: Option<&str>,
    ) -> Result<RotationResult> {
        let mut families = self.families.write().await;
        let now = self.clock.now_utc();

        let versions = families.entry(key_id.to_string()).or_default();
        let previous_version = versions
            .iter_mut()
            .find(|record| record.metadata.status == KeyStatus::Active)
            .map(|record| {
                record.metadata.status = KeyStatus::DecryptOnly;
                record.metadata.version
            });

        let new_version = versions
            .iter()
            .map(|record| record.metadata.version)
            .max()
            .unwrap_or(0)
            + 1;
        let metadata = KeyMetadata {
            key_id: key_id.to_string(),
            version: new_version,
            status: KeyStatus::Active,
            algorithm,
            created_at: now,
            expires_at: None,
            last_rotated_at: Some(now),
            purpose: purpose.map(ToString::to_string),
            is_fips_compliant: true,
            suspension_reason: None,
            suspended_at: None,
            pending_destruction_at: None,
        };
        versions.push(KeyRecord {
            metadata,
            material: Self::fresh_material(),
        });

        info!(key_id, new_version, "key rotated");
        Ok(RotationResult {
            key_id: key_id.to_string(),
            previous_version,
            new_version,
            algorithm,
            rotated_at: now,
        })
    }

    async fn delete(&self, key_id: &str, retention_days: u32) -> Result<bool> {
        let retention = clamp_retention_days(retention_days);
        let mut families = self.families.write().await;
        let Some(versions) = families.get_mut(key_id) else {
            return Ok(false);
        };
        let destroy_at = self.clock.now_utc() + Duration::days(retention as i64);
        for record in versions.iter_mut() {
            if record.metadata.status != KeyStatus::Destroyed {
                record.metadata.status = KeyStatus::PendingDestruction;
                record.metadata.pending_destruction_at = Some(destroy_at);
            }
        }
        info!(key_id, retention_days = retention, "key scheduled for destruction");
        Ok(true)
    }

    async fn suspend(&self, key_id: &str, reason: &str) -> Result<bool> {
        let mut families = self.families.write().await;
        let Some(versions) = families.get_mut(key_id) else {
            return Ok(false);
        };
        let now = self.clock.now_utc();
        let mut suspended = false;
        for record in versions.iter_mut() {
            if record.metadata.status == KeyStatus::Active {
                record.metadata.status = KeyStatus::Suspended;
                record.metadata.suspension_reason = Some(reason.to_string());
                record.metadata.suspended_at = Some(now);
                suspended = true;
            }
        }
        if suspended {
            info!(key_id, reason, "key suspended");
        }
        Ok(suspended)
    }

    async fn resume(&self, key_id: &str) -> Result<bool> {
        let mut families = self.families.write().await;
        let Some(versions) = families.get_mut(key_id) else {
            return Ok(false);
        };
        let mut resumed = false;
        for record in versions.iter_mut() {
            if record.metadata.status == KeyStatus::Suspended {
                record.metadata.status = KeyStatus::Active;
                record.metadata.suspension_reason = None;
                record.metadata.suspended_at = None;
                resumed = true;
            }
        }
        Ok(resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_active_creates_default_key_once() {
        let provider = InMemoryKmsProvider::new();
        let first = provider.get_active_key(None).await.unwrap().unwrap();
        let second = provider.get_active_key(None).await.unwrap().unwrap();
        assert_eq!(first.key_id, second.key_id);
        assert_eq!(first.version, 1);
        assert!(first.key_id.starts_with("excalibur-dispatch"));
    }

    #[tokio::test]
    async fn test_get_active_with_purpose_does_not_create() {
        let provider = InMemoryKmsProvider::new();
        let found = provider.get_active_key(Some("audit")).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_rotation_atomicity_observables() {
        let provider = InMemoryKmsProvider::new();
        let initial = provider.get_active_key(None).await.unwrap().unwrap();
        assert_eq!(initial.version, 1);

        let rotation = provider
            .rotate(&initial.key_id, KeyAlgorithm::Aes256Gcm, None)
            .await
            .unwrap();
        assert_eq!(rotation.previous_version, Some(1));
        assert_eq!(rotation.new_version, 2);

        let active = provider.get_active_key(None).await.unwrap().unwrap();
        assert_eq!(active.version, 2);
        assert_eq!(active.status, KeyStatus::Active);

        let old = provider
            .get_key_version(&initial.key_id, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.status, KeyStatus::DecryptOnly);
    }

    #[tokio::test]
    async fn test_rotation_of_missing_key_creates_first_version() {
        let provider = InMemoryKmsProvider::new();
        let rotation = provider
            .rotate("excalibur-dispatch/orders-0001", KeyAlgorithm::Aes256Gcm, Some("orders"))
            .await
            .unwrap();
        assert_eq!(rotation.previous_version, None);
        assert_eq!(rotation.new_version, 1);

        let active = provider.get_active_key(Some("orders")).await.unwrap().unwrap();
        assert_eq!(active.version, 1);
    }

    #[tokio::test]
    async fn test_at_most_one_active_version_per_family() {
        let provider = InMemoryKmsProvider::new();
        let key = provider.get_active_key(None).await.unwrap().unwrap();
        provider
            .rotate(&key.key_id, KeyAlgorithm::Aes256Gcm, None)
            .await
            .unwrap();
        provider
            .rotate(&key.key_id, KeyAlgorithm::Aes256Gcm, None)
            .await
            .unwrap();

        let actives = provider
            .list_keys(Some(KeyStatus::Active), None)
            .await
            .unwrap();
        assert_eq!(actives.len(), 1);
        assert_eq!(actives[0].version, 3);
    }

    #[tokio::test]
    async fn test_suspend_and_resume() {
        let provider = InMemoryKmsProvider::new();
        let key = provider.get_active_key(None).await.unwrap().unwrap();

        assert!(provider.suspend(&key.key_id, "incident-42").await.unwrap());
        let suspended = provider.get_key(&key.key_id).await.unwrap().unwrap();
        assert_eq!(suspended.status, KeyStatus::Suspended);
        assert_eq!(suspended.suspension_reason.as_deref(), Some("incident-42"));
        assert!(suspended.suspended_at.is_some());

        assert!(provider.resume(&key.key_id).await.unwrap());
        let resumed = provider.get_key(&key.key_id).await.unwrap().unwrap();
        assert_eq!(resumed.status, KeyStatus::Active);
        assert!(resumed.suspension_reason.is_none());
    }

    #[tokio::test]
    async fn test_delete_clamps_retention() {
        let provider = InMemoryKmsProvider::new();
        let key = provider.get_active_key(None).await.unwrap().unwrap();

        assert!(provider.delete(&key.key_id, 1).await.unwrap());
        let pending = provider.get_key(&key.key_id).await.unwrap().unwrap();
        assert_eq!(pending.status, KeyStatus::PendingDestruction);
        let destroy_at = pending.pending_destruction_at.unwrap();
        let days = (destroy_at - pending.created_at).num_days();
        assert!((6..=8).contains(&days), "retention clamped to 7 days, got {}", days);

        assert!(!provider.delete("missing-key", 10).await.unwrap());
    }
}
