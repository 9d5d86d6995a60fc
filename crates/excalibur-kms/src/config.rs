//! Key management configuration

use std::time::Duration;

/// KMS behaviour knobs
#[derive(Debug, Clone)]
pub struct KmsConfig {
    /// Alias prefix marking keys this runtime owns
    pub key_alias_prefix: String,
    /// Deployment environment suffix folded into aliases
    pub environment: Option<String>,
    /// Rotate keys automatically on schedule
    pub enable_auto_rotation: bool,
    /// Metadata cache lifetime, seconds
    pub metadata_cache_duration_seconds: u64,
    /// Retention window used when deletion does not specify one
    pub default_deletion_retention_days: u32,
    /// Create multi-region replicas on key creation
    pub create_multi_region_keys: bool,
    /// Regions replicas are created in
    pub replica_regions: Vec<String>,
}

impl Default for KmsConfig {
    fn default() -> Self {
        Self {
            key_alias_prefix: "excalibur-dispatch".to_string(),
            environment: None,
            enable_auto_rotation: true,
            metadata_cache_duration_seconds: 300,
            default_deletion_retention_days: 30,
            create_multi_region_keys: false,
            replica_regions: Vec::new(),
        }
    }
}

impl KmsConfig {
    /// The alias for a purpose under this prefix and environment
    pub fn alias_for(&self, purpose: Option<&str>) -> String {
        let purpose = purpose.unwrap_or("default");
        match &self.environment {
            Some(environment) => {
                format!("{}-{}/{}", self.key_alias_prefix, environment, purpose)
            }
            None => format!("{}/{}", self.key_alias_prefix, purpose),
        }
    }

    /// True when a key id belongs to this runtime
    pub fn owns_key(&self, key_id: &str) -> bool {
        key_id.starts_with(&self.key_alias_prefix)
    }
}

/// Cross-region replication mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Writes confirm locally, replicate in the background
    Asynchronous,
    /// Writes confirm on a replica quorum
    Synchronous,
}

/// Multi-region replication knobs
#[derive(Debug, Clone)]
pub struct MultiRegionConfig {
    /// How replicas receive changes
    pub replication_mode: ReplicationMode,
    /// Recovery-point objective
    pub rpo_target: Duration,
    /// Recovery-time objective
    pub rto_target: Duration,
    /// Replica health probe cadence
    pub health_check_interval: Duration,
    /// Consecutive failed probes before failover
    pub failover_threshold: u32,
    /// Fail over without an operator
    pub enable_automatic_failover: bool,
}

impl Default for MultiRegionConfig {
    fn default() -> Self {
        Self {
            replication_mode: ReplicationMode::Asynchronous,
            rpo_target: Duration::from_secs(15 * 60),
            rto_target: Duration::from_secs(5 * 60),
            health_check_interval: Duration::from_secs(30),
            failover_threshold: 3,
            enable_automatic_failover: true,
        }
    }
}
