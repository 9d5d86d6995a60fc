//! Key metadata and lifecycle
//!
//! A key id names a family of versions. At most one version is Active;
//! only Active versions encrypt, while Active and DecryptOnly versions
//! decrypt. The lifecycle walks monotonically:
//!
//! ```text
//! Active → DecryptOnly → PendingDestruction → Destroyed
//!    ↕
//! Suspended   (temporary, returns only to Active)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported data-encryption algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// AES-256 in GCM mode (the default)
    Aes256Gcm,
    /// AES-256 in CBC mode with HMAC authentication
    Aes256CbcHmac,
}

impl KeyAlgorithm {
    /// Wire tag used in the encrypted-data framing
    pub fn tag(&self) -> u8 {
        match self {
            Self::Aes256Gcm => 1,
            Self::Aes256CbcHmac => 2,
        }
    }

    /// Parse a framing tag
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Aes256Gcm),
            2 => Some(Self::Aes256CbcHmac),
            _ => None,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Aes256Gcm => "AES-256-GCM",
            Self::Aes256CbcHmac => "AES-256-CBC-HMAC",
        };
        write!(f, "{}", name)
    }
}

/// Key version lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyStatus {
    /// Encrypts and decrypts
    Active,
    /// Decrypts existing data only
    DecryptOnly,
    /// Scheduled for destruction after the retention window
    PendingDestruction,
    /// Material destroyed
    Destroyed,
    /// Temporarily unusable; returns only to Active
    Suspended,
}

impl KeyStatus {
    /// True when this status permits encrypting new data
    pub fn can_encrypt(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// True when this status permits decrypting existing data
    pub fn can_decrypt(&self) -> bool {
        matches!(self, Self::Active | Self::DecryptOnly)
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "Active",
            Self::DecryptOnly => "DecryptOnly",
            Self::PendingDestruction => "PendingDestruction",
            Self::Destroyed => "Destroyed",
            Self::Suspended => "Suspended",
        };
        write!(f, "{}", name)
    }
}

/// Metadata for one key version
///
/// Key material never appears here; it stays inside the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMetadata {
    /// Key family identity
    pub key_id: String,
    /// Version within the family, starting at 1
    pub version: u32,
    /// Lifecycle status
    pub status: KeyStatus,
    /// Algorithm the material is for
    pub algorithm: KeyAlgorithm,
    /// Creation time (UTC)
    pub created_at: DateTime<Utc>,
    /// Expiry, when the key has one
    pub expires_at: Option<DateTime<Utc>>,
    /// When the family was last rotated
    pub last_rotated_at: Option<DateTime<Utc>>,
    /// Purpose tag scoping what the key protects
    pub purpose: Option<String>,
    /// Whether the algorithm and provider meet FIPS requirements
    pub is_fips_compliant: bool,
    /// Why the key was suspended, when it is
    pub suspension_reason: Option<String>,
    /// When the key was suspended, when it is
    pub suspended_at: Option<DateTime<Utc>>,
    /// When a pending destruction completes
    pub pending_destruction_at: Option<DateTime<Utc>>,
}

/// Outcome of a committed rotation
#[derive(Debug, Clone)]
pub struct RotationResult {
    /// Rotated key family
    pub key_id: String,
    /// Version that moved to DecryptOnly, when one existed
    pub previous_version: Option<u32>,
    /// The new Active version
    pub new_version: u32,
    /// Algorithm of the new version
    pub algorithm: KeyAlgorithm,
    /// Commit time of the rotation
    pub rotated_at: DateTime<Utc>,
}

/// Bounds on the deletion retention window, in days
pub const MIN_DELETION_RETENTION_DAYS: u32 = 7;
/// Upper bound on the deletion retention window, in days
pub const MAX_DELETION_RETENTION_DAYS: u32 = 30;

/// Clamp a requested retention window into the allowed range
pub fn clamp_retention_days(requested: u32) -> u32 {
    requested.clamp(MIN_DELETION_RETENTION_DAYS, MAX_DELETION_RETENTION_DAYS)
}
