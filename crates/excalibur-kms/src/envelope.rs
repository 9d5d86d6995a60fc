//! Envelope encryption and the encrypted-data framing
//!
//! Field-level ciphertext is framed so it can be recognized at rest:
//!
//! ```text
//! offset 0..3   : 0x45 0x58 0x43 0x52  ("EXCR")
//! offset 4..7   : u32 BE format version (currently 1)
//! offset 8..15  : u64 BE encryptedAt (unix ms)
//! offset 16..   : length-prefixed fields: keyId, keyVersion, algorithm
//!                 tag, iv, optional authTag, optional associatedData,
//!                 ciphertext
//! ```
//!
//! Optional fields encode as zero-length. AES-256-GCM ciphertext carries
//! its tag attached, so `auth_tag` stays empty for that algorithm.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use excalibur_types::{DispatchError, Result};

use crate::key::KeyAlgorithm;
use crate::provider::InMemoryKmsProvider;

/// Magic prefix identifying framed ciphertext ("EXCR")
pub const ENCRYPTED_MAGIC: [u8; 4] = [0x45, 0x58, 0x43, 0x52];

/// Current framing version
pub const FRAMING_VERSION: u32 = 1;

/// GCM nonce length in bytes
const IV_LEN: usize = 12;

/// Framed encrypted field data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    /// The ciphertext (GCM tag attached)
    pub ciphertext: Vec<u8>,
    /// Key family that encrypted this data
    pub key_id: String,
    /// Key version that encrypted this data
    pub key_version: u32,
    /// Algorithm in use
    pub algorithm: KeyAlgorithm,
    /// Nonce
    pub iv: Vec<u8>,
    /// Detached authentication tag, for algorithms that carry one
    pub auth_tag: Option<Vec<u8>>,
    /// Additional authenticated data bound into the ciphertext
    pub associated_data: Option<Vec<u8>>,
    /// Tenant the data belongs to
    pub tenant_id: Option<String>,
    /// When the data was encrypted
    pub encrypted_at: DateTime<Utc>,
}

/// True iff the bytes start with the 4-byte `EXCR` magic
pub fn is_field_encrypted(bytes: &[u8]) -> bool {
    bytes.len() >= ENCRYPTED_MAGIC.len() && bytes[..ENCRYPTED_MAGIC.len()] == ENCRYPTED_MAGIC
}

impl EncryptedData {
    /// Serialize into the framed wire form
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.ciphertext.len());
        out.extend_from_slice(&ENCRYPTED_MAGIC);
        out.extend_from_slice(&FRAMING_VERSION.to_be_bytes());
        out.extend_from_slice(&(self.encrypted_at.timestamp_millis() as u64).to_be_bytes());
        push_bytes(&mut out, self.key_id.as_bytes());
        push_bytes(&mut out, &self.key_version.to_be_bytes());
        push_bytes(&mut out, &[self.algorithm.tag()]);
        push_bytes(&mut out, &self.iv);
        push_bytes(&mut out, self.auth_tag.as_deref().unwrap_or(&[]));
        push_bytes(&mut out, self.associated_data.as_deref().unwrap_or(&[]));
        push_bytes(&mut out, &self.ciphertext);
        out
    }

    /// Parse the framed wire form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if !is_field_encrypted(bytes) {
            return Err(DispatchError::argument(
                "bytes",
                "missing EXCR magic prefix",
            ));
        }
        let mut cursor = ENCRYPTED_MAGIC.len();
        let version = read_u32(bytes, &mut cursor)?;
        if version != FRAMING_VERSION {
            return Err(DispatchError::argument(
                "bytes",
                format!("unsupported framing version {}", version),
            ));
        }
        let encrypted_at_ms = read_u64(bytes, &mut cursor)?;
        let key_id = String::from_utf8(read_field(bytes, &mut cursor)?.to_vec())
            .map_err(|_| DispatchError::argument("bytes", "key id is not UTF-8"))?;
        let version_field = read_field(bytes, &mut cursor)?;
        let key_version = u32::from_be_bytes(
            version_field
                .try_into()
                .map_err(|_| DispatchError::argument("bytes", "malformed key version"))?,
        );
        let algorithm_field = read_field(bytes, &mut cursor)?;
        let algorithm = algorithm_field
            .first()
            .copied()
            .and_then(KeyAlgorithm::from_tag)
            .ok_or_else(|| DispatchError::argument("bytes", "unknown algorithm tag"))?;
        let iv = read_field(bytes, &mut cursor)?.to_vec();
        let auth_tag = optional(read_field(bytes, &mut cursor)?);
        let associated_data = optional(read_field(bytes, &mut cursor)?);
        let ciphertext = read_field(bytes, &mut cursor)?.to_vec();

        let encrypted_at = Utc
            .timestamp_millis_opt(encrypted_at_ms as i64)
            .single()
            .ok_or_else(|| DispatchError::argument("bytes", "timestamp out of range"))?;

        Ok(Self {
            ciphertext,
            key_id,
            key_version,
            algorithm,
            iv,
            auth_tag,
            associated_data,
            tenant_id: None,
            encrypted_at,
        })
    }
}

fn push_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    let end = *cursor + 4;
    let slice = bytes
        .get(*cursor..end)
        .ok_or_else(|| DispatchError::argument("bytes", "truncated frame"))?;
    *cursor = end;
    Ok(u32::from_be_bytes(slice.try_into().unwrap_or([0; 4])))
}

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64> {
    let end = *cursor + 8;
    let slice = bytes
        .get(*cursor..end)
        .ok_or_else(|| DispatchError::argument("bytes", "truncated frame"))?;
    *cursor = end;
    Ok(u64::from_be_bytes(slice.try_into().unwrap_or([0; 8])))
}

fn read_field<'a>(bytes: &'a [u8], cursor: &mut usize) -> Result<&'a [u8]> {
    let len = read_u32(bytes, cursor)? as usize;
    let end = *cursor + len;
    let slice = bytes
        .get(*cursor..end)
        .ok_or_else(|| DispatchError::argument("bytes", "truncated frame field"))?;
    *cursor = end;
    Ok(slice)
}

fn optional(field: &[u8]) -> Option<Vec<u8>> {
    if field.is_empty() {
        None
    } else {
        Some(field.to_vec())
    }
}

/// Envelope encryption over the in-memory provider
///
/// Data keys resolve through the provider by status: only Active keys
/// encrypt, Active and DecryptOnly keys decrypt.
pub struct EnvelopeEncryptor {
    provider: std::sync::Arc<InMemoryKmsProvider>,
}

impl EnvelopeEncryptor {
    /// Create an encryptor over a provider
    pub fn new(provider: std::sync::Arc<InMemoryKmsProvider>) -> Self {
        Self { provider }
    }

    /// Encrypt a field under the Active key for the purpose
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        purpose: Option<&str>,
        associated_data: Option<&[u8]>,
    ) -> Result<EncryptedData> {
        let (metadata, material) = self.provider.encryption_material(purpose).await?;

        let cipher = Aes256Gcm::new_from_slice(&material)
            .map_err(|_| DispatchError::internal("key material has the wrong length"))?;
        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let payload = Payload {
            msg: plaintext,
            aad: associated_data.unwrap_or(&[]),
        };
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), payload)
            .map_err(|_| DispatchError::internal("encryption failed"))?;

        Ok(EncryptedData {
            ciphertext,
            key_id: metadata.key_id,
            key_version: metadata.version,
            algorithm: KeyAlgorithm::Aes256Gcm,
            iv: iv.to_vec(),
            auth_tag: None,
            associated_data: associated_data.map(<[u8]>::to_vec),
            tenant_id: None,
            encrypted_at: Utc::now(),
        })
    }

    /// Decrypt a framed field
    pub async fn decrypt(&self, data: &EncryptedData) -> Result<Vec<u8>> {
        if data.iv.len() != IV_LEN {
            return Err(DispatchError::argument(
                "iv",
                format!("expected {} bytes, got {}", IV_LEN, data.iv.len()),
            ));
        }
        let material = self
            .provider
            .decryption_material(&data.key_id, data.key_version)
            .await?;

        let cipher = Aes256Gcm::new_from_slice(&material)
            .map_err(|_| DispatchError::internal("key material has the wrong length"))?;
        let payload = Payload {
            msg: &data.ciphertext,
            aad: data.associated_data.as_deref().unwrap_or(&[]),
        };
        cipher
            .decrypt(Nonce::from_slice(&data.iv), payload)
            .map_err(|_| DispatchError::internal("decryption failed or data was tampered"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::KmsProvider;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_round_trip_with_aad() {
        let provider = Arc::new(InMemoryKmsProvider::new());
        let encryptor = EnvelopeEncryptor::new(provider);

        let data = encryptor
            .encrypt(b"ssn=123-45-6789", None, Some(b"tenant-1"))
            .await
            .unwrap();
        let plaintext = encryptor.decrypt(&data).await.unwrap();
        assert_eq!(plaintext, b"ssn=123-45-6789");
    }

    #[tokio::test]
    async fn test_wrong_aad_fails() {
        let provider = Arc::new(InMemoryKmsProvider::new());
        let encryptor = EnvelopeEncryptor::new(provider);

        let mut data = encryptor
            .encrypt(b"secret", None, Some(b"tenant-1"))
            .await
            .unwrap();
        data.associated_data = Some(b"tenant-2".to_vec());
        assert!(encryptor.decrypt(&data).await.is_err());
    }

    #[tokio::test]
    async fn test_decrypt_only_key_still_decrypts() {
        let provider = Arc::new(InMemoryKmsProvider::new());
        let encryptor = EnvelopeEncryptor::new(provider.clone());

        let data = encryptor.encrypt(b"old data", None, None).await.unwrap();
        provider
            .rotate(&data.key_id, KeyAlgorithm::Aes256Gcm, None)
            .await
            .unwrap();

        // The old version is DecryptOnly now; decryption still works.
        let plaintext = encryptor.decrypt(&data).await.unwrap();
        assert_eq!(plaintext, b"old data");

        // New data encrypts under the new version.
        let fresh = encryptor.encrypt(b"new data", None, None).await.unwrap();
        assert_eq!(fresh.key_version, data.key_version + 1);
    }

    #[tokio::test]
    async fn test_framing_round_trip_and_magic() {
        let provider = Arc::new(InMemoryKmsProvider::new());
        let encryptor = EnvelopeEncryptor::new(provider);

        let data = encryptor
            .encrypt(b"payload", None, Some(b"aad"))
            .await
            .unwrap();
        let bytes = data.to_bytes();

        assert!(is_field_encrypted(&bytes));
        assert_eq!(&bytes[..4], &[0x45, 0x58, 0x43, 0x52]);
        assert!(!is_field_encrypted(b"plain text"));
        assert!(!is_field_encrypted(b"EX"));

        let parsed = EncryptedData::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.key_id, data.key_id);
        assert_eq!(parsed.key_version, data.key_version);
        assert_eq!(parsed.algorithm, data.algorithm);
        assert_eq!(parsed.iv, data.iv);
        assert_eq!(parsed.associated_data, data.associated_data);
        assert_eq!(parsed.ciphertext, data.ciphertext);
        assert_eq!(
            parsed.encrypted_at.timestamp_millis(),
            data.encrypted_at.timestamp_millis()
        );
    }

    #[test]
    fn test_truncated_frame_fails() {
        let err = EncryptedData::from_bytes(&[0x45, 0x58, 0x43, 0x52, 0, 0]).unwrap_err();
        assert_eq!(err.error_code(), "ARGUMENT_INVALID");
    }
}
