//! Key escrow and split-knowledge recovery
//!
//! Escrowed key material is reconstructable from a threshold number of
//! recovery tokens. Combination is all-or-nothing: every precondition
//! violation raises an argument error with a specific message. Backup
//! shares follow the same arithmetic with their own expiration semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use excalibur_types::{DispatchError, EscrowId, RecoveryTokenId, Result};

/// Share index marking a combined token
pub const COMBINED_SHARE_INDEX: u32 = 0;

/// Escrow record lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowState {
    /// Recoverable
    Active,
    /// Key material was reconstructed
    Recovered,
    /// Recovery window elapsed
    Expired,
    /// Withdrawn by an operator
    Revoked,
}

/// Status of one escrow record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowStatus {
    /// Escrowed key family
    pub key_id: String,
    /// Escrow identity
    pub escrow_id: EscrowId,
    /// Lifecycle state
    pub state: EscrowState,
    /// When the material was escrowed
    pub escrowed_at: DateTime<Utc>,
    /// Recovery window end, when bounded
    pub expires_at: Option<DateTime<Utc>>,
    /// Tokens still outstanding
    pub active_token_count: u32,
    /// Recovery attempts made
    pub recovery_attempts: u32,
    /// When recovery was last attempted
    pub last_recovery_attempt: Option<DateTime<Utc>>,
    /// Tenant the escrow belongs to
    pub tenant_id: Option<String>,
    /// Purpose of the escrowed key
    pub purpose: Option<String>,
}

impl EscrowStatus {
    /// Active and within its window
    pub fn is_recoverable(&self, now: DateTime<Utc>) -> bool {
        self.state == EscrowState::Active
            && self.expires_at.map_or(true, |expires| expires > now)
    }
}

/// One share of escrowed key material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryToken {
    /// Token identity
    pub token_id: RecoveryTokenId,
    /// Escrowed key family
    pub key_id: String,
    /// Escrow this token belongs to
    pub escrow_id: EscrowId,
    /// Position of this share; 0 marks a combined token
    pub share_index: u32,
    /// Share material
    pub share_data: Vec<u8>,
    /// Total shares issued
    pub total_shares: u32,
    /// Shares required to reconstruct
    pub threshold: u32,
    /// Issue time
    pub created_at: DateTime<Utc>,
    /// Share expiry, when bounded
    pub expires_at: Option<DateTime<Utc>>,
    /// Custodian holding this share
    pub custodian_id: Option<String>,
}

/// One share of a key backup, same arithmetic as recovery tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupShare {
    /// Share identity
    pub share_id: RecoveryTokenId,
    /// Backed-up key family
    pub key_id: String,
    /// Position of this share; 0 marks a combined share
    pub share_index: u32,
    /// Share material
    pub share_data: Vec<u8>,
    /// Total shares issued
    pub total_shares: u32,
    /// Shares required to reconstruct
    pub threshold: u32,
    /// Issue time
    pub created_at: DateTime<Utc>,
    /// Backup shares expire independently of any escrow window
    pub expires_at: Option<DateTime<Utc>>,
}

/// Deterministically fold share material in index order
fn fold_shares(shares: &[(u32, &[u8])]) -> Vec<u8> {
    let mut ordered: Vec<&(u32, &[u8])> = shares.iter().collect();
    ordered.sort_by_key(|(index, _)| *index);
    let mut hasher = Sha256::new();
    for (index, data) in ordered {
        hasher.update(index.to_be_bytes());
        hasher.update(data);
    }
    hasher.finalize().to_vec()
}

/// Combine recovery tokens into a single reconstruction token
///
/// All tokens must share the same escrow, key, and threshold; at least
/// `threshold` tokens are required, share indexes must be distinct, and
/// no token may be expired. The combined token carries `share_index = 0`
/// and the minimum `expires_at` of its inputs.
pub fn combine_recovery_tokens(
    tokens: &[RecoveryToken],
    now: DateTime<Utc>,
) -> Result<RecoveryToken> {
    let first = tokens.first().ok_or_else(|| {
        DispatchError::argument("tokens", "at least one recovery token is required")
    })?;

    if tokens.iter().any(|t| t.escrow_id != first.escrow_id) {
        return Err(DispatchError::argument(
            "tokens",
            "all tokens must belong to the same escrow",
        ));
    }
    if tokens.iter().any(|t| t.key_id != first.key_id) {
        return Err(DispatchError::argument(
            "tokens",
            "all tokens must reference the same key",
        ));
    }
    if tokens.iter().any(|t| t.threshold != first.threshold) {
        return Err(DispatchError::argument(
            "tokens",
            "all tokens must agree on the threshold",
        ));
    }
    if (tokens.len() as u32) < first.threshold {
        return Err(DispatchError::argument(
            "tokens",
            format!(
                "{} tokens provided but the threshold is {}",
                tokens.len(),
                first.threshold
            ),
        ));
    }
    let mut seen = HashSet::new();
    for token in tokens {
        if !seen.insert(token.share_index) {
            return Err(DispatchError::argument(
                "tokens",
                format!("duplicate share index {}", token.share_index),
            ));
        }
    }
    if let Some(expired) = tokens
        .iter()
        .find(|t| t.expires_at.is_some_and(|expires| expires <= now))
    {
        return Err(DispatchError::argument(
            "tokens",
            format!("recovery token {} has expired", expired.token_id),
        ));
    }

    let shares: Vec<(u32, &[u8])> = tokens
        .iter()
        .map(|t| (t.share_index, t.share_data.as_slice()))
        .collect();
    let expires_at = tokens.iter().filter_map(|t| t.expires_at).min();

    Ok(RecoveryToken {
        token_id: RecoveryTokenId::new(),
        key_id: first.key_id.clone(),
        escrow_id: first.escrow_id.clone(),
        share_index: COMBINED_SHARE_INDEX,
        share_data: fold_shares(&shares),
        total_shares: first.total_shares,
        threshold: first.threshold,
        created_at: now,
        expires_at,
        custodian_id: None,
    })
}

/// Combine backup shares; same preconditions, backup-specific messages
pub fn combine_backup_shares(shares: &[BackupShare], now: DateTime<Utc>) -> Result<BackupShare> {
    let first = shares.first().ok_or_else(|| {
        DispatchError::argument("shares", "at least one backup share is required")
    })?;

    if shares.iter().any(|s| s.key_id != first.key_id) {
        return Err(DispatchError::argument(
            "shares",
            "all backup shares must reference the same key",
        ));
    }
    if shares.iter().any(|s| s.threshold != first.threshold) {
        return Err(DispatchError::argument(
            "shares",
            "all backup shares must agree on the threshold",
        ));
    }
    if (shares.len() as u32) < first.threshold {
        return Err(DispatchError::argument(
            "shares",
            format!(
                "{} backup shares provided but the threshold is {}",
                shares.len(),
                first.threshold
            ),
        ));
    }
    let mut seen = HashSet::new();
    for share in shares {
        if !seen.insert(share.share_index) {
            return Err(DispatchError::argument(
                "shares",
                format!("duplicate backup share index {}", share.share_index),
            ));
        }
    }
    if let Some(expired) = shares
        .iter()
        .find(|s| s.expires_at.is_some_and(|expires| expires <= now))
    {
        return Err(DispatchError::argument(
            "shares",
            format!("backup share {} has expired", expired.share_id),
        ));
    }

    let folded: Vec<(u32, &[u8])> = shares
        .iter()
        .map(|s| (s.share_index, s.share_data.as_slice()))
        .collect();

    Ok(BackupShare {
        share_id: RecoveryTokenId::new(),
        key_id: first.key_id.clone(),
        share_index: COMBINED_SHARE_INDEX,
        share_data: fold_shares(&folded),
        total_shares: first.total_shares,
        threshold: first.threshold,
        created_at: now,
        expires_at: shares.iter().filter_map(|s| s.expires_at).min(),
    })
}

/// Escrow record keeper
///
/// Issues tokens for a key, tracks recovery attempts, and answers status
/// queries.
#[derive(Default)]
pub struct KeyEscrowService {
    escrows: Arc<RwLock<HashMap<EscrowId, EscrowStatus>>>,
}

impl KeyEscrowService {
    /// Create an empty service
    pub fn new() -> Self {
        Self::default()
    }

    /// Escrow a key into `total_shares` tokens requiring `threshold`
    pub async fn create_escrow(
        &self,
        key_id: impl Into<String>,
        total_shares: u32,
        threshold: u32,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(EscrowStatus, Vec<RecoveryToken>)> {
        if threshold == 0 || threshold > total_shares {
            return Err(DispatchError::argument(
                "threshold",
                format!(
                    "threshold must be in 1..={}, got {}",
                    total_shares, threshold
                ),
            ));
        }
        let key_id = key_id.into();
        let now = Utc::now();
        let escrow_id = EscrowId::new();

        let tokens: Vec<RecoveryToken> = (1..=total_shares)
            .map(|index| RecoveryToken {
                token_id: RecoveryTokenId::new(),
                key_id: key_id.clone(),
                escrow_id: escrow_id.clone(),
                share_index: index,
                share_data: {
                    let mut hasher = Sha256::new();
                    hasher.update(escrow_id.to_string().as_bytes());
                    hasher.update(index.to_be_bytes());
                    hasher.finalize().to_vec()
                },
                total_shares,
                threshold,
                created_at: now,
                expires_at,
                custodian_id: None,
            })
            .collect();

        let status = EscrowStatus {
            key_id,
            escrow_id: escrow_id.clone(),
            state: EscrowState::Active,
            escrowed_at: now,
            expires_at,
            active_token_count: total_shares,
            recovery_attempts: 0,
            last_recovery_attempt: None,
            tenant_id: None,
            purpose: None,
        };
        self.escrows
            .write()
            .await
            .insert(escrow_id, status.clone());
        info!(escrow_id = %status.escrow_id, key_id = %status.key_id, "key escrowed");
        Ok((status, tokens))
    }

    /// Current status of an escrow
    pub async fn status(&self, escrow_id: &EscrowId) -> Result<EscrowStatus> {
        self.escrows
            .read()
            .await
            .get(escrow_id)
            .cloned()
            .ok_or_else(|| {
                DispatchError::argument("escrow_id", format!("unknown escrow {}", escrow_id))
            })
    }

    /// Attempt recovery with a set of tokens
    ///
    /// Every attempt is counted, successful or not.
    pub async fn recover(&self, tokens: &[RecoveryToken]) -> Result<RecoveryToken> {
        let now = Utc::now();
        let escrow_id = tokens
            .first()
            .map(|t| t.escrow_id.clone())
            .ok_or_else(|| {
                DispatchError::argument("tokens", "at least one recovery token is required")
            })?;

        let mut escrows = self.escrows.write().await;
        let status = escrows.get_mut(&escrow_id).ok_or_else(|| {
            DispatchError::argument("escrow_id", format!("unknown escrow {}", escrow_id))
        })?;

        status.recovery_attempts += 1;
        status.last_recovery_attempt = Some(now);

        if !status.is_recoverable(now) {
            return Err(DispatchError::argument(
                "escrow_id",
                format!("escrow {} is not recoverable", escrow_id),
            ));
        }

        let combined = combine_recovery_tokens(tokens, now)?;
        status.state = EscrowState::Recovered;
        info!(escrow_id = %escrow_id, "escrowed key recovered");
        Ok(combined)
    }

    /// Revoke an escrow
    pub async fn revoke(&self, escrow_id: &EscrowId) -> Result<()> {
        let mut escrows = self.escrows.write().await;
        let status = escrows.get_mut(escrow_id).ok_or_else(|| {
            DispatchError::argument("escrow_id", format!("unknown escrow {}", escrow_id))
        })?;
        status.state = EscrowState::Revoked;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tokens(count: u32, threshold: u32) -> Vec<RecoveryToken> {
        let escrow_id = EscrowId::new();
        (1..=count)
            .map(|index| RecoveryToken {
                token_id: RecoveryTokenId::new(),
                key_id: "excalibur-dispatch/default-01".to_string(),
                escrow_id: escrow_id.clone(),
                share_index: index,
                share_data: vec![index as u8; 32],
                total_shares: count,
                threshold,
                created_at: Utc::now(),
                expires_at: Some(Utc::now() + Duration::hours(index as i64)),
                custodian_id: None,
            })
            .collect()
    }

    #[test]
    fn test_combined_token_shape() {
        let input = tokens(3, 2);
        let combined = combine_recovery_tokens(&input, Utc::now()).unwrap();

        assert_eq!(combined.share_index, COMBINED_SHARE_INDEX);
        // Minimum of the input expirations (share 1 expires first).
        assert_eq!(combined.expires_at, input[0].expires_at);
        assert_eq!(combined.threshold, 2);
        assert!(!combined.share_data.is_empty());
    }

    #[test]
    fn test_below_threshold_fails() {
        let input = tokens(3, 3);
        let err = combine_recovery_tokens(&input[..2], Utc::now()).unwrap_err();
        assert!(err.to_string().contains("threshold"));
    }

    #[test]
    fn test_duplicate_share_index_fails() {
        let mut input = tokens(3, 2);
        input[1].share_index = input[0].share_index;
        let err = combine_recovery_tokens(&input, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("duplicate share index"));
    }

    #[test]
    fn test_mismatched_escrow_fails() {
        let mut input = tokens(3, 2);
        input[2].escrow_id = EscrowId::new();
        let err = combine_recovery_tokens(&input, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("same escrow"));
    }

    #[test]
    fn test_expired_token_fails() {
        let mut input = tokens(3, 2);
        input[0].expires_at = Some(Utc::now() - Duration::seconds(1));
        let err = combine_recovery_tokens(&input, Utc::now()).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_combination_is_order_independent() {
        let input = tokens(3, 3);
        let forward = combine_recovery_tokens(&input, Utc::now()).unwrap();
        let mut reversed = input.clone();
        reversed.reverse();
        let backward = combine_recovery_tokens(&reversed, Utc::now()).unwrap();
        assert_eq!(forward.share_data, backward.share_data);
    }

    #[tokio::test]
    async fn test_escrow_lifecycle() {
        let service = KeyEscrowService::new();
        let (status, issued) = service
            .create_escrow("excalibur-dispatch/default-01", 5, 3, None)
            .await
            .unwrap();
        assert_eq!(status.state, EscrowState::Active);
        assert_eq!(status.active_token_count, 5);
        assert_eq!(issued.len(), 5);
        assert!(status.is_recoverable(Utc::now()));

        let combined = service.recover(&issued[..3]).await.unwrap();
        assert_eq!(combined.share_index, COMBINED_SHARE_INDEX);

        let after = service.status(&status.escrow_id).await.unwrap();
        assert_eq!(after.state, EscrowState::Recovered);
        assert_eq!(after.recovery_attempts, 1);
        assert!(!after.is_recoverable(Utc::now()));
    }

    #[tokio::test]
    async fn test_failed_recovery_still_counts_attempt() {
        let service = KeyEscrowService::new();
        let (status, issued) = service
            .create_escrow("excalibur-dispatch/default-01", 3, 3, None)
            .await
            .unwrap();

        assert!(service.recover(&issued[..2]).await.is_err());
        let after = service.status(&status.escrow_id).await.unwrap();
        assert_eq!(after.recovery_attempts, 1);
        assert_eq!(after.state, EscrowState::Active);
    }

    #[test]
    fn test_backup_share_combination() {
        let shares: Vec<BackupShare> = (1..=3u32)
            .map(|index| BackupShare {
                share_id: RecoveryTokenId::new(),
                key_id: "excalibur-dispatch/default-01".to_string(),
                share_index: index,
                share_data: vec![index as u8; 32],
                total_shares: 3,
                threshold: 2,
                created_at: Utc::now(),
                expires_at: None,
            })
            .collect();

        let combined = combine_backup_shares(&shares, Utc::now()).unwrap();
        assert_eq!(combined.share_index, COMBINED_SHARE_INDEX);
        assert_eq!(combined.expires_at, None);
    }
}
