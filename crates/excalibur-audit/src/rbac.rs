//! Role-based access control over audit reads
//!
//! Writes pass through unrestricted; reads are gated by role. The
//! security-analyst role sees only authentication, authorization, and
//! security events; its queries have that set intersected in, and
//! `get_by_id` answers `None` (not an error) for filtered-out events.
//! Every permitted read emits a meta-audit record; meta-audit failures
//! are logged and never block the primary read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use excalibur_types::{AuditEventId, DispatchError, Result, TenantId};

use crate::event::{AuditEvent, AuditEventType, AuditOutcome};
use crate::journal::{AuditIntegrityResult, AuditJournal};
use crate::query::AuditQuery;

/// Reader roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditRole {
    /// No access
    None,
    /// No access; developers read application logs, not the audit trail
    Developer,
    /// Security-scoped read access
    SecurityAnalyst,
    /// Full read access including integrity verification
    ComplianceOfficer,
    /// Full read access including integrity verification
    Administrator,
}

impl AuditRole {
    fn display(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Developer => "Developer",
            Self::SecurityAnalyst => "SecurityAnalyst",
            Self::ComplianceOfficer => "ComplianceOfficer",
            Self::Administrator => "Administrator",
        }
    }

    /// Event types visible to this role, when restricted
    fn visible_types(&self) -> Option<HashSet<AuditEventType>> {
        match self {
            Self::SecurityAnalyst => Some(HashSet::from([
                AuditEventType::Authentication,
                AuditEventType::Authorization,
                AuditEventType::Security,
            ])),
            _ => None,
        }
    }

    fn can_read(&self) -> bool {
        !matches!(self, Self::None | Self::Developer)
    }

    fn can_verify(&self) -> bool {
        matches!(self, Self::ComplianceOfficer | Self::Administrator)
    }
}

/// RBAC wrapper around a journal
pub struct RbacAuditJournal {
    inner: Arc<dyn AuditJournal>,
    role: AuditRole,
}

impl RbacAuditJournal {
    /// Wrap a journal for reads under the given role
    pub fn new(inner: Arc<dyn AuditJournal>, role: AuditRole) -> Self {
        Self { inner, role }
    }

    /// The wrapped role
    pub fn role(&self) -> AuditRole {
        self.role
    }

    fn denied(&self, operation: &str) -> DispatchError {
        DispatchError::AuditAccessDenied {
            role: self.role.display().to_string(),
            operation: operation.to_string(),
        }
    }

    /// Emit the meta-audit record for a read; never fails the read
    async fn meta_audit(&self, operation: &str, outcome: AuditOutcome) {
        let record = AuditEvent::record(
            AuditEventType::DataAccess,
            format!("AuditLog.{}", operation),
            outcome,
            format!("role:{}", self.role.display()),
        );
        if let Err(err) = self.inner.append(record).await {
            warn!(operation, error = %err, "meta-audit append failed");
        }
    }

    /// Intersect the role's visible types into a query
    fn restrict(&self, query: &AuditQuery) -> AuditQuery {
        let mut restricted = query.clone();
        if let Some(visible) = self.role.visible_types() {
            restricted.event_types = Some(match &query.event_types {
                Some(requested) => requested.intersection(&visible).copied().collect(),
                None => visible,
            });
        }
        restricted
    }

    /// Append passes straight through; writes are unrestricted
    pub async fn append(&self, event: AuditEvent) -> Result<AuditEventId> {
        self.inner.append(event).await
    }

    /// Role-gated `get_by_id`
    ///
    /// Events outside the role's visible types answer `None`.
    pub async fn get_by_id(&self, event_id: &AuditEventId) -> Result<Option<AuditEvent>> {
        if !self.role.can_read() {
            return Err(self.denied("GetById"));
        }
        let found = self.inner.get_by_id(event_id).await?;
        let filtered = match (&found, self.role.visible_types()) {
            (Some(event), Some(visible)) if !visible.contains(&event.event_type) => None,
            _ => found,
        };
        self.meta_audit("GetById", AuditOutcome::Success).await;
        Ok(filtered)
    }

    /// Role-gated query with type intersection
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        if !self.role.can_read() {
            return Err(self.denied("Query"));
        }
        let restricted = self.restrict(query);
        let result = self.inner.query(&restricted).await?;
        self.meta_audit("Query", AuditOutcome::Success).await;
        Ok(result)
    }

    /// Role-gated count with type intersection
    pub async fn count(&self, query: &AuditQuery) -> Result<u64> {
        if !self.role.can_read() {
            return Err(self.denied("Count"));
        }
        let restricted = self.restrict(query);
        let result = self.inner.count(&restricted).await?;
        self.meta_audit("Count", AuditOutcome::Success).await;
        Ok(result)
    }

    /// Role-gated `get_last`
    pub async fn get_last(&self, tenant_id: Option<&TenantId>) -> Result<Option<AuditEvent>> {
        if !self.role.can_read() {
            return Err(self.denied("GetLast"));
        }
        let result = self.inner.get_last(tenant_id).await?;
        self.meta_audit("GetLast", AuditOutcome::Success).await;
        Ok(result)
    }

    /// Integrity verification; compliance officers and administrators only
    pub async fn verify_chain(
        &self,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Result<AuditIntegrityResult> {
        if !self.role.can_verify() {
            return Err(self.denied("VerifyChain"));
        }
        let result = self.inner.verify_chain(start_date, end_date).await?;
        self.meta_audit("VerifyChain", AuditOutcome::Success).await;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::InMemoryAuditJournal;

    async fn seeded_journal() -> Arc<InMemoryAuditJournal> {
        let journal = Arc::new(InMemoryAuditJournal::new());
        for event_type in [
            AuditEventType::Security,
            AuditEventType::DataAccess,
            AuditEventType::Authentication,
        ] {
            journal
                .append(AuditEvent::record(
                    event_type,
                    "Probe",
                    AuditOutcome::Success,
                    "seed",
                ))
                .await
                .unwrap();
        }
        journal
    }

    #[tokio::test]
    async fn test_none_and_developer_are_denied() {
        let journal = seeded_journal().await;
        for role in [AuditRole::None, AuditRole::Developer] {
            let rbac = RbacAuditJournal::new(journal.clone(), role);
            assert!(rbac.query(&AuditQuery::new()).await.is_err());
            assert!(rbac.count(&AuditQuery::new()).await.is_err());
            assert!(rbac.get_last(None).await.is_err());
            assert!(rbac
                .verify_chain(Utc::now() - chrono::Duration::hours(1), Utc::now())
                .await
                .is_err());
        }
    }

    #[tokio::test]
    async fn test_analyst_query_intersects_requested_types() {
        let journal = seeded_journal().await;
        let rbac = RbacAuditJournal::new(journal.clone(), AuditRole::SecurityAnalyst);

        // The analyst asks for Security and DataAccess; only Security survives.
        let query = AuditQuery::new()
            .with_event_types([AuditEventType::Security, AuditEventType::DataAccess]);
        let events = rbac.query(&query).await.unwrap();
        assert!(!events.is_empty());
        assert!(events
            .iter()
            .all(|e| e.event_type == AuditEventType::Security));
    }

    #[tokio::test]
    async fn test_analyst_unfiltered_query_sees_only_visible_types() {
        let journal = seeded_journal().await;
        let rbac = RbacAuditJournal::new(journal.clone(), AuditRole::SecurityAnalyst);

        let events = rbac.query(&AuditQuery::new()).await.unwrap();
        let types: HashSet<_> = events.iter().map(|e| e.event_type).collect();
        assert!(!types.contains(&AuditEventType::DataAccess));
        assert!(types.contains(&AuditEventType::Security));
        assert!(types.contains(&AuditEventType::Authentication));
    }

    #[tokio::test]
    async fn test_analyst_get_by_id_returns_none_for_hidden_event() {
        let journal = Arc::new(InMemoryAuditJournal::new());
        let hidden = journal
            .append(AuditEvent::record(
                AuditEventType::DataAccess,
                "Read",
                AuditOutcome::Success,
                "u1",
            ))
            .await
            .unwrap();
        let visible = journal
            .append(AuditEvent::record(
                AuditEventType::Security,
                "Alert",
                AuditOutcome::Success,
                "u1",
            ))
            .await
            .unwrap();

        let rbac = RbacAuditJournal::new(journal.clone(), AuditRole::SecurityAnalyst);
        assert!(rbac.get_by_id(&hidden).await.unwrap().is_none());
        assert!(rbac.get_by_id(&visible).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_analyst_cannot_verify_but_officer_can() {
        let journal = seeded_journal().await;
        let analyst = RbacAuditJournal::new(journal.clone(), AuditRole::SecurityAnalyst);
        assert!(analyst
            .verify_chain(Utc::now() - chrono::Duration::hours(1), Utc::now())
            .await
            .is_err());

        let officer = RbacAuditJournal::new(journal.clone(), AuditRole::ComplianceOfficer);
        let result = officer
            .verify_chain(
                Utc::now() - chrono::Duration::hours(1),
                Utc::now() + chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert!(result.is_valid);
    }

    #[tokio::test]
    async fn test_reads_emit_meta_audit_records() {
        let journal = seeded_journal().await;
        let before = journal.count(&AuditQuery::new()).await.unwrap();

        let rbac = RbacAuditJournal::new(journal.clone(), AuditRole::Administrator);
        let result = rbac.query(&AuditQuery::new()).await.unwrap();
        assert!(!result.is_empty());

        let after_query = AuditQuery::new().by_actor("role:Administrator");
        let meta = journal.query(&after_query).await.unwrap();
        assert_eq!(meta.len(), 1);
        assert_eq!(meta[0].action, "AuditLog.Query");
        assert_eq!(meta[0].event_type, AuditEventType::DataAccess);
        assert_eq!(journal.count(&AuditQuery::new()).await.unwrap(), before + 1);
    }
}
