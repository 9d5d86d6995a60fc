//! Audit query model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use excalibur_types::TenantId;

use crate::event::{AuditEvent, AuditEventType, AuditOutcome, DataClassification};

/// Default page size
pub const DEFAULT_MAX_RESULTS: usize = 100;

/// Filter set for audit reads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditQuery {
    /// Inclusive lower bound on `timestamp_utc`
    pub start_date: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `timestamp_utc`
    pub end_date: Option<DateTime<Utc>>,
    /// Restrict to these event types
    pub event_types: Option<HashSet<AuditEventType>>,
    /// Restrict to these outcomes
    pub outcomes: Option<HashSet<AuditOutcome>>,
    /// Exact actor match
    pub actor_id: Option<String>,
    /// Exact resource match
    pub resource_id: Option<String>,
    /// Exact tenant match
    pub tenant_id: Option<TenantId>,
    /// Exact correlation match
    pub correlation_id: Option<String>,
    /// Exact action match
    pub action: Option<String>,
    /// Exact source IP match
    pub ip_address: Option<String>,
    /// Events classified at or above this level
    pub minimum_classification: Option<DataClassification>,
    /// Page size
    pub max_results: usize,
    /// Offset into the sorted result
    pub skip: usize,
    /// Sort newest-first (the default) or oldest-first
    pub sort_descending: bool,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            start_date: None,
            end_date: None,
            event_types: None,
            outcomes: None,
            actor_id: None,
            resource_id: None,
            tenant_id: None,
            correlation_id: None,
            action: None,
            ip_address: None,
            minimum_classification: None,
            max_results: DEFAULT_MAX_RESULTS,
            skip: 0,
            sort_descending: true,
        }
    }
}

impl AuditQuery {
    /// An unfiltered query with default pagination
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the query to a date range
    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }

    /// Restrict to event types
    pub fn with_event_types<I: IntoIterator<Item = AuditEventType>>(mut self, types: I) -> Self {
        self.event_types = Some(types.into_iter().collect());
        self
    }

    /// Restrict to outcomes
    pub fn with_outcomes<I: IntoIterator<Item = AuditOutcome>>(mut self, outcomes: I) -> Self {
        self.outcomes = Some(outcomes.into_iter().collect());
        self
    }

    /// Restrict to one actor
    pub fn by_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    /// Restrict to one tenant
    pub fn for_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Restrict to one correlation chain
    pub fn by_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Page the results
    pub fn page(mut self, skip: usize, max_results: usize) -> Self {
        self.skip = skip;
        self.max_results = max_results;
        self
    }

    /// True when the event passes every filter
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(start) = self.start_date {
            if event.timestamp_utc < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if event.timestamp_utc > end {
                return false;
            }
        }
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(outcomes) = &self.outcomes {
            if !outcomes.contains(&event.outcome) {
                return false;
            }
        }
        if let Some(actor_id) = &self.actor_id {
            if event.actor_id != *actor_id {
                return false;
            }
        }
        if let Some(resource_id) = &self.resource_id {
            if event.resource_id.as_deref() != Some(resource_id.as_str()) {
                return false;
            }
        }
        if let Some(tenant_id) = &self.tenant_id {
            if event.tenant_id.as_ref() != Some(tenant_id) {
                return false;
            }
        }
        if let Some(correlation_id) = &self.correlation_id {
            if event.correlation_id.as_deref() != Some(correlation_id.as_str()) {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if event.action != *action {
                return false;
            }
        }
        if let Some(ip_address) = &self.ip_address {
            if event.ip_address.as_deref() != Some(ip_address.as_str()) {
                return false;
            }
        }
        if let Some(minimum) = self.minimum_classification {
            match event.classification {
                Some(classification) if classification >= minimum => {}
                _ => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: AuditEventType, actor: &str) -> AuditEvent {
        AuditEvent::record(event_type, "Read", AuditOutcome::Success, actor)
    }

    #[test]
    fn test_type_and_actor_filters() {
        let query = AuditQuery::new()
            .with_event_types([AuditEventType::Security])
            .by_actor("u1");

        assert!(query.matches(&event(AuditEventType::Security, "u1")));
        assert!(!query.matches(&event(AuditEventType::Security, "u2")));
        assert!(!query.matches(&event(AuditEventType::DataAccess, "u1")));
    }

    #[test]
    fn test_minimum_classification_orders() {
        let query = AuditQuery {
            minimum_classification: Some(DataClassification::Confidential),
            ..AuditQuery::default()
        };

        let confidential = event(AuditEventType::DataAccess, "u1")
            .classified(DataClassification::Confidential);
        let restricted =
            event(AuditEventType::DataAccess, "u1").classified(DataClassification::Restricted);
        let internal =
            event(AuditEventType::DataAccess, "u1").classified(DataClassification::Internal);
        let unclassified = event(AuditEventType::DataAccess, "u1");

        assert!(query.matches(&confidential));
        assert!(query.matches(&restricted));
        assert!(!query.matches(&internal));
        assert!(!query.matches(&unclassified));
    }

    #[test]
    fn test_defaults() {
        let query = AuditQuery::default();
        assert_eq!(query.max_results, 100);
        assert_eq!(query.skip, 0);
        assert!(query.sort_descending);
    }
}
