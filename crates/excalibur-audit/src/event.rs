//! Audit event model and canonical encoding
//!
//! Every event commits to the previous event's hash, forming a per-tenant
//! append-only chain. The hash input is the canonical encoding: fields in
//! fixed order, UTF-8, explicit `null` for absent optionals, metadata keys
//! sorted lexicographically, timestamps as RFC 3339 with millisecond
//! precision. Hashes are SHA-256, lowercase hex.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use excalibur_types::{AuditEventId, TenantId};

/// Category of an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEventType {
    /// Runtime lifecycle events
    System,
    /// Sign-in and credential events
    Authentication,
    /// Access decisions
    Authorization,
    /// Reads of regulated data
    DataAccess,
    /// Writes of regulated data
    DataModification,
    /// Configuration changes
    ConfigurationChange,
    /// Security-relevant events
    Security,
    /// Compliance process events
    Compliance,
    /// Administrative actions
    Administrative,
    /// Cross-system integration events
    Integration,
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::System => "System",
            Self::Authentication => "Authentication",
            Self::Authorization => "Authorization",
            Self::DataAccess => "DataAccess",
            Self::DataModification => "DataModification",
            Self::ConfigurationChange => "ConfigurationChange",
            Self::Security => "Security",
            Self::Compliance => "Compliance",
            Self::Administrative => "Administrative",
            Self::Integration => "Integration",
        };
        write!(f, "{}", name)
    }
}

/// Result of the audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditOutcome {
    /// The action succeeded
    Success,
    /// The action failed
    Failure,
    /// The action was denied by policy
    Denied,
    /// The action raised an unexpected error
    Error,
    /// The action is still in flight
    Pending,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::Denied => "Denied",
            Self::Error => "Error",
            Self::Pending => "Pending",
        };
        write!(f, "{}", name)
    }
}

/// Data sensitivity, ordered from least to most sensitive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataClassification {
    /// Freely shareable
    Public,
    /// Internal use
    Internal,
    /// Restricted distribution
    Confidential,
    /// Highest sensitivity
    Restricted,
}

impl fmt::Display for DataClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Public => "Public",
            Self::Internal => "Internal",
            Self::Confidential => "Confidential",
            Self::Restricted => "Restricted",
        };
        write!(f, "{}", name)
    }
}

/// A tamper-evident audit event
///
/// `event_id`, `timestamp_utc`, `sequence_number`, and both hashes are
/// assigned by the journal on append; values set by the producer are
/// overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Sortable event identity, assigned on append
    pub event_id: AuditEventId,
    /// Event category
    pub event_type: AuditEventType,
    /// Short verb describing the action
    pub action: String,
    /// Result of the action
    pub outcome: AuditOutcome,
    /// Trusted append time (UTC)
    pub timestamp_utc: DateTime<Utc>,
    /// Acting principal
    pub actor_id: String,
    /// Human-readable actor name
    pub actor_name: Option<String>,
    /// Acted-on resource identity
    pub resource_id: Option<String>,
    /// Acted-on resource type
    pub resource_type: Option<String>,
    /// Tenant the event belongs to; also the chain the event joins
    pub tenant_id: Option<TenantId>,
    /// Session identifier
    pub session_id: Option<String>,
    /// Source IP
    pub ip_address: Option<String>,
    /// Source user agent
    pub user_agent: Option<String>,
    /// Sensitivity of the touched data
    pub classification: Option<DataClassification>,
    /// Correlation chain identifier
    pub correlation_id: Option<String>,
    /// Free-form reason
    pub reason: Option<String>,
    /// Small string map; keys hash in lexicographic order
    pub metadata: BTreeMap<String, String>,
    /// Position in the tenant chain, assigned on append
    pub sequence_number: u64,
    /// Hash of the previous event in the tenant chain
    pub previous_event_hash: Option<String>,
    /// This event's hash over the canonical encoding plus the previous hash
    pub event_hash: Option<String>,
}

impl AuditEvent {
    /// Start an event with the required fields
    pub fn record(
        event_type: AuditEventType,
        action: impl Into<String>,
        outcome: AuditOutcome,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            event_id: AuditEventId::new(),
            event_type,
            action: action.into(),
            outcome,
            timestamp_utc: Utc::now(),
            actor_id: actor_id.into(),
            actor_name: None,
            resource_id: None,
            resource_type: None,
            tenant_id: None,
            session_id: None,
            ip_address: None,
            user_agent: None,
            classification: None,
            correlation_id: None,
            reason: None,
            metadata: BTreeMap::new(),
            sequence_number: 0,
            previous_event_hash: None,
            event_hash: None,
        }
    }

    /// Set the tenant (selects the chain)
    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Set the resource
    pub fn resource(mut self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Set the classification
    pub fn classified(mut self, classification: DataClassification) -> Self {
        self.classification = Some(classification);
        self
    }

    /// Set the correlation id
    pub fn correlated(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the reason
    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach one metadata entry
    pub fn meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Canonical encoding used as the hash input
    ///
    /// Field order is fixed; absent optionals encode as the literal
    /// `null`; metadata iterates in key order (the backing map is
    /// ordered); timestamps are RFC 3339 with millisecond precision.
    pub fn canonical_encoding(&self) -> String {
        let mut out = String::with_capacity(256);
        push_field(&mut out, "event_id", &self.event_id.to_string());
        push_field(&mut out, "event_type", &self.event_type.to_string());
        push_field(&mut out, "action", &self.action);
        push_field(&mut out, "outcome", &self.outcome.to_string());
        push_field(
            &mut out,
            "timestamp_utc",
            &self
                .timestamp_utc
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        push_field(&mut out, "actor_id", &self.actor_id);
        push_optional(&mut out, "actor_name", self.actor_name.as_deref());
        push_optional(&mut out, "resource_id", self.resource_id.as_deref());
        push_optional(&mut out, "resource_type", self.resource_type.as_deref());
        push_optional(
            &mut out,
            "tenant_id",
            self.tenant_id.as_ref().map(|t| t.to_string()).as_deref(),
        );
        push_optional(&mut out, "session_id", self.session_id.as_deref());
        push_optional(&mut out, "ip_address", self.ip_address.as_deref());
        push_optional(&mut out, "user_agent", self.user_agent.as_deref());
        push_optional(
            &mut out,
            "classification",
            self.classification.map(|c| c.to_string()).as_deref(),
        );
        push_optional(&mut out, "correlation_id", self.correlation_id.as_deref());
        push_optional(&mut out, "reason", self.reason.as_deref());
        for (key, value) in &self.metadata {
            push_field(&mut out, &format!("metadata.{}", key), value);
        }
        push_field(&mut out, "sequence_number", &self.sequence_number.to_string());
        out
    }

    /// Compute this event's hash over the canonical encoding and the
    /// given previous hash
    pub fn compute_hash(&self, previous_event_hash: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_encoding().as_bytes());
        hasher.update(previous_event_hash.unwrap_or("").as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn push_field(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push('=');
    out.push_str(value);
    out.push('\n');
}

fn push_optional(out: &mut String, name: &str, value: Option<&str>) {
    match value {
        Some(value) => push_field(out, name, value),
        None => push_field(out, name, "null"),
    }
}
