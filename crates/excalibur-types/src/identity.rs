//! Identity types for Excalibur
//!
//! All identity types are strongly typed wrappers to prevent accidental
//! mixing of different ID types. Two families exist: sortable ULID-backed
//! ids for anything that must be monotonically orderable (messages, audit
//! events) and random UUID-backed ids for everything else.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;
use uuid::Uuid;

/// Macro to generate UUID-backed ID types with common implementations
macro_rules! define_id_type {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from a string (with or without prefix)
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                let s = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Get the inner UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

/// Macro to generate ULID-backed ID types, monotonically sortable by
/// creation time
macro_rules! define_sortable_id_type {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            /// Create a new ID stamped with the current time
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse from the canonical 26-character string form
            pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
                Ok(Self(Ulid::from_string(s)?))
            }

            /// Get the inner ULID
            pub fn as_ulid(&self) -> &Ulid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Ulid::from_string(&s).map(Self).map_err(serde::de::Error::custom)
            }
        }
    };
}

// Sortable identity types
define_sortable_id_type!(MessageId, "Unique identifier for a dispatched message, sortable by creation time");
define_sortable_id_type!(AuditEventId, "Unique identifier for an audit event, sortable by append time");

// Operational identity types
define_id_type!(SagaId, "saga", "Unique identifier for a saga instance");
define_id_type!(TimeoutId, "timeout", "Unique identifier for a scheduled saga timeout");
define_id_type!(TenantId, "tenant", "Unique identifier for a tenant");
define_id_type!(MigrationId, "migration", "Unique identifier for a key migration run");
define_id_type!(EscrowId, "escrow", "Unique identifier for a key escrow record");
define_id_type!(RecoveryTokenId, "rtoken", "Unique identifier for a key recovery token");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_sort_by_creation() {
        let a = MessageId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = MessageId::new();
        assert!(a < b);
    }

    #[test]
    fn test_saga_id_round_trip() {
        let id = SagaId::new();
        let parsed = SagaId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_message_id_serde_round_trip() {
        let id = MessageId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
