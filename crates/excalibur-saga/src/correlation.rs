//! Correlation key resolution
//!
//! Given a saga type and an arbitrary message, produce the correlation
//! string routing the message to a saga instance. Resolution order per
//! message type, stopping at the first match:
//!
//! 1. An explicit rule registered for `(saga type, message type)`:
//!    a single accessor or a composite joined with `|`
//! 2. A key the message type itself declares ([`CorrelationKeyed`]),
//!    registered once per type and cached
//! 3. The convention field `SagaId`
//! 4. The convention field `CorrelationId`
//!
//! A null or missing property fails that accessor. Re-registering a rule
//! for the same pair is a programming error.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use excalibur_types::{DispatchError, DispatchMessage, DynMessage, Result};

/// Canonical separator joining composite key parts
pub const COMPOSITE_KEY_SEPARATOR: &str = "|";

/// Convention field names, tried in order; the serde snake_case spelling
/// of each is accepted as the same convention
const SAGA_ID_CONVENTIONS: [&str; 2] = ["SagaId", "saga_id"];
const CORRELATION_ID_CONVENTIONS: [&str; 2] = ["CorrelationId", "correlation_id"];

/// Implemented by messages that declare their own correlation key
pub trait CorrelationKeyed {
    /// The key, or `None` when this message cannot be correlated
    fn correlation_key(&self) -> Option<String>;
}

/// An explicit correlation rule: ordered property accessors
#[derive(Debug, Clone)]
pub struct CorrelationRule {
    /// Top-level property names read from the message's JSON form
    pub accessors: Vec<String>,
    /// Require every accessor to produce a value (default true)
    pub require_all_properties: bool,
}

impl CorrelationRule {
    /// A rule reading a single property
    pub fn property(name: impl Into<String>) -> Self {
        Self {
            accessors: vec![name.into()],
            require_all_properties: true,
        }
    }

    /// A composite rule joining several properties with `|`
    pub fn composite<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            accessors: names.into_iter().map(Into::into).collect(),
            require_all_properties: true,
        }
    }

    /// Allow individual accessors to be absent
    pub fn allow_missing(mut self) -> Self {
        self.require_all_properties = false;
        self
    }

    fn apply(&self, body: &serde_json::Value) -> Option<String> {
        let mut parts = Vec::with_capacity(self.accessors.len());
        for accessor in &self.accessors {
            match read_property(body, accessor) {
                Some(value) => parts.push(value),
                None if self.require_all_properties => return None,
                None => {}
            }
        }
        if parts.is_empty() {
            return None;
        }
        Some(parts.join(COMPOSITE_KEY_SEPARATOR))
    }
}

/// Read a top-level property as a correlation string
///
/// Strings pass through; numbers stringify; null and missing fail.
fn read_property(body: &serde_json::Value, name: &str) -> Option<String> {
    match body.get(name) {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

type Extractor = Arc<dyn Fn(&DynMessage) -> Option<String> + Send + Sync>;

/// Resolves correlation keys for saga routing
#[derive(Default)]
pub struct CorrelationResolver {
    rules: RwLock<HashMap<(String, &'static str), CorrelationRule>>,
    extractors: RwLock<HashMap<TypeId, Extractor>>,
}

impl CorrelationResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an explicit rule for `(saga type, message type)`
    ///
    /// Re-registration for the same pair is rejected.
    pub fn register_rule<M: DispatchMessage>(
        &self,
        saga_type: impl Into<String>,
        rule: CorrelationRule,
    ) -> Result<()> {
        let key = (saga_type.into(), M::message_type());
        let mut rules = self.rules.write().unwrap_or_else(|e| e.into_inner());
        if rules.contains_key(&key) {
            return Err(DispatchError::argument(
                "rule",
                format!(
                    "correlation rule already registered for ({}, {})",
                    key.0, key.1
                ),
            ));
        }
        rules.insert(key, rule);
        Ok(())
    }

    /// Register the message-declared key for `M`, compiled once and cached
    pub fn register_keyed<M>(&self)
    where
        M: DispatchMessage + CorrelationKeyed + 'static,
    {
        let extractor: Extractor = Arc::new(|message: &DynMessage| {
            message
                .body_as::<M>()
                .and_then(|body| body.correlation_key())
        });
        self.extractors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(TypeId::of::<M>(), extractor);
    }

    /// Resolve a correlation key, or `None` when nothing matches
    pub fn resolve(&self, saga_type: &str, message: &DynMessage) -> Option<String> {
        // 1. Explicit rule.
        {
            let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
            if let Some(rule) = rules.get(&(saga_type.to_string(), message.message_type)) {
                if let Some(key) = message.body_json().and_then(|body| rule.apply(body)) {
                    return Some(key);
                }
            }
        }

        // 2. Message-declared key.
        {
            let extractors = self.extractors.read().unwrap_or_else(|e| e.into_inner());
            if let Some(extractor) = extractors.get(&message.body_type_id()) {
                if let Some(key) = extractor(message) {
                    return Some(key);
                }
            }
        }

        // 3 & 4. Convention fields.
        let body = message.body_json()?;
        for name in SAGA_ID_CONVENTIONS {
            if let Some(key) = read_property(body, name) {
                return Some(key);
            }
        }
        for name in CORRELATION_ID_CONVENTIONS {
            if let Some(key) = read_property(body, name) {
                return Some(key);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use excalibur_types::Envelope;

    #[derive(serde::Serialize)]
    struct OrderPlacedEvent {
        order_id: String,
        customer_id: String,
    }
    impl DispatchMessage for OrderPlacedEvent {}

    #[derive(serde::Serialize)]
    #[serde(rename_all = "PascalCase")]
    struct LegacyTimeoutCommand {
        saga_id: String,
    }
    impl DispatchMessage for LegacyTimeoutCommand {}

    #[derive(serde::Serialize)]
    struct PaymentSettledEvent {
        correlation_id: String,
    }
    impl DispatchMessage for PaymentSettledEvent {}

    #[derive(serde::Serialize)]
    struct KeyedCommand {
        reference: String,
    }
    impl DispatchMessage for KeyedCommand {}
    impl CorrelationKeyed for KeyedCommand {
        fn correlation_key(&self) -> Option<String> {
            Some(format!("ref:{}", self.reference))
        }
    }

    #[test]
    fn test_explicit_single_property_rule() {
        let resolver = CorrelationResolver::new();
        resolver
            .register_rule::<OrderPlacedEvent>("order", CorrelationRule::property("order_id"))
            .unwrap();

        let message = Envelope::new(OrderPlacedEvent {
            order_id: "o-1".to_string(),
            customer_id: "c-9".to_string(),
        })
        .erase();
        assert_eq!(resolver.resolve("order", &message), Some("o-1".to_string()));
    }

    #[test]
    fn test_composite_rule_joins_with_pipe() {
        let resolver = CorrelationResolver::new();
        resolver
            .register_rule::<OrderPlacedEvent>(
                "order",
                CorrelationRule::composite(["order_id", "customer_id"]),
            )
            .unwrap();

        let message = Envelope::new(OrderPlacedEvent {
            order_id: "o-1".to_string(),
            customer_id: "c-9".to_string(),
        })
        .erase();
        assert_eq!(
            resolver.resolve("order", &message),
            Some("o-1|c-9".to_string())
        );
    }

    #[test]
    fn test_missing_property_fails_rule_when_required() {
        let resolver = CorrelationResolver::new();
        resolver
            .register_rule::<OrderPlacedEvent>(
                "order",
                CorrelationRule::composite(["order_id", "warehouse_id"]),
            )
            .unwrap();

        let message = Envelope::new(OrderPlacedEvent {
            order_id: "o-1".to_string(),
            customer_id: "c-9".to_string(),
        })
        .erase();
        // The rule fails; no convention field exists either.
        assert_eq!(resolver.resolve("order", &message), None);
    }

    #[test]
    fn test_declared_key_takes_precedence_over_convention() {
        let resolver = CorrelationResolver::new();
        resolver.register_keyed::<KeyedCommand>();

        let message = Envelope::new(KeyedCommand {
            reference: "r-5".to_string(),
        })
        .erase();
        assert_eq!(
            resolver.resolve("order", &message),
            Some("ref:r-5".to_string())
        );
    }

    #[test]
    fn test_saga_id_convention_case_sensitive() {
        let resolver = CorrelationResolver::new();
        let message = Envelope::new(LegacyTimeoutCommand {
            saga_id: "saga-7".to_string(),
        })
        .erase();
        // Serialized as PascalCase `SagaId`.
        assert_eq!(
            resolver.resolve("order", &message),
            Some("saga-7".to_string())
        );
    }

    #[test]
    fn test_correlation_id_convention_fallback() {
        let resolver = CorrelationResolver::new();
        let message = Envelope::new(PaymentSettledEvent {
            correlation_id: "corr-3".to_string(),
        })
        .erase();
        assert_eq!(
            resolver.resolve("payment", &message),
            Some("corr-3".to_string())
        );
    }

    #[test]
    fn test_re_registration_is_an_error() {
        let resolver = CorrelationResolver::new();
        resolver
            .register_rule::<OrderPlacedEvent>("order", CorrelationRule::property("order_id"))
            .unwrap();
        let err = resolver
            .register_rule::<OrderPlacedEvent>("order", CorrelationRule::property("customer_id"))
            .unwrap_err();
        assert_eq!(err.error_code(), "ARGUMENT_INVALID");
    }
}
