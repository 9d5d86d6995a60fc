//! Message context travelling alongside every dispatch
//!
//! The context carries correlation identifiers and an opaque capability
//! bag (`request_services`) the core only forwards. It is mutable via
//! typed setters before dispatch; the pipeline receives it behind a shared
//! reference and treats it as read-only.

use chrono::{DateTime, Utc};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::identity::{MessageId, TenantId};

/// Opaque capability bag keyed by type
///
/// Handlers resolve collaborators (key-management capability, stores,
/// clocks) from here; the dispatch core never inspects the contents.
#[derive(Default, Clone)]
pub struct ServiceBag {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceBag {
    /// Create an empty bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability, replacing any previous instance of the type
    pub fn insert<T: Any + Send + Sync>(&mut self, service: Arc<T>) {
        self.services.insert(TypeId::of::<T>(), service);
    }

    /// Resolve a capability by type
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .and_then(|service| Arc::clone(service).downcast::<T>().ok())
    }

    /// Number of registered capabilities
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// True when no capabilities are registered
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl fmt::Debug for ServiceBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBag")
            .field("len", &self.services.len())
            .finish()
    }
}

/// Context for a single dispatch
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Identity of the message being dispatched
    pub message_id: MessageId,
    /// Correlation chain identifier, stable across a workflow
    pub correlation_id: Option<String>,
    /// Identity of the message that caused this one
    pub causation_id: Option<MessageId>,
    /// Tenant the dispatch executes under
    pub tenant_id: Option<TenantId>,
    /// When the runtime received the message (UTC)
    pub received_timestamp_utc: DateTime<Utc>,
    /// Opaque capability bag forwarded to handlers
    pub request_services: ServiceBag,
}

impl MessageContext {
    /// Create a context for a message received now
    pub fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            correlation_id: None,
            causation_id: None,
            tenant_id: None,
            received_timestamp_utc: Utc::now(),
            request_services: ServiceBag::new(),
        }
    }

    /// Set the correlation id (pre-dispatch only)
    pub fn set_correlation_id(&mut self, correlation_id: impl Into<String>) {
        self.correlation_id = Some(correlation_id.into());
    }

    /// Set the causation id (pre-dispatch only)
    pub fn set_causation_id(&mut self, causation_id: MessageId) {
        self.causation_id = Some(causation_id);
    }

    /// Set the tenant (pre-dispatch only)
    pub fn set_tenant_id(&mut self, tenant_id: TenantId) {
        self.tenant_id = Some(tenant_id);
    }

    /// Register a capability on the bag (pre-dispatch only)
    pub fn add_service<T: Any + Send + Sync>(&mut self, service: Arc<T>) {
        self.request_services.insert(service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeKeyCapability {
        name: &'static str,
    }

    #[test]
    fn test_service_bag_resolution() {
        let mut ctx = MessageContext::new(MessageId::new());
        ctx.add_service(Arc::new(FakeKeyCapability { name: "kms" }));

        let resolved = ctx.request_services.get::<FakeKeyCapability>().unwrap();
        assert_eq!(resolved.name, "kms");
        assert!(ctx.request_services.get::<String>().is_none());
    }

    #[test]
    fn test_typed_setters() {
        let message_id = MessageId::new();
        let mut ctx = MessageContext::new(message_id);
        ctx.set_correlation_id("order-77");
        ctx.set_tenant_id(TenantId::new());

        assert_eq!(ctx.correlation_id.as_deref(), Some("order-77"));
        assert!(ctx.tenant_id.is_some());
        assert_eq!(ctx.message_id, message_id);
    }
}
