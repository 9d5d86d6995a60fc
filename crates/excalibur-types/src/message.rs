//! Message kinds, the typed envelope, and its erased view
//!
//! Every dispatch starts from an [`Envelope`] wrapping a typed message
//! body. Middleware never sees the concrete body type; the invoker hands
//! it a [`DynMessage`] view instead, which carries the envelope fields
//! plus the body behind `Any`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::features::FeatureSet;
use crate::identity::MessageId;

/// Classification used to gate middleware
///
/// `All` is a wildcard used in middleware declarations; a concrete message
/// is never classified as `All`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    /// A command-style message expecting a single result
    Action,
    /// A fact that already happened, fanned out to subscribers
    Event,
    /// A payload-centric message, typically streamed
    Document,
    /// Wildcard matching any kind (declarations only)
    All,
}

impl MessageKind {
    /// Classify a message by type-name convention
    ///
    /// Names ending in `Command` or `Action` classify as [`MessageKind::Action`],
    /// `Event` as [`MessageKind::Event`], `Document` as
    /// [`MessageKind::Document`]; anything else defaults to Action.
    pub fn classify(type_name: &str) -> Self {
        // Path-qualified names classify by their last segment.
        let short = type_name.rsplit("::").next().unwrap_or(type_name);
        if short.ends_with("Command") || short.ends_with("Action") {
            Self::Action
        } else if short.ends_with("Event") {
            Self::Event
        } else if short.ends_with("Document") {
            Self::Document
        } else {
            Self::Action
        }
    }

    /// True when this declared kind admits the given concrete kind
    pub fn admits(&self, concrete: MessageKind) -> bool {
        *self == MessageKind::All || *self == concrete
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Action => "Action",
            Self::Event => "Event",
            Self::Document => "Document",
            Self::All => "All",
        };
        write!(f, "{}", name)
    }
}

/// Implemented by every message type handed to the dispatcher
///
/// The defaults derive both the message type name and the kind from the
/// Rust type name, mirroring the registration-time classification
/// convention. Override [`DispatchMessage::kind`] to classify explicitly.
pub trait DispatchMessage: Send + Sync + 'static {
    /// Stable name identifying this message type
    fn message_type() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }

    /// The kind this message classifies as
    fn kind() -> MessageKind
    where
        Self: Sized,
    {
        MessageKind::classify(Self::message_type())
    }
}

/// The typed message envelope
///
/// Immutable once constructed: the producer owns it until it is handed to
/// the pipeline, which borrows it without mutation. Field order here is
/// the wire order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<M> {
    /// Sortable message identity
    pub message_id: MessageId,
    /// When the message occurred (UTC)
    pub occurred_at: DateTime<Utc>,
    /// Classified kind
    pub kind: MessageKind,
    /// Transport headers; ordering is irrelevant
    pub headers: HashMap<String, String>,
    /// The typed body
    pub body: M,
    /// Capability tags active for this dispatch (not part of the wire shape)
    #[serde(skip)]
    pub features: FeatureSet,
}

impl<M: DispatchMessage> Envelope<M> {
    /// Wrap a message, classifying its kind by convention
    pub fn new(body: M) -> Self {
        Self {
            message_id: MessageId::new(),
            occurred_at: Utc::now(),
            kind: M::kind(),
            headers: HashMap::new(),
            body,
            features: FeatureSet::new(),
        }
    }

    /// Wrap a message with an explicit kind
    pub fn with_kind(body: M, kind: MessageKind) -> Self {
        let mut envelope = Self::new(body);
        envelope.kind = kind;
        envelope
    }

    /// Builder-style header attachment (pre-dispatch only)
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Builder-style feature activation (pre-dispatch only)
    pub fn feature(mut self, tag: impl Into<String>) -> Self {
        self.features.insert(tag);
        self
    }

    /// Erase the body type for middleware consumption
    pub fn erase(self) -> DynMessage
    where
        M: Serialize,
    {
        let json = serde_json::to_value(&self.body).ok();
        DynMessage {
            message_id: self.message_id,
            occurred_at: self.occurred_at,
            kind: self.kind,
            headers: Arc::new(self.headers),
            features: self.features,
            message_type: M::message_type(),
            body: Arc::new(self.body),
            body_json: Arc::new(json),
        }
    }
}

/// Type-erased view of an envelope handed through the middleware chain
///
/// Cloning is cheap: the body and headers are shared.
#[derive(Clone)]
pub struct DynMessage {
    /// Sortable message identity
    pub message_id: MessageId,
    /// When the message occurred (UTC)
    pub occurred_at: DateTime<Utc>,
    /// Classified kind
    pub kind: MessageKind,
    /// Transport headers
    pub headers: Arc<HashMap<String, String>>,
    /// Capability tags active for this dispatch
    pub features: FeatureSet,
    /// Stable name of the body type
    pub message_type: &'static str,
    body: Arc<dyn Any + Send + Sync>,
    body_json: Arc<Option<serde_json::Value>>,
}

impl DynMessage {
    /// Downcast the body to its concrete type
    pub fn body_as<M: 'static>(&self) -> Option<&M> {
        self.body.downcast_ref::<M>()
    }

    /// The `TypeId` of the concrete body, for registry lookups
    pub fn body_type_id(&self) -> std::any::TypeId {
        (*self.body).type_id()
    }

    /// The body's JSON form, when the body was serializable
    ///
    /// Used for convention-based field lookups (correlation resolution).
    pub fn body_json(&self) -> Option<&serde_json::Value> {
        self.body_json.as_ref().as_ref()
    }
}

impl fmt::Debug for DynMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynMessage")
            .field("message_id", &self.message_id)
            .field("kind", &self.kind)
            .field("message_type", &self.message_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReserveInventoryCommand;
    impl DispatchMessage for ReserveInventoryCommand {}

    struct OrderShippedEvent;
    impl DispatchMessage for OrderShippedEvent {}

    struct InvoiceDocument;
    impl DispatchMessage for InvoiceDocument {}

    struct Ping;
    impl DispatchMessage for Ping {}

    #[test]
    fn test_classification_by_convention() {
        assert_eq!(ReserveInventoryCommand::kind(), MessageKind::Action);
        assert_eq!(OrderShippedEvent::kind(), MessageKind::Event);
        assert_eq!(InvoiceDocument::kind(), MessageKind::Document);
        assert_eq!(Ping::kind(), MessageKind::Action);
    }

    #[test]
    fn test_classify_strips_module_path() {
        assert_eq!(
            MessageKind::classify("my_crate::orders::SubmitOrderCommand"),
            MessageKind::Action
        );
        assert_eq!(
            MessageKind::classify("my_crate::orders::OrderPlacedEvent"),
            MessageKind::Event
        );
    }

    #[test]
    fn test_all_admits_everything() {
        assert!(MessageKind::All.admits(MessageKind::Action));
        assert!(MessageKind::All.admits(MessageKind::Document));
        assert!(!MessageKind::Event.admits(MessageKind::Action));
        assert!(MessageKind::Event.admits(MessageKind::Event));
    }

    #[test]
    fn test_erased_body_downcast() {
        #[derive(serde::Serialize)]
        struct PriceQuoteDocument {
            amount: u64,
        }
        impl DispatchMessage for PriceQuoteDocument {}

        let dyn_msg = Envelope::new(PriceQuoteDocument { amount: 42 }).erase();
        assert_eq!(dyn_msg.kind, MessageKind::Document);
        assert_eq!(dyn_msg.body_as::<PriceQuoteDocument>().unwrap().amount, 42);
        assert!(dyn_msg.body_as::<u32>().is_none());
        assert_eq!(dyn_msg.body_json().unwrap()["amount"], 42);
    }
}
