//! Middleware contract and descriptors
//!
//! A middleware declares what it applies to through a
//! [`MiddlewareDescriptor`]: the message kinds it covers, the kinds it
//! explicitly excludes, the feature tags it requires, and the pipeline
//! stage it runs in. The invoker orders middleware by stage first,
//! registration order second.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use excalibur_types::{
    DispatchError, DispatchMessage, DispatchResult, DynMessage, MessageContext, MessageKind,
};

/// Coarse pipeline phase; middleware run in this order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MiddlewareStage {
    /// Enrichment before any checks
    PreProcessing,
    /// Structural validation
    Validation,
    /// Access decisions
    Authorization,
    /// The main work
    Processing,
    /// Follow-up after the handler ran
    PostProcessing,
    /// Always-last concerns (metrics flush, tracing close)
    End,
}

/// Declarative applicability record for a middleware type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MiddlewareDescriptor {
    /// Stable key identifying the middleware type
    pub type_key: &'static str,
    /// Stage the middleware runs in
    pub stage: MiddlewareStage,
    /// Kinds the middleware applies to ([`MessageKind::All`] admits every kind)
    pub applicable_kinds: Vec<MessageKind>,
    /// Kinds explicitly excluded, subtracted from the applicable set
    pub excluded_kinds: Vec<MessageKind>,
    /// Feature tags that must all be active for the middleware to apply
    pub required_features: Vec<String>,
}

impl MiddlewareDescriptor {
    /// Start a descriptor applying to every kind at the Processing stage
    pub fn new(type_key: &'static str) -> Self {
        Self {
            type_key,
            stage: MiddlewareStage::Processing,
            applicable_kinds: vec![MessageKind::All],
            excluded_kinds: Vec::new(),
            required_features: Vec::new(),
        }
    }

    /// Set the stage
    pub fn stage(mut self, stage: MiddlewareStage) -> Self {
        self.stage = stage;
        self
    }

    /// Restrict to the given kinds
    pub fn applies_to_kinds(mut self, kinds: impl IntoIterator<Item = MessageKind>) -> Self {
        self.applicable_kinds = kinds.into_iter().collect();
        self
    }

    /// Exclude the given kinds
    pub fn excludes_kinds(mut self, kinds: impl IntoIterator<Item = MessageKind>) -> Self {
        self.excluded_kinds = kinds.into_iter().collect();
        self
    }

    /// Require a feature tag
    pub fn requires_feature(mut self, tag: impl Into<String>) -> Self {
        self.required_features.push(tag.into());
        self
    }

    /// Applicability rule: kind within applicable minus excluded, and all
    /// required features active
    pub fn applies_to(&self, kind: MessageKind, features: &excalibur_types::FeatureSet) -> bool {
        let admitted = self.applicable_kinds.iter().any(|k| k.admits(kind));
        let excluded = self.excluded_kinds.iter().any(|k| k.admits(kind));
        admitted
            && !excluded
            && features.contains_all(self.required_features.iter().map(String::as_str))
    }
}

/// A single link in the dispatch pipeline
///
/// Implementations may short-circuit by returning without calling
/// [`Next::run`]; middleware already entered still observe the result on
/// the return path.
#[async_trait]
pub trait DispatchMiddleware: Send + Sync + 'static {
    /// The middleware's declarative applicability record
    ///
    /// Implementations computing applicability dynamically should override
    /// [`DispatchMiddleware::try_descriptor`] instead when the computation
    /// can fail.
    fn descriptor(&self) -> MiddlewareDescriptor;

    /// Fallible descriptor lookup; failures follow the configured
    /// include/exclude-on-error policy
    fn try_descriptor(&self) -> Result<MiddlewareDescriptor, DispatchError> {
        Ok(self.descriptor())
    }

    /// Process the message, optionally delegating to the rest of the chain
    async fn handle(
        &self,
        message: &DynMessage,
        ctx: &MessageContext,
        next: Next<'_>,
    ) -> DispatchResult;
}

/// The delegate terminating the middleware chain
#[async_trait]
pub trait FinalDelegate: Send + Sync {
    /// Run the terminal action (normally handler resolution + invocation)
    async fn run(&self, message: &DynMessage, ctx: &MessageContext) -> DispatchResult;
}

/// Adapter turning an async closure into a [`FinalDelegate`]
pub struct FinalFn<F>(pub F);

#[async_trait]
impl<F, Fut> FinalDelegate for FinalFn<F>
where
    F: Fn(DynMessage, MessageContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = DispatchResult> + Send,
{
    async fn run(&self, message: &DynMessage, ctx: &MessageContext) -> DispatchResult {
        (self.0)(message.clone(), ctx.clone()).await
    }
}

/// Continuation handed to each middleware
///
/// Consuming `run` enforces the at-most-once contract for delegation.
pub struct Next<'a> {
    pub(crate) chain: &'a [Arc<dyn DispatchMiddleware>],
    pub(crate) terminal: &'a dyn FinalDelegate,
    pub(crate) cancellation: &'a CancellationToken,
}

impl<'a> Next<'a> {
    /// Invoke the rest of the chain, ending at the final delegate
    ///
    /// Cancellation is observed at entry to every middleware; a cancelled
    /// token surfaces as a failed result with a `cancelled` error.
    pub async fn run(self, message: &DynMessage, ctx: &MessageContext) -> DispatchResult {
        if self.cancellation.is_cancelled() {
            return DispatchResult::failed(DispatchError::Cancelled);
        }
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    chain: rest,
                    terminal: self.terminal,
                    cancellation: self.cancellation,
                };
                head.handle(message, ctx, next).await
            }
            None => self.terminal.run(message, ctx).await,
        }
    }
}

/// Descriptor helper deriving the type key from the middleware type name
pub fn type_key_of<T: DispatchMiddleware>() -> &'static str {
    std::any::type_name::<T>()
}

/// Convenience: classify which kinds a message type covers for middleware
/// declarations gated on a single message family
pub fn kinds_for_message<M: DispatchMessage>() -> Vec<MessageKind> {
    vec![M::kind()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use excalibur_types::FeatureSet;

    #[test]
    fn test_applies_to_kind_math() {
        let descriptor = MiddlewareDescriptor::new("validation")
            .applies_to_kinds([MessageKind::Action, MessageKind::Document])
            .excludes_kinds([MessageKind::Document]);

        let features = FeatureSet::new();
        assert!(descriptor.applies_to(MessageKind::Action, &features));
        assert!(!descriptor.applies_to(MessageKind::Document, &features));
        assert!(!descriptor.applies_to(MessageKind::Event, &features));
    }

    #[test]
    fn test_all_wildcard_with_exclusion() {
        let descriptor =
            MiddlewareDescriptor::new("everything-but-events").excludes_kinds([MessageKind::Event]);

        let features = FeatureSet::new();
        assert!(descriptor.applies_to(MessageKind::Action, &features));
        assert!(descriptor.applies_to(MessageKind::Document, &features));
        assert!(!descriptor.applies_to(MessageKind::Event, &features));
    }

    #[test]
    fn test_required_features_must_all_be_active() {
        let descriptor = MiddlewareDescriptor::new("traced")
            .requires_feature("tracing")
            .requires_feature("metrics");

        assert!(!descriptor.applies_to(MessageKind::Action, &FeatureSet::from_tags(["tracing"])));
        assert!(descriptor.applies_to(
            MessageKind::Action,
            &FeatureSet::from_tags(["tracing", "metrics"])
        ));
    }

    #[test]
    fn test_stage_ordering() {
        assert!(MiddlewareStage::PreProcessing < MiddlewareStage::Validation);
        assert!(MiddlewareStage::Validation < MiddlewareStage::Authorization);
        assert!(MiddlewareStage::Authorization < MiddlewareStage::Processing);
        assert!(MiddlewareStage::Processing < MiddlewareStage::PostProcessing);
        assert!(MiddlewareStage::PostProcessing < MiddlewareStage::End);
    }
}
