//! Middleware applicability evaluation
//!
//! Applicability records are lifted from middleware once and cached by
//! type key. The process-wide cache moves through three phases:
//!
//! - **Warm**: reads miss → compute and insert
//! - **Frozen**: reads hit a read-only snapshot; misses compute but do
//!   not insert
//! - **Cleared**: reset back to warm
//!
//! Freezing is idempotent and reads stay correct in every phase.
//! Evaluation errors are non-fatal: the configured policy decides whether
//! an erroring middleware is treated as applicable, and the error is
//! logged once per middleware type.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

use excalibur_types::{FeatureSet, MessageKind};

use crate::middleware::{DispatchMiddleware, MiddlewareDescriptor};

/// Applicability evaluation options
#[derive(Debug, Clone)]
pub struct ApplicabilityOptions {
    /// Treat a middleware whose evaluation errored as applicable
    pub include_on_filter_error: bool,
}

impl Default for ApplicabilityOptions {
    fn default() -> Self {
        Self {
            include_on_filter_error: true,
        }
    }
}

/// Cache phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CachePhase {
    Warm,
    Frozen,
}

struct CacheInner {
    phase: CachePhase,
    warm: HashMap<&'static str, MiddlewareDescriptor>,
    frozen: Option<Arc<HashMap<&'static str, MiddlewareDescriptor>>>,
}

/// Process-wide descriptor cache with the warm/frozen/cleared lifecycle
pub struct ApplicabilityCache {
    inner: RwLock<CacheInner>,
}

impl ApplicabilityCache {
    /// Create a cache in the warm phase
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                phase: CachePhase::Warm,
                warm: HashMap::new(),
                frozen: None,
            }),
        }
    }

    /// Look up a cached descriptor
    pub fn get(&self, type_key: &str) -> Option<MiddlewareDescriptor> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        match inner.phase {
            CachePhase::Frozen => inner
                .frozen
                .as_ref()
                .and_then(|snapshot| snapshot.get(type_key).cloned()),
            CachePhase::Warm => inner.warm.get(type_key).cloned(),
        }
    }

    /// Insert a computed descriptor; ignored while frozen
    pub fn insert(&self, descriptor: MiddlewareDescriptor) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.phase == CachePhase::Warm {
            inner.warm.insert(descriptor.type_key, descriptor);
        }
    }

    /// Freeze the cache into a read-only snapshot; idempotent
    pub fn freeze(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.phase == CachePhase::Frozen {
            return;
        }
        let snapshot = Arc::new(std::mem::take(&mut inner.warm));
        inner.frozen = Some(snapshot);
        inner.phase = CachePhase::Frozen;
    }

    /// Reset to the warm phase, dropping all cached entries
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.phase = CachePhase::Warm;
        inner.warm = HashMap::new();
        inner.frozen = None;
    }

    /// True once [`ApplicabilityCache::freeze`] has been called
    pub fn is_frozen(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.phase == CachePhase::Frozen
    }
}

impl Default for ApplicabilityCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluates which middleware apply to a (kind, feature-set) pair
///
/// Descriptors registered through [`ApplicabilityEvaluator::register_descriptor`]
/// (the startup registration builder) take precedence over whatever the
/// middleware instance reports.
pub struct ApplicabilityEvaluator {
    cache: Arc<ApplicabilityCache>,
    registered: RwLock<HashMap<&'static str, MiddlewareDescriptor>>,
    options: ApplicabilityOptions,
    warned: Mutex<HashSet<String>>,
}

impl ApplicabilityEvaluator {
    /// Create an evaluator with default options and a fresh cache
    pub fn new() -> Self {
        Self::with_options(ApplicabilityOptions::default())
    }

    /// Create an evaluator with explicit options
    pub fn with_options(options: ApplicabilityOptions) -> Self {
        Self {
            cache: Arc::new(ApplicabilityCache::new()),
            registered: RwLock::new(HashMap::new()),
            options,
            warned: Mutex::new(HashSet::new()),
        }
    }

    /// The underlying descriptor cache
    pub fn cache(&self) -> &Arc<ApplicabilityCache> {
        &self.cache
    }

    /// Register a declarative descriptor for a middleware type
    ///
    /// Registered descriptors win over instance-reported ones.
    pub fn register_descriptor(&self, descriptor: MiddlewareDescriptor) {
        let mut registered = self.registered.write().unwrap_or_else(|e| e.into_inner());
        registered.insert(descriptor.type_key, descriptor);
    }

    /// Type-level applicability for a registered middleware type
    pub fn is_applicable_type(&self, type_key: &str, kind: MessageKind) -> bool {
        self.is_applicable_type_with_features(type_key, kind, &FeatureSet::new())
    }

    /// Type-level applicability with active features
    pub fn is_applicable_type_with_features(
        &self,
        type_key: &str,
        kind: MessageKind,
        features: &FeatureSet,
    ) -> bool {
        let registered = self.registered.read().unwrap_or_else(|e| e.into_inner());
        match registered.get(type_key) {
            Some(descriptor) => descriptor.applies_to(kind, features),
            None => self.on_filter_error(type_key, "no descriptor registered for type"),
        }
    }

    /// Instance-level applicability
    pub fn is_applicable(&self, middleware: &dyn DispatchMiddleware, kind: MessageKind) -> bool {
        self.is_applicable_with_features(middleware, kind, &FeatureSet::new())
    }

    /// Instance-level applicability with active features
    pub fn is_applicable_with_features(
        &self,
        middleware: &dyn DispatchMiddleware,
        kind: MessageKind,
        features: &FeatureSet,
    ) -> bool {
        match self.descriptor_for(middleware) {
            Ok(descriptor) => descriptor.applies_to(kind, features),
            Err(reason) => self.on_filter_error_owned(middleware, reason),
        }
    }

    /// Filter middleware, preserving input order and dropping entries that
    /// do not apply
    pub fn filter(
        &self,
        middlewares: &[Arc<dyn DispatchMiddleware>],
        kind: MessageKind,
        features: &FeatureSet,
    ) -> Vec<Arc<dyn DispatchMiddleware>> {
        middlewares
            .iter()
            .filter(|m| self.is_applicable_with_features(m.as_ref(), kind, features))
            .cloned()
            .collect()
    }

    /// Lift the descriptor for a middleware, consulting the registration
    /// builder first, then the cache, then the instance
    fn descriptor_for(
        &self,
        middleware: &dyn DispatchMiddleware,
    ) -> Result<MiddlewareDescriptor, String> {
        let type_key = match middleware.try_descriptor() {
            Ok(descriptor) => descriptor.type_key,
            Err(err) => return Err(err.to_string()),
        };

        {
            let registered = self.registered.read().unwrap_or_else(|e| e.into_inner());
            if let Some(descriptor) = registered.get(type_key) {
                return Ok(descriptor.clone());
            }
        }

        if let Some(descriptor) = self.cache.get(type_key) {
            return Ok(descriptor);
        }

        match middleware.try_descriptor() {
            Ok(descriptor) => {
                self.cache.insert(descriptor.clone());
                Ok(descriptor)
            }
            Err(err) => Err(err.to_string()),
        }
    }

    fn on_filter_error_owned(&self, middleware: &dyn DispatchMiddleware, reason: String) -> bool {
        let type_key = middleware
            .try_descriptor()
            .map(|d| d.type_key)
            .unwrap_or("<unknown middleware>");
        self.on_filter_error(type_key, &reason)
    }

    /// Apply the include/exclude-on-error policy, logging once per type
    fn on_filter_error(&self, type_key: &str, reason: &str) -> bool {
        let mut warned = self.warned.lock().unwrap_or_else(|e| e.into_inner());
        if warned.insert(type_key.to_string()) {
            warn!(
                middleware = type_key,
                reason,
                include = self.options.include_on_filter_error,
                "middleware applicability evaluation failed"
            );
        }
        self.options.include_on_filter_error
    }
}

impl Default for ApplicabilityEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{MiddlewareStage, Next};
    use async_trait::async_trait;
    use excalibur_types::{DispatchError, DispatchResult, DynMessage, MessageContext};

    struct ActionOnly;

    #[async_trait]
    impl DispatchMiddleware for ActionOnly {
        fn descriptor(&self) -> MiddlewareDescriptor {
            MiddlewareDescriptor::new("ActionOnly")
                .stage(MiddlewareStage::Validation)
                .applies_to_kinds([MessageKind::Action])
        }

        async fn handle(
            &self,
            message: &DynMessage,
            ctx: &MessageContext,
            next: Next<'_>,
        ) -> DispatchResult {
            next.run(message, ctx).await
        }
    }

    struct Broken;

    #[async_trait]
    impl DispatchMiddleware for Broken {
        fn descriptor(&self) -> MiddlewareDescriptor {
            MiddlewareDescriptor::new("Broken")
        }

        fn try_descriptor(&self) -> Result<MiddlewareDescriptor, DispatchError> {
            Err(DispatchError::MiddlewareFilter {
                middleware: "Broken".to_string(),
                reason: "lookup failed".to_string(),
            })
        }

        async fn handle(
            &self,
            message: &DynMessage,
            ctx: &MessageContext,
            next: Next<'_>,
        ) -> DispatchResult {
            next.run(message, ctx).await
        }
    }

    #[test]
    fn test_instance_applicability() {
        let evaluator = ApplicabilityEvaluator::new();
        let middleware = ActionOnly;
        assert!(evaluator.is_applicable(&middleware, MessageKind::Action));
        assert!(!evaluator.is_applicable(&middleware, MessageKind::Event));
    }

    #[test]
    fn test_registered_descriptor_takes_precedence() {
        let evaluator = ApplicabilityEvaluator::new();
        // The builder narrows ActionOnly down to events only.
        evaluator.register_descriptor(
            MiddlewareDescriptor::new("ActionOnly").applies_to_kinds([MessageKind::Event]),
        );

        let middleware = ActionOnly;
        assert!(!evaluator.is_applicable(&middleware, MessageKind::Action));
        assert!(evaluator.is_applicable(&middleware, MessageKind::Event));
    }

    #[test]
    fn test_filter_error_policy_include_default() {
        let evaluator = ApplicabilityEvaluator::new();
        assert!(evaluator.is_applicable(&Broken, MessageKind::Action));

        let excluding = ApplicabilityEvaluator::with_options(ApplicabilityOptions {
            include_on_filter_error: false,
        });
        assert!(!excluding.is_applicable(&Broken, MessageKind::Action));
    }

    #[test]
    fn test_filter_preserves_order() {
        let evaluator = ApplicabilityEvaluator::new();
        let middlewares: Vec<Arc<dyn DispatchMiddleware>> =
            vec![Arc::new(ActionOnly), Arc::new(ActionOnly)];

        let filtered = evaluator.filter(&middlewares, MessageKind::Action, &FeatureSet::new());
        assert_eq!(filtered.len(), 2);

        let filtered = evaluator.filter(&middlewares, MessageKind::Document, &FeatureSet::new());
        assert!(filtered.is_empty());
    }

    #[test]
    fn test_cache_freeze_is_idempotent_and_reads_unchanged() {
        let evaluator = ApplicabilityEvaluator::new();
        let middleware = ActionOnly;
        assert!(evaluator.is_applicable(&middleware, MessageKind::Action));

        evaluator.cache().freeze();
        assert!(evaluator.cache().is_frozen());
        let first = evaluator.is_applicable(&middleware, MessageKind::Action);

        evaluator.cache().freeze();
        let second = evaluator.is_applicable(&middleware, MessageKind::Action);
        assert_eq!(first, second);
        assert!(first);
    }

    #[test]
    fn test_frozen_cache_does_not_insert_misses() {
        let cache = ApplicabilityCache::new();
        cache.freeze();
        cache.insert(MiddlewareDescriptor::new("late"));
        assert!(cache.get("late").is_none());

        cache.clear();
        assert!(!cache.is_frozen());
        cache.insert(MiddlewareDescriptor::new("late"));
        assert!(cache.get("late").is_some());
    }
}
