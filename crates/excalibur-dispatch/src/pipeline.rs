//! The dispatch pipeline invoker
//!
//! Builds the ordered middleware chain for a message and executes it,
//! terminating at a final delegate. Ordering is stable: stage first, then
//! registration order within a stage. The invoker caches the filtered
//! chain per `(message type, feature snapshot)`; a cached chain is only
//! reused while the active feature set is unchanged, which the cache key
//! guarantees by construction.

use dashmap::DashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use excalibur_types::{
    DispatchError, DispatchResult, DynMessage, FeatureSet, MessageContext, MessageKind,
};

use crate::applicability::ApplicabilityEvaluator;
use crate::middleware::{DispatchMiddleware, FinalDelegate, Next};

/// Invoker options
#[derive(Debug, Clone)]
pub struct InvokerOptions {
    /// Cache filtered chains per (message type, feature snapshot)
    pub enable_caching: bool,
}

impl Default for InvokerOptions {
    fn default() -> Self {
        Self {
            enable_caching: true,
        }
    }
}

type Chain = Arc<Vec<Arc<dyn DispatchMiddleware>>>;

struct RegisteredMiddleware {
    middleware: Arc<dyn DispatchMiddleware>,
    registration_index: usize,
}

/// Builds and executes middleware chains
pub struct PipelineInvoker {
    evaluator: Arc<ApplicabilityEvaluator>,
    options: InvokerOptions,
    middlewares: RwLock<Vec<RegisteredMiddleware>>,
    chain_cache: DashMap<(&'static str, String), Chain>,
    static_chains: DashMap<&'static str, (String, Chain)>,
}

impl PipelineInvoker {
    /// Create an invoker with default options
    pub fn new(evaluator: Arc<ApplicabilityEvaluator>) -> Self {
        Self::with_options(evaluator, InvokerOptions::default())
    }

    /// Create an invoker with explicit options
    pub fn with_options(evaluator: Arc<ApplicabilityEvaluator>, options: InvokerOptions) -> Self {
        Self {
            evaluator,
            options,
            middlewares: RwLock::new(Vec::new()),
            chain_cache: DashMap::new(),
            static_chains: DashMap::new(),
        }
    }

    /// The evaluator consulted when filtering
    pub fn evaluator(&self) -> &Arc<ApplicabilityEvaluator> {
        &self.evaluator
    }

    /// Register a middleware; registration order breaks stage ties
    pub fn register(&self, middleware: Arc<dyn DispatchMiddleware>) {
        let mut middlewares = self.middlewares.write().unwrap_or_else(|e| e.into_inner());
        let registration_index = middlewares.len();
        middlewares.push(RegisteredMiddleware {
            middleware,
            registration_index,
        });
        // Any previously filtered chain may now be stale.
        self.chain_cache.clear();
        self.static_chains.clear();
    }

    /// Pre-assemble a flat chain for a message type whose routing is fully
    /// determined at registration time
    ///
    /// The static chain is used only when a dispatch arrives with exactly
    /// the feature set given here; anything else falls back to the dynamic
    /// path, which preserves identical observable semantics.
    pub fn register_static(
        &self,
        message_type: &'static str,
        kind: MessageKind,
        features: &FeatureSet,
    ) {
        let chain = self.build_chain(kind, features);
        self.static_chains
            .insert(message_type, (features.snapshot_key(), chain));
        debug!(message_type, "static pipeline pre-assembled");
    }

    /// Execute the pipeline for an erased message
    ///
    /// Cancellation is honored at entry to every middleware. Middleware
    /// that short-circuits prevents later middleware and the final
    /// delegate from running; middleware already entered observe the
    /// result on the return path.
    pub async fn invoke(
        &self,
        message: &DynMessage,
        ctx: &MessageContext,
        final_delegate: &dyn FinalDelegate,
        cancellation: &CancellationToken,
    ) -> DispatchResult {
        if message.message_type.is_empty() {
            return DispatchResult::failed(DispatchError::argument(
                "message",
                "message type must not be empty",
            ));
        }
        if message.kind == MessageKind::All {
            return DispatchResult::failed(DispatchError::argument(
                "message",
                "a concrete message cannot be classified as All",
            ));
        }

        let chain = self.chain_for(message);
        let next = Next {
            chain: chain.as_slice(),
            terminal: final_delegate,
            cancellation,
        };
        next.run(message, ctx).await
    }

    /// Resolve the ordered, filtered chain for a message
    fn chain_for(&self, message: &DynMessage) -> Chain {
        let features_key = message.features.snapshot_key();

        if let Some(entry) = self.static_chains.get(message.message_type) {
            let (static_key, chain) = entry.value();
            if *static_key == features_key {
                return Arc::clone(chain);
            }
        }

        if !self.options.enable_caching {
            return self.build_chain(message.kind, &message.features);
        }

        let cache_key = (message.message_type, features_key);
        if let Some(chain) = self.chain_cache.get(&cache_key) {
            return Arc::clone(chain.value());
        }
        let chain = self.build_chain(message.kind, &message.features);
        self.chain_cache.insert(cache_key, Arc::clone(&chain));
        chain
    }

    /// Filter and order middleware for a (kind, features) pair
    fn build_chain(&self, kind: MessageKind, features: &FeatureSet) -> Chain {
        let middlewares = self.middlewares.read().unwrap_or_else(|e| e.into_inner());

        let mut applicable: Vec<(crate::middleware::MiddlewareStage, usize, Arc<dyn DispatchMiddleware>)> =
            Vec::new();
        for registered in middlewares.iter() {
            if self
                .evaluator
                .is_applicable_with_features(registered.middleware.as_ref(), kind, features)
            {
                let stage = registered
                    .middleware
                    .try_descriptor()
                    .map(|d| d.stage)
                    .unwrap_or(crate::middleware::MiddlewareStage::Processing);
                applicable.push((
                    stage,
                    registered.registration_index,
                    Arc::clone(&registered.middleware),
                ));
            }
        }

        applicable.sort_by_key(|(stage, index, _)| (*stage, *index));
        Arc::new(applicable.into_iter().map(|(_, _, m)| m).collect())
    }
}
