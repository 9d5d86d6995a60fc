//! Dispatch bridge for timeout delivery
//!
//! Timeout rows store an erased payload plus a message type name; the
//! bridge owns the mapping back to typed dispatch. Each registered route
//! deserializes the payload into its concrete message type and sends it
//! through the pipeline, so redelivered timeouts see exactly the
//! middleware a live dispatch would.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use excalibur_dispatch::Dispatcher;
use excalibur_types::{DispatchError, DispatchMessage, Envelope, MessageContext, Result};

use crate::timeout::TimeoutDispatcher;

type RouteFn = Arc<
    dyn Fn(
            serde_json::Value,
            MessageContext,
        ) -> futures::future::BoxFuture<'static, Result<()>>
        + Send
        + Sync,
>;

/// Routes reconstructed timeout messages into the dispatch pipeline
///
/// One route per message type, registered at startup alongside the
/// handler registrations.
pub struct PipelineTimeoutDispatcher {
    dispatcher: Dispatcher,
    routes: std::sync::RwLock<HashMap<String, RouteFn>>,
}

impl PipelineTimeoutDispatcher {
    /// Create a bridge over a dispatcher
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self {
            dispatcher,
            routes: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Register the route for a message type
    pub fn register_route<M>(&self)
    where
        M: DispatchMessage + Serialize + DeserializeOwned,
    {
        let dispatcher = self.dispatcher.clone();
        let route: RouteFn = Arc::new(move |payload, ctx| {
            let dispatcher = dispatcher.clone();
            Box::pin(async move {
                let body: M = serde_json::from_value(payload)
                    .map_err(|err| DispatchError::serialization(err.to_string()))?;
                let result = dispatcher
                    .send(Envelope::new(body), &ctx, &CancellationToken::new())
                    .await;
                result.into_result().map(|_| ())
            })
        });
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(M::message_type().to_string(), route);
    }
}

#[async_trait]
impl TimeoutDispatcher for PipelineTimeoutDispatcher {
    async fn dispatch(
        &self,
        message_type: &str,
        payload: serde_json::Value,
        ctx: MessageContext,
    ) -> Result<()> {
        let route = {
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            routes.get(message_type).cloned()
        };
        match route {
            Some(route) => route(payload, ctx).await,
            None => Err(DispatchError::no_handler(message_type, "timeout route")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use excalibur_dispatch::{
        ActionHandler, ApplicabilityEvaluator, HandlerRegistry, PipelineInvoker,
    };
    use excalibur_types::MessageId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(serde::Serialize, serde::Deserialize)]
    struct OrderExpiredCommand {
        saga_id: String,
    }
    impl DispatchMessage for OrderExpiredCommand {}

    struct CountingHandler {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ActionHandler<OrderExpiredCommand> for CountingHandler {
        type Output = ();

        async fn handle(
            &self,
            _message: &OrderExpiredCommand,
            _ctx: &MessageContext,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn dispatcher() -> Dispatcher {
        let invoker = Arc::new(PipelineInvoker::new(Arc::new(ApplicabilityEvaluator::new())));
        Dispatcher::new(invoker, Arc::new(HandlerRegistry::new()))
    }

    #[tokio::test]
    async fn test_routed_timeout_reaches_the_handler() {
        let dispatcher = dispatcher();
        let calls = Arc::new(AtomicUsize::new(0));
        dispatcher
            .registry()
            .register_action::<OrderExpiredCommand, _>(CountingHandler {
                calls: Arc::clone(&calls),
            });

        let bridge = PipelineTimeoutDispatcher::new(dispatcher);
        bridge.register_route::<OrderExpiredCommand>();

        let ctx = MessageContext::new(MessageId::new());
        bridge
            .dispatch(
                OrderExpiredCommand::message_type(),
                serde_json::json!({"saga_id": "saga-1"}),
                ctx,
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unrouted_type_fails_with_no_handler() {
        let bridge = PipelineTimeoutDispatcher::new(dispatcher());
        let ctx = MessageContext::new(MessageId::new());
        let err = bridge
            .dispatch("UnknownCommand", serde_json::json!({}), ctx)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NO_HANDLER");
    }
}
