//! Handler contracts and the type-keyed registry
//!
//! Five invocation shapes exist, keyed by [`HandlerShape`]:
//!
//! 1. Action: one message in, one value out
//! 2. StreamOut: a document in, a lazy item sequence out
//! 3. StreamIn: a lazy item sequence in, consumed incrementally
//! 4. StreamTransform: a lazy sequence in, a lazy sequence out
//! 5. Progress: a document in, progress reports to a sink
//!
//! The registry maps a message type to `(shape, handler adapter)`. Action
//! adapters are fully erased so the pipeline's final delegate can invoke
//! them from a [`DynMessage`]; the streaming shapes stay typed and are
//! resolved by the dispatcher front-end.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::Stream;
use serde::Serialize;
use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use excalibur_types::{
    DispatchError, DispatchMessage, DynMessage, MessageContext, Result,
};

use crate::progress::ProgressSink;
use crate::streaming::{StreamEmitter, StreamEvent};

/// A lazy, type-erased-free input sequence of messages
pub type InputStream<M> = Pin<Box<dyn Stream<Item = M> + Send>>;

/// The five invocation shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerShape {
    /// One value in, one value out
    Action,
    /// Document in, item stream out
    StreamOut,
    /// Item stream in, consumed incrementally
    StreamIn,
    /// Item stream in, item stream out
    StreamTransform,
    /// Document in, progress reports out
    Progress,
}

impl HandlerShape {
    /// Short name used in `no-handler` diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::StreamOut => "streaming document",
            Self::StreamIn => "stream consumer",
            Self::StreamTransform => "stream transform",
            Self::Progress => "progress",
        }
    }
}

impl fmt::Display for HandlerShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// Handler Contracts
// ============================================================================

/// Action handler: one message, one result
#[async_trait]
pub trait ActionHandler<M: DispatchMessage>: Send + Sync + 'static {
    /// The handler's return type, erased to JSON at the pipeline boundary
    type Output: Serialize + Send;

    /// Handle the message
    async fn handle(&self, message: &M, ctx: &MessageContext) -> Result<Self::Output>;
}

/// Streaming document handler: produces items incrementally
///
/// The runtime runs the handler as a producer task; every
/// [`StreamEmitter::yield_item`] suspends until the consumer has
/// capacity, so the consumer's rate bounds the producer.
#[async_trait]
pub trait StreamHandler<M: DispatchMessage>: Send + Sync + 'static {
    /// Item type produced
    type Item: Serialize + Send + 'static;

    /// Produce items for the document
    async fn handle(
        &self,
        document: &M,
        ctx: &MessageContext,
        emitter: StreamEmitter<Self::Item>,
    ) -> Result<()>;
}

/// Stream consumer handler: reads its input incrementally
///
/// Implementations must not buffer the entire stream; pulling slowly is
/// the backpressure mechanism.
#[async_trait]
pub trait StreamConsumerHandler<M: DispatchMessage>: Send + Sync + 'static {
    /// Consume the input sequence
    async fn handle(&self, input: InputStream<M>, ctx: &MessageContext) -> Result<()>;
}

impl<M: DispatchMessage> std::fmt::Debug for dyn StreamConsumerHandler<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConsumerHandler").finish()
    }
}

/// Stream transform handler: maps an input sequence to an output sequence
#[async_trait]
pub trait StreamTransformHandler<M: DispatchMessage>: Send + Sync + 'static {
    /// Item type produced
    type Output: Serialize + Send + 'static;

    /// Transform the input sequence, yielding outputs incrementally
    async fn handle(
        &self,
        input: InputStream<M>,
        ctx: &MessageContext,
        emitter: StreamEmitter<Self::Output>,
    ) -> Result<()>;
}

/// Progress handler: processes a document while reporting progress
#[async_trait]
pub trait ProgressHandler<M: DispatchMessage>: Send + Sync + 'static {
    /// Process the document, reporting through the sink
    async fn handle(
        &self,
        document: &M,
        progress: &dyn ProgressSink,
        ctx: &MessageContext,
    ) -> Result<()>;
}

// ============================================================================
// Erased Adapters
// ============================================================================

/// Fully erased action invocation, callable from the final delegate
#[async_trait]
pub trait ErasedActionHandler: Send + Sync {
    /// Invoke the handler against the erased message
    async fn invoke(&self, message: &DynMessage, ctx: &MessageContext)
        -> Result<serde_json::Value>;
}

impl std::fmt::Debug for dyn ErasedActionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErasedActionHandler").finish()
    }
}

struct ActionAdapter<M, H> {
    handler: Arc<H>,
    _marker: PhantomData<fn(M)>,
}

#[async_trait]
impl<M, H> ErasedActionHandler for ActionAdapter<M, H>
where
    M: DispatchMessage,
    H: ActionHandler<M>,
{
    async fn invoke(
        &self,
        message: &DynMessage,
        ctx: &MessageContext,
    ) -> Result<serde_json::Value> {
        let body = message.body_as::<M>().ok_or_else(|| {
            DispatchError::internal(format!(
                "message body is not a {}",
                std::any::type_name::<M>()
            ))
        })?;
        let output = self.handler.handle(body, ctx).await?;
        Ok(serde_json::to_value(output)?)
    }
}

/// Erased stream-out invocation; the adapter owns serialization of items
#[async_trait]
pub trait ErasedStreamHandler: Send + Sync {
    /// Run the producer side of the stream
    async fn produce(
        &self,
        message: DynMessage,
        ctx: MessageContext,
        tx: mpsc::Sender<StreamEvent>,
        cancellation: CancellationToken,
    ) -> Result<()>;
}

struct StreamOutAdapter<M, H> {
    handler: Arc<H>,
    _marker: PhantomData<fn(M)>,
}

#[async_trait]
impl<M, H> ErasedStreamHandler for StreamOutAdapter<M, H>
where
    M: DispatchMessage,
    H: StreamHandler<M>,
{
    async fn produce(
        &self,
        message: DynMessage,
        ctx: MessageContext,
        tx: mpsc::Sender<StreamEvent>,
        cancellation: CancellationToken,
    ) -> Result<()> {
        let body = message.body_as::<M>().ok_or_else(|| {
            DispatchError::internal(format!(
                "message body is not a {}",
                std::any::type_name::<M>()
            ))
        })?;
        let emitter = StreamEmitter::new(tx, cancellation);
        self.handler.handle(body, &ctx, emitter).await
    }
}

/// Typed slot kept behind `Any` for the stream-in shape
pub struct ConsumerSlot<M: DispatchMessage>(pub Arc<dyn StreamConsumerHandler<M>>);

/// Typed slot kept behind `Any` for the transform shape
pub struct TransformSlot<M: DispatchMessage>(pub Arc<dyn ErasedTransformHandler<M>>);

/// Typed slot kept behind `Any` for the progress shape
pub struct ProgressSlot<M: DispatchMessage>(pub Arc<dyn ProgressHandler<M>>);

/// Transform invocation erased over its output type only
#[async_trait]
pub trait ErasedTransformHandler<M: DispatchMessage>: Send + Sync {
    /// Run the transform, producing erased output events
    async fn transform(
        &self,
        input: InputStream<M>,
        ctx: MessageContext,
        tx: mpsc::Sender<StreamEvent>,
        cancellation: CancellationToken,
    ) -> Result<()>;
}

struct TransformAdapter<M, H> {
    handler: Arc<H>,
    _marker: PhantomData<fn(M)>,
}

#[async_trait]
impl<M, H> ErasedTransformHandler<M> for TransformAdapter<M, H>
where
    M: DispatchMessage,
    H: StreamTransformHandler<M>,
{
    async fn transform(
        &self,
        input: InputStream<M>,
        ctx: MessageContext,
        tx: mpsc::Sender<StreamEvent>,
        cancellation: CancellationToken,
    ) -> Result<()> {
        let emitter = StreamEmitter::new(tx, cancellation);
        self.handler.handle(input, &ctx, emitter).await
    }
}

// ============================================================================
// Registry
// ============================================================================

enum Registration {
    Action(Arc<dyn ErasedActionHandler>),
    StreamOut(Arc<dyn ErasedStreamHandler>),
    StreamIn(Arc<dyn Any + Send + Sync>),
    StreamTransform(Arc<dyn Any + Send + Sync>),
    Progress(Arc<dyn Any + Send + Sync>),
}

impl Registration {
    fn shape(&self) -> HandlerShape {
        match self {
            Self::Action(_) => HandlerShape::Action,
            Self::StreamOut(_) => HandlerShape::StreamOut,
            Self::StreamIn(_) => HandlerShape::StreamIn,
            Self::StreamTransform(_) => HandlerShape::StreamTransform,
            Self::Progress(_) => HandlerShape::Progress,
        }
    }
}

/// Maps message types to their registered handler per shape
///
/// A message type may carry one handler per shape; re-registering a shape
/// replaces the previous handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<(TypeId, HandlerShape), Registration>,
    type_names: DashMap<TypeId, &'static str>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn remember_type<M: DispatchMessage>(&self) {
        self.type_names
            .insert(TypeId::of::<M>(), M::message_type());
    }

    /// Register an action handler for `M`
    pub fn register_action<M, H>(&self, handler: H)
    where
        M: DispatchMessage,
        H: ActionHandler<M>,
    {
        self.remember_type::<M>();
        self.handlers.insert(
            (TypeId::of::<M>(), HandlerShape::Action),
            Registration::Action(Arc::new(ActionAdapter::<M, H> {
                handler: Arc::new(handler),
                _marker: PhantomData,
            })),
        );
    }

    /// Register a streaming document handler for `M`
    pub fn register_stream<M, H>(&self, handler: H)
    where
        M: DispatchMessage,
        H: StreamHandler<M>,
    {
        self.remember_type::<M>();
        self.handlers.insert(
            (TypeId::of::<M>(), HandlerShape::StreamOut),
            Registration::StreamOut(Arc::new(StreamOutAdapter::<M, H> {
                handler: Arc::new(handler),
                _marker: PhantomData,
            })),
        );
    }

    /// Register a stream consumer handler for `M`
    pub fn register_stream_consumer<M, H>(&self, handler: H)
    where
        M: DispatchMessage,
        H: StreamConsumerHandler<M>,
    {
        self.remember_type::<M>();
        self.handlers.insert(
            (TypeId::of::<M>(), HandlerShape::StreamIn),
            Registration::StreamIn(Arc::new(ConsumerSlot::<M>(Arc::new(handler)))),
        );
    }

    /// Register a stream transform handler for `M`
    pub fn register_stream_transform<M, H>(&self, handler: H)
    where
        M: DispatchMessage,
        H: StreamTransformHandler<M>,
    {
        self.remember_type::<M>();
        let erased: Arc<dyn ErasedTransformHandler<M>> = Arc::new(TransformAdapter::<M, H> {
            handler: Arc::new(handler),
            _marker: PhantomData,
        });
        self.handlers.insert(
            (TypeId::of::<M>(), HandlerShape::StreamTransform),
            Registration::StreamTransform(Arc::new(TransformSlot::<M>(erased))),
        );
    }

    /// Register a progress handler for `M`
    pub fn register_progress<M, H>(&self, handler: H)
    where
        M: DispatchMessage,
        H: ProgressHandler<M>,
    {
        self.remember_type::<M>();
        self.handlers.insert(
            (TypeId::of::<M>(), HandlerShape::Progress),
            Registration::Progress(Arc::new(ProgressSlot::<M>(Arc::new(handler)))),
        );
    }

    fn missing(&self, type_id: TypeId, shape: HandlerShape) -> DispatchError {
        let message_type = self
            .type_names
            .get(&type_id)
            .map(|name| *name)
            .unwrap_or("<unregistered message type>");
        DispatchError::no_handler(message_type, shape.name())
    }

    /// Resolve the action handler registered for a message type id
    pub fn resolve_action(&self, type_id: TypeId, message_type: &str) -> Result<Arc<dyn ErasedActionHandler>> {
        match self.handlers.get(&(type_id, HandlerShape::Action)) {
            Some(entry) => match entry.value() {
                Registration::Action(handler) => Ok(Arc::clone(handler)),
                _ => Err(DispatchError::no_handler(message_type, HandlerShape::Action.name())),
            },
            None => Err(DispatchError::no_handler(message_type, HandlerShape::Action.name())),
        }
    }

    /// Resolve the stream-out handler for `M`
    pub fn resolve_stream<M: DispatchMessage>(&self) -> Result<Arc<dyn ErasedStreamHandler>> {
        match self.handlers.get(&(TypeId::of::<M>(), HandlerShape::StreamOut)) {
            Some(entry) => match entry.value() {
                Registration::StreamOut(handler) => Ok(Arc::clone(handler)),
                _ => Err(self.missing(TypeId::of::<M>(), HandlerShape::StreamOut)),
            },
            None => Err(DispatchError::no_handler(
                M::message_type(),
                HandlerShape::StreamOut.name(),
            )),
        }
    }

    /// Resolve the stream consumer for `M`
    pub fn resolve_stream_consumer<M: DispatchMessage>(
        &self,
    ) -> Result<Arc<dyn StreamConsumerHandler<M>>> {
        match self.handlers.get(&(TypeId::of::<M>(), HandlerShape::StreamIn)) {
            Some(entry) => match entry.value() {
                Registration::StreamIn(slot) => slot
                    .downcast_ref::<ConsumerSlot<M>>()
                    .map(|slot| Arc::clone(&slot.0))
                    .ok_or_else(|| self.missing(TypeId::of::<M>(), HandlerShape::StreamIn)),
                _ => Err(self.missing(TypeId::of::<M>(), HandlerShape::StreamIn)),
            },
            None => Err(DispatchError::no_handler(
                M::message_type(),
                HandlerShape::StreamIn.name(),
            )),
        }
    }

    /// Resolve the stream transform for `M`
    pub fn resolve_stream_transform<M: DispatchMessage>(
        &self,
    ) -> Result<Arc<dyn ErasedTransformHandler<M>>> {
        match self
            .handlers
            .get(&(TypeId::of::<M>(), HandlerShape::StreamTransform))
        {
            Some(entry) => match entry.value() {
                Registration::StreamTransform(slot) => slot
                    .downcast_ref::<TransformSlot<M>>()
                    .map(|slot| Arc::clone(&slot.0))
                    .ok_or_else(|| self.missing(TypeId::of::<M>(), HandlerShape::StreamTransform)),
                _ => Err(self.missing(TypeId::of::<M>(), HandlerShape::StreamTransform)),
            },
            None => Err(DispatchError::no_handler(
                M::message_type(),
                HandlerShape::StreamTransform.name(),
            )),
        }
    }

    /// Resolve the progress handler for `M`
    pub fn resolve_progress<M: DispatchMessage>(&self) -> Result<Arc<dyn ProgressHandler<M>>> {
        match self.handlers.get(&(TypeId::of::<M>(), HandlerShape::Progress)) {
            Some(entry) => match entry.value() {
                Registration::Progress(slot) => slot
                    .downcast_ref::<ProgressSlot<M>>()
                    .map(|slot| Arc::clone(&slot.0))
                    .ok_or_else(|| self.missing(TypeId::of::<M>(), HandlerShape::Progress)),
                _ => Err(self.missing(TypeId::of::<M>(), HandlerShape::Progress)),
            },
            None => Err(DispatchError::no_handler(
                M::message_type(),
                HandlerShape::Progress.name(),
            )),
        }
    }

    /// The shapes registered for a message type
    pub fn shapes_for(&self, type_id: TypeId) -> Vec<HandlerShape> {
        let mut shapes: Vec<HandlerShape> = self
            .handlers
            .iter()
            .filter(|entry| entry.key().0 == type_id)
            .map(|entry| entry.value().shape())
            .collect();
        shapes.sort_by_key(|shape| shape.name());
        shapes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize)]
    struct EchoCommand {
        text: String,
    }
    impl DispatchMessage for EchoCommand {}

    struct EchoHandler;

    #[async_trait]
    impl ActionHandler<EchoCommand> for EchoHandler {
        type Output = String;

        async fn handle(&self, message: &EchoCommand, _ctx: &MessageContext) -> Result<String> {
            Ok(message.text.clone())
        }
    }

    #[tokio::test]
    async fn test_action_resolution_and_invocation() {
        let registry = HandlerRegistry::new();
        registry.register_action::<EchoCommand, _>(EchoHandler);

        let handler = registry
            .resolve_action(TypeId::of::<EchoCommand>(), EchoCommand::message_type())
            .unwrap();

        let message = excalibur_types::Envelope::new(EchoCommand {
            text: "hi".to_string(),
        })
        .erase();
        let ctx = MessageContext::new(message.message_id);

        let value = handler.invoke(&message, &ctx).await.unwrap();
        assert_eq!(value, "hi");
    }

    #[test]
    fn test_no_handler_error_names_shape() {
        let registry = HandlerRegistry::new();
        let err = registry
            .resolve_action(TypeId::of::<EchoCommand>(), EchoCommand::message_type())
            .unwrap_err();
        assert_eq!(err.error_code(), "NO_HANDLER");
        assert!(err.to_string().contains("action"));
        assert!(err.to_string().contains("EchoCommand"));
    }

    #[test]
    fn test_missing_stream_consumer() {
        let registry = HandlerRegistry::new();
        let err = registry.resolve_stream_consumer::<EchoCommand>().unwrap_err();
        assert!(err.to_string().contains("stream consumer"));
    }
}
