//! The dispatch front-end
//!
//! Ties the pipeline invoker and the handler registry together and
//! exposes one entry point per invocation shape. Action and progress
//! dispatches run the full middleware chain; stream-producing dispatches
//! run the chain around stream creation, so a short-circuiting middleware
//! prevents the producer from ever starting.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use excalibur_types::{
    DispatchError, DispatchMessage, DispatchResult, DynMessage, Envelope, MessageContext, Result,
};

use crate::handler::{ErasedStreamHandler, HandlerRegistry, InputStream};
use crate::middleware::{FinalDelegate, FinalFn};
use crate::pipeline::PipelineInvoker;
use crate::progress::{MonotonicSink, ProgressSink};
use crate::streaming::{MessageStream, StreamEvent, STREAM_CHANNEL_CAPACITY};

/// Final delegate resolving and invoking the registered action handler
struct ActionFinal {
    registry: Arc<HandlerRegistry>,
}

#[async_trait]
impl FinalDelegate for ActionFinal {
    async fn run(&self, message: &DynMessage, ctx: &MessageContext) -> DispatchResult {
        let handler = match self
            .registry
            .resolve_action(message.body_type_id(), message.message_type)
        {
            Ok(handler) => handler,
            Err(err) => return DispatchResult::failed(err),
        };
        match handler.invoke(message, ctx).await {
            Ok(value) => DispatchResult {
                success: true,
                return_value: Some(value),
                error: None,
            },
            Err(err) => DispatchResult::failed(err),
        }
    }
}

/// Final delegate spawning a stream producer task
struct StreamOutFinal {
    handler: Arc<dyn ErasedStreamHandler>,
    tx: tokio::sync::mpsc::Sender<StreamEvent>,
    cancellation: CancellationToken,
}

#[async_trait]
impl FinalDelegate for StreamOutFinal {
    async fn run(&self, message: &DynMessage, ctx: &MessageContext) -> DispatchResult {
        let handler = Arc::clone(&self.handler);
        let tx = self.tx.clone();
        let cancellation = self.cancellation.clone();
        let message = message.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let error_tx = tx.clone();
            if let Err(err) = handler.produce(message, ctx, tx, cancellation).await {
                // Items already yielded stay delivered; the failure arrives
                // after them, then the stream ends.
                let _ = error_tx.send(Err(err)).await;
            }
        });
        DispatchResult::ok_empty()
    }
}

/// Message dispatcher
#[derive(Clone)]
pub struct Dispatcher {
    invoker: Arc<PipelineInvoker>,
    registry: Arc<HandlerRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher over an invoker and a registry
    pub fn new(invoker: Arc<PipelineInvoker>, registry: Arc<HandlerRegistry>) -> Self {
        Self { invoker, registry }
    }

    /// The handler registry
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// The pipeline invoker
    pub fn invoker(&self) -> &Arc<PipelineInvoker> {
        &self.invoker
    }

    /// Dispatch an action-shaped message through the pipeline
    pub async fn send<M>(
        &self,
        envelope: Envelope<M>,
        ctx: &MessageContext,
        cancellation: &CancellationToken,
    ) -> DispatchResult
    where
        M: DispatchMessage + Serialize,
    {
        let message = envelope.erase();
        debug!(message_type = message.message_type, kind = %message.kind, "dispatching");
        let final_delegate = ActionFinal {
            registry: Arc::clone(&self.registry),
        };
        self.invoker
            .invoke(&message, ctx, &final_delegate, cancellation)
            .await
    }

    /// Open an output stream from a streaming document handler
    ///
    /// The middleware chain runs around stream creation; a short-circuit
    /// surfaces as the returned error and no producer is started.
    pub async fn open_stream<M>(
        &self,
        envelope: Envelope<M>,
        ctx: &MessageContext,
        cancellation: &CancellationToken,
    ) -> Result<MessageStream>
    where
        M: DispatchMessage + Serialize,
    {
        let handler = self.registry.resolve_stream::<M>()?;
        let message = envelope.erase();
        let (tx, rx) = tokio::sync::mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let final_delegate = StreamOutFinal {
            handler,
            tx,
            cancellation: cancellation.clone(),
        };
        let result = self
            .invoker
            .invoke(&message, ctx, &final_delegate, cancellation)
            .await;
        match result.error {
            Some(err) => Err(err),
            None => Ok(MessageStream::new(rx)),
        }
    }

    /// Feed an input stream to its registered consumer handler
    ///
    /// Cancellation interrupts the consumer between items and surfaces as
    /// a `cancelled` error rather than a silent truncation.
    pub async fn send_stream<M>(
        &self,
        input: InputStream<M>,
        ctx: &MessageContext,
        cancellation: &CancellationToken,
    ) -> Result<()>
    where
        M: DispatchMessage,
    {
        let handler = self.registry.resolve_stream_consumer::<M>()?;
        tokio::select! {
            outcome = handler.handle(input, ctx) => outcome,
            _ = cancellation.cancelled() => Err(DispatchError::Cancelled),
        }
    }

    /// Run an input stream through its registered transform handler
    pub async fn transform_stream<M>(
        &self,
        input: InputStream<M>,
        ctx: &MessageContext,
        cancellation: &CancellationToken,
    ) -> Result<MessageStream>
    where
        M: DispatchMessage,
    {
        let handler = self.registry.resolve_stream_transform::<M>()?;
        let (tx, rx) = tokio::sync::mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let ctx = ctx.clone();
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            let error_tx = tx.clone();
            if let Err(err) = handler.transform(input, ctx, tx, cancellation).await {
                let _ = error_tx.send(Err(err)).await;
            }
        });
        Ok(MessageStream::new(rx))
    }

    /// Dispatch a document to its progress handler
    ///
    /// The sink is wrapped per run to enforce the progress reporting
    /// rules (percent range, non-decreasing `items_processed`).
    pub async fn send_with_progress<M>(
        &self,
        envelope: Envelope<M>,
        sink: &dyn ProgressSink,
        ctx: &MessageContext,
        cancellation: &CancellationToken,
    ) -> DispatchResult
    where
        M: DispatchMessage + Serialize,
    {
        let handler = match self.registry.resolve_progress::<M>() {
            Ok(handler) => handler,
            Err(err) => return DispatchResult::failed(err),
        };
        let message = envelope.erase();
        let guarded = MonotonicSink::new(sink);
        let final_delegate = FinalFn(|message: DynMessage, ctx: MessageContext| {
            let handler = Arc::clone(&handler);
            let guarded = &guarded;
            async move {
                let body = match message.body_as::<M>() {
                    Some(body) => body,
                    None => {
                        return DispatchResult::failed(DispatchError::internal(
                            "progress message body type mismatch",
                        ))
                    }
                };
                match handler.handle(body, guarded, &ctx).await {
                    Ok(()) => DispatchResult::ok_empty(),
                    Err(err) => DispatchResult::failed(err),
                }
            }
        });
        self.invoker
            .invoke(&message, ctx, &final_delegate, cancellation)
            .await
    }
}
