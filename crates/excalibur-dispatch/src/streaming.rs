//! Streaming plumbing for document handlers
//!
//! Streaming handlers run as producer tasks writing into a bounded
//! channel; the consumer's read rate bounds the producer, so nothing
//! buffers an entire stream. Cancellation is observed at every yield
//! point and surfaces as a `cancelled` error item rather than a silent
//! truncation.

use std::marker::PhantomData;

use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use excalibur_types::{DispatchError, Result};

/// Bound on in-flight items between a streaming producer and its consumer
pub const STREAM_CHANNEL_CAPACITY: usize = 16;

/// One element of an output stream: an item or the error that ended it
pub type StreamEvent = std::result::Result<serde_json::Value, DispatchError>;

/// Typed yield handle given to stream-producing handlers
///
/// Each yield suspends until the consumer has capacity.
pub struct StreamEmitter<T> {
    tx: mpsc::Sender<StreamEvent>,
    cancellation: CancellationToken,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> StreamEmitter<T> {
    pub(crate) fn new(tx: mpsc::Sender<StreamEvent>, cancellation: CancellationToken) -> Self {
        Self {
            tx,
            cancellation,
            _marker: PhantomData,
        }
    }

    /// Yield one item to the consumer
    ///
    /// Returns a `cancelled` error when the host token fired or the
    /// consumer went away; the handler should stop producing.
    pub async fn yield_item(&self, item: T) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        let value = serde_json::to_value(item)?;
        tokio::select! {
            sent = self.tx.send(Ok(value)) => {
                sent.map_err(|_| DispatchError::Cancelled)
            }
            _ = self.cancellation.cancelled() => Err(DispatchError::Cancelled),
        }
    }

    /// True when the host cancelled this stream
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Consumer end of a handler-produced stream
///
/// A completed stream keeps returning `None`; streams are not
/// restartable.
pub struct MessageStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl MessageStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next item, or `None` at end-of-stream
    pub async fn next(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drain the remaining items into a vector (tests and small streams)
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut items = Vec::new();
        while let Some(event) = self.next().await {
            items.push(event);
        }
        items
    }

    /// Adapt into a `futures` stream
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> {
        let mut rx = self.rx;
        async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(token: &CancellationToken) -> (StreamEmitter<u32>, MessageStream) {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        (
            StreamEmitter::new(tx, token.clone()),
            MessageStream::new(rx),
        )
    }

    #[tokio::test]
    async fn test_emitter_yields_until_cancelled() {
        let token = CancellationToken::new();
        let (emitter, mut stream) = channel(&token);

        emitter.yield_item(1).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), 1);

        token.cancel();
        let err = emitter.yield_item(2).await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_completed_stream_stays_ended() {
        let token = CancellationToken::new();
        let (emitter, mut stream) = channel(&token);

        emitter.yield_item(7).await.unwrap();
        drop(emitter);

        assert_eq!(stream.next().await.unwrap().unwrap(), 7);
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_bounded_channel_applies_backpressure() {
        let token = CancellationToken::new();
        let (emitter, mut stream) = channel(&token);

        let producer = tokio::spawn(async move {
            for i in 0..(STREAM_CHANNEL_CAPACITY as u32 * 4) {
                emitter.yield_item(i).await.unwrap();
            }
        });

        // Slow consumer still sees every item in order.
        let mut expected = 0u32;
        while let Some(event) = stream.next().await {
            assert_eq!(event.unwrap(), expected);
            expected += 1;
        }
        assert_eq!(expected, STREAM_CHANNEL_CAPACITY as u32 * 4);
        producer.await.unwrap();
    }
}
