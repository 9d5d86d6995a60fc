//! Saga timeout delivery
//!
//! A long-running service polling the timeout subtable. Each due row is
//! reconstructed into a typed message and dispatched with a fresh context
//! carrying the saga id as correlation. Transient dispatch failures leave
//! the row for the next poll; resolution and decode failures retry with
//! exponential backoff until the attempt budget is spent, after which the
//! row is dead-lettered and observers are notified.

use async_trait::async_trait;
use chrono::Duration;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use excalibur_types::{
    Clock, DispatchError, MessageContext, MessageId, Result, SharedClock, SystemClock,
};

use crate::state::SagaTimeout;
use crate::store::SagaStore;

/// Timeout delivery options
#[derive(Debug, Clone)]
pub struct TimeoutDeliveryOptions {
    /// Poll cadence
    pub poll_interval: std::time::Duration,
    /// Rows fetched per poll
    pub batch_limit: usize,
    /// Attempt budget for resolution/decode failures
    pub max_attempts: u32,
    /// Base delay for the exponential backoff between attempts
    pub retry_base_delay: std::time::Duration,
    /// Wall-clock budget for a single delivery
    pub item_timeout: std::time::Duration,
}

impl Default for TimeoutDeliveryOptions {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(1),
            batch_limit: 100,
            max_attempts: 5,
            retry_base_delay: std::time::Duration::from_secs(1),
            item_timeout: std::time::Duration::from_secs(60),
        }
    }
}

/// Reconstructs typed messages from persisted rows
///
/// Serialization format choice stays outside the core; the JSON codec is
/// the default binding.
pub trait PayloadCodec: Send + Sync {
    /// Decode a payload for a known message type
    ///
    /// Fails with a resolution error for unknown types and a
    /// serialization error for undecodable payloads.
    fn decode(&self, message_type: &str, payload: &str) -> Result<serde_json::Value>;
}

/// JSON payload codec over an explicit registry of known message types
#[derive(Default)]
pub struct JsonPayloadCodec {
    known_types: HashSet<String>,
}

impl JsonPayloadCodec {
    /// Create an empty codec
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resolvable message type name
    pub fn register_type(mut self, message_type: impl Into<String>) -> Self {
        self.known_types.insert(message_type.into());
        self
    }
}

impl PayloadCodec for JsonPayloadCodec {
    fn decode(&self, message_type: &str, payload: &str) -> Result<serde_json::Value> {
        if !self.known_types.contains(message_type) {
            return Err(DispatchError::argument(
                "message_type",
                format!("unresolvable timeout message type {}", message_type),
            ));
        }
        serde_json::from_str(payload)
            .map_err(|err| DispatchError::serialization(err.to_string()))
    }
}

/// Dispatch seam the service pushes reconstructed messages through
#[async_trait]
pub trait TimeoutDispatcher: Send + Sync {
    /// Dispatch one reconstructed timeout message
    async fn dispatch(
        &self,
        message_type: &str,
        payload: serde_json::Value,
        ctx: MessageContext,
    ) -> Result<()>;
}

/// Observer notified when a timeout is dead-lettered
pub trait DeadLetterObserver: Send + Sync {
    /// Called after the row moved to the dead-letter state
    fn on_dead_letter(&self, timeout: &SagaTimeout, reason: &str);
}

/// Observer that only logs
#[derive(Default)]
pub struct LoggingDeadLetterObserver;

impl DeadLetterObserver for LoggingDeadLetterObserver {
    fn on_dead_letter(&self, timeout: &SagaTimeout, reason: &str) {
        error!(
            timeout_id = %timeout.timeout_id,
            saga_id = %timeout.saga_id,
            reason,
            "saga timeout dead-lettered"
        );
    }
}

/// The timeout delivery service
pub struct TimeoutDeliveryService {
    store: Arc<dyn SagaStore>,
    dispatcher: Arc<dyn TimeoutDispatcher>,
    codec: Arc<dyn PayloadCodec>,
    observer: Arc<dyn DeadLetterObserver>,
    options: TimeoutDeliveryOptions,
    clock: SharedClock,
}

impl TimeoutDeliveryService {
    /// Create a service with default options and the system clock
    pub fn new(
        store: Arc<dyn SagaStore>,
        dispatcher: Arc<dyn TimeoutDispatcher>,
        codec: Arc<dyn PayloadCodec>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            codec,
            observer: Arc::new(LoggingDeadLetterObserver),
            options: TimeoutDeliveryOptions::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the options
    pub fn with_options(mut self, options: TimeoutDeliveryOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the dead-letter observer
    pub fn with_observer(mut self, observer: Arc<dyn DeadLetterObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Run the poll loop until cancelled
    ///
    /// The in-flight delivery finishes before the loop exits; a
    /// `service-stopped` record is logged once drained.
    pub async fn run(&self, cancellation: CancellationToken) {
        info!(
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            "timeout delivery service started"
        );
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = tokio::time::sleep(self.options.poll_interval) => {
                    if let Err(err) = self.poll_once(&cancellation).await {
                        warn!(error = %err, "timeout poll cycle failed");
                    }
                }
            }
        }
        info!("service-stopped");
    }

    /// One poll cycle: fetch due rows and deliver them in due order
    pub async fn poll_once(&self, cancellation: &CancellationToken) -> Result<()> {
        let now = self.clock.now_utc();
        let due = self
            .store
            .poll_due(now, self.options.batch_limit)
            .await?;
        debug!(count = due.len(), "due timeouts polled");

        for timeout in due {
            // Finish the current delivery, then honor cancellation.
            self.deliver(&timeout).await?;
            if cancellation.is_cancelled() {
                break;
            }
        }
        Ok(())
    }

    async fn deliver(&self, timeout: &SagaTimeout) -> Result<()> {
        let payload = match self
            .codec
            .decode(&timeout.message_type, &timeout.serialized_payload)
        {
            Ok(payload) => payload,
            Err(err) => {
                return self.record_failed_attempt(timeout, &err).await;
            }
        };

        let mut ctx = MessageContext::new(MessageId::new());
        ctx.set_correlation_id(timeout.saga_id.to_string());

        let dispatch = tokio::time::timeout(
            self.options.item_timeout,
            self.dispatcher
                .dispatch(&timeout.message_type, payload, ctx),
        )
        .await;

        match dispatch {
            Ok(Ok(())) => {
                self.store
                    .mark_delivered(&timeout.timeout_id, self.clock.now_utc())
                    .await?;
                debug!(timeout_id = %timeout.timeout_id, "timeout delivered");
                Ok(())
            }
            Ok(Err(err)) if err.is_retriable() => {
                // Transient dispatch failure: the row stays for the next poll.
                warn!(
                    timeout_id = %timeout.timeout_id,
                    error = %err,
                    "transient delivery failure, leaving row"
                );
                Ok(())
            }
            Ok(Err(err)) => self.record_failed_attempt(timeout, &err).await,
            Err(_elapsed) => {
                let err = DispatchError::TransientNetwork {
                    reason: format!(
                        "delivery exceeded item timeout of {:?}",
                        self.options.item_timeout
                    ),
                    status_code: None,
                };
                warn!(timeout_id = %timeout.timeout_id, error = %err, "delivery timed out");
                Ok(())
            }
        }
    }

    /// Record a hard delivery failure with backoff, dead-lettering once
    /// the attempt budget is spent
    async fn record_failed_attempt(
        &self,
        timeout: &SagaTimeout,
        err: &DispatchError,
    ) -> Result<()> {
        let attempts_so_far = timeout.attempts;
        let backoff_secs = self.options.retry_base_delay.as_secs().max(1)
            * 2u64.saturating_pow(attempts_so_far);
        let next_due = self.clock.now_utc() + Duration::seconds(backoff_secs as i64);

        let attempts = self
            .store
            .record_delivery_error(&timeout.timeout_id, &err.to_string(), next_due)
            .await?;

        if attempts >= self.options.max_attempts {
            self.store.dead_letter(&timeout.timeout_id).await?;
            self.observer.on_dead_letter(timeout, &err.to_string());
        } else {
            warn!(
                timeout_id = %timeout.timeout_id,
                attempts,
                error = %err,
                "delivery attempt failed, backing off"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SagaTimeout;
    use crate::store::InMemorySagaStore;
    use chrono::Utc;
    use excalibur_types::SagaId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedDispatcher {
        calls: AtomicUsize,
        failures_before_success: usize,
    }

    #[async_trait]
    impl TimeoutDispatcher for ScriptedDispatcher {
        async fn dispatch(
            &self,
            _message_type: &str,
            _payload: serde_json::Value,
            _ctx: MessageContext,
        ) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(DispatchError::TransientNetwork {
                    reason: "broker unavailable".to_string(),
                    status_code: Some(503),
                })
            } else {
                Ok(())
            }
        }
    }

    struct RecordingObserver {
        dead: Mutex<Vec<String>>,
    }

    impl DeadLetterObserver for RecordingObserver {
        fn on_dead_letter(&self, timeout: &SagaTimeout, _reason: &str) {
            self.dead
                .lock()
                .unwrap()
                .push(timeout.timeout_id.to_string());
        }
    }

    fn service(
        store: Arc<InMemorySagaStore>,
        dispatcher: Arc<dyn TimeoutDispatcher>,
        known_type: &str,
    ) -> TimeoutDeliveryService {
        TimeoutDeliveryService::new(
            store,
            dispatcher,
            Arc::new(JsonPayloadCodec::new().register_type(known_type)),
        )
    }

    #[tokio::test]
    async fn test_redelivery_after_transient_failure_delivers_exactly_once() {
        let store = Arc::new(InMemorySagaStore::new());
        let dispatcher = Arc::new(ScriptedDispatcher {
            calls: AtomicUsize::new(0),
            failures_before_success: 1,
        });
        let svc = service(store.clone(), dispatcher.clone(), "OrderTimeout");

        let timeout = SagaTimeout::new(SagaId::new(), Utc::now(), "OrderTimeout", "{}");
        store.schedule_timeout(timeout).await.unwrap();

        // First poll: transient failure leaves the row.
        svc.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            store.poll_due(Utc::now(), 10).await.unwrap().len(),
            1,
            "row must reappear after a transient failure"
        );

        // Second poll: success marks delivered.
        svc.poll_once(&CancellationToken::new()).await.unwrap();
        assert!(store.poll_due(Utc::now(), 10).await.unwrap().is_empty());

        // Third poll: nothing to deliver.
        svc.poll_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unresolvable_type_dead_letters_after_attempts() {
        let store = Arc::new(InMemorySagaStore::new());
        let dispatcher = Arc::new(ScriptedDispatcher {
            calls: AtomicUsize::new(0),
            failures_before_success: 0,
        });
        let observer = Arc::new(RecordingObserver {
            dead: Mutex::new(Vec::new()),
        });
        let svc = service(store.clone(), dispatcher, "KnownType")
            .with_options(TimeoutDeliveryOptions {
                max_attempts: 2,
                retry_base_delay: std::time::Duration::from_secs(0),
                ..TimeoutDeliveryOptions::default()
            })
            .with_observer(observer.clone());

        let timeout = SagaTimeout::new(SagaId::new(), Utc::now(), "UnknownType", "{}");
        let id = timeout.timeout_id.clone();
        store.schedule_timeout(timeout).await.unwrap();

        svc.poll_once(&CancellationToken::new()).await.unwrap();
        // Backoff pushed the row out; poll far in the future to retry.
        let later = Utc::now() + Duration::seconds(3600);
        let due = store.poll_due(later, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 1);

        // Second attempt exhausts the budget.
        let row = due.into_iter().next().unwrap();
        svc.deliver(&row).await.unwrap();

        assert!(store.poll_due(later, 10).await.unwrap().is_empty());
        assert_eq!(observer.dead.lock().unwrap().as_slice(), &[id.to_string()]);
    }

    #[tokio::test]
    async fn test_undecodable_payload_counts_as_failed_attempt() {
        let store = Arc::new(InMemorySagaStore::new());
        let dispatcher = Arc::new(ScriptedDispatcher {
            calls: AtomicUsize::new(0),
            failures_before_success: 0,
        });
        let svc = service(store.clone(), dispatcher, "OrderTimeout");

        let timeout = SagaTimeout::new(SagaId::new(), Utc::now(), "OrderTimeout", "not-json");
        store.schedule_timeout(timeout).await.unwrap();

        svc.poll_once(&CancellationToken::new()).await.unwrap();
        let later = Utc::now() + Duration::seconds(3600);
        let due = store.poll_due(later, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 1);
        assert!(due[0].last_error.is_some());
    }
}
