//! HEC-style audit export
//!
//! Events are wrapped in the collector envelope and pushed over a
//! transport seam; batches are newline-joined with no trailing newline.
//! Non-2xx statuses classify as transient ({408, 429, 500, 502, 503,
//! 504}) or permanent; network failures and timeouts are transient.
//! Transient failures retry with exponential backoff up to the configured
//! budget, permanent failures never retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use excalibur_audit::AuditEvent;
use excalibur_types::AuditEventId;

use crate::config::HecExporterConfig;

/// Status codes that warrant a retry
const TRANSIENT_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Status codes a health probe accepts as "endpoint reachable"
const HEALTHY_PROBE_STATUS_CODES: [u16; 3] = [200, 400, 405];

/// A transport-level response
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body, for diagnostics
    pub body: String,
}

/// Transport failure, always treated as transient
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection-level failure
    #[error("network error: {0}")]
    Network(String),
    /// The request exceeded its timeout
    #[error("request timed out")]
    Timeout,
}

/// The wire seam the exporter pushes through
#[async_trait]
pub trait HecTransport: Send + Sync {
    /// POST a payload with headers; returns the endpoint's response
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: String,
        timeout: std::time::Duration,
    ) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport
pub struct HttpHecTransport {
    client: reqwest::Client,
}

impl HttpHecTransport {
    /// Build a transport honoring the TLS validation setting
    pub fn new(config: &HecExporterConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.validate_certificate)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HecTransport for HttpHecTransport {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: String,
        timeout: std::time::Duration,
    ) -> Result<TransportResponse, TransportError> {
        let mut request = self.client.post(url).timeout(timeout).body(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Network(err.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(TransportResponse { status, body })
    }
}

/// Outcome of exporting one event
#[derive(Debug, Clone)]
pub struct ExportResult {
    /// Whether the event reached the collector
    pub success: bool,
    /// The exported event
    pub event_id: AuditEventId,
    /// When the export concluded
    pub exported_at: DateTime<Utc>,
    /// Failure detail
    pub error_message: Option<String>,
    /// Whether the failure was transient (already retried)
    pub is_transient_error: bool,
}

/// One failed event inside a batch
#[derive(Debug, Clone)]
pub struct BatchExportError {
    /// The failed event
    pub event_id: AuditEventId,
    /// Failure detail
    pub message: String,
    /// Whether the failure was transient
    pub is_transient: bool,
}

/// Outcome of a batch export
#[derive(Debug, Clone)]
pub struct BatchExportResult {
    /// Events submitted
    pub total_count: usize,
    /// Events accepted
    pub success_count: usize,
    /// Events rejected
    pub failed_count: usize,
    /// Ids of the rejected events
    pub failed_event_ids: Vec<AuditEventId>,
    /// Per-event failure detail
    pub errors: Vec<BatchExportError>,
}

impl BatchExportResult {
    /// True when every event was accepted
    pub fn all_succeeded(&self) -> bool {
        self.failed_count == 0
    }
}

/// Outcome of a health probe
#[derive(Debug, Clone)]
pub struct HealthResult {
    /// Whether the endpoint is reachable
    pub is_healthy: bool,
    /// Probed endpoint
    pub endpoint: String,
    /// Round-trip latency, when the probe got a response
    pub latency_ms: Option<u64>,
    /// Human-readable probe detail
    pub diagnostics: String,
}

/// Classify a non-2xx status
fn is_transient_status(status: u16) -> bool {
    TRANSIENT_STATUS_CODES.contains(&status)
}

/// HEC-style audit exporter
pub struct HecAuditExporter {
    config: HecExporterConfig,
    transport: Arc<dyn HecTransport>,
}

impl HecAuditExporter {
    /// Create an exporter over an explicit transport
    pub fn new(config: HecExporterConfig, transport: Arc<dyn HecTransport>) -> Self {
        Self { config, transport }
    }

    /// Create an exporter with the reqwest transport
    pub fn with_http_transport(config: HecExporterConfig) -> Result<Self, reqwest::Error> {
        let transport = Arc::new(HttpHecTransport::new(&config)?);
        Ok(Self::new(config, transport))
    }

    /// The collector envelope wrapping one event
    fn envelope(&self, event: &AuditEvent) -> serde_json::Value {
        serde_json::json!({
            "host": self.config.effective_host(),
            "source": self.config.effective_source(),
            "sourcetype": self.config.source_type,
            "index": self.config.index,
            "event": event,
        })
    }

    /// Newline-joined batch payload, no trailing newline
    fn batch_payload(&self, events: &[AuditEvent]) -> String {
        events
            .iter()
            .map(|event| self.envelope(event).to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            (
                "Authorization".to_string(),
                self.config.authorization_header(),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        if self.config.use_ack {
            if let Some(channel) = &self.config.channel {
                headers.push(("X-Splunk-Request-Channel".to_string(), channel.clone()));
            }
        }
        headers
    }

    /// Send one payload with transient-retry semantics
    ///
    /// Returns `Ok(())` on acceptance; `Err((message, is_transient))`
    /// once retries are exhausted or a permanent failure appears.
    async fn send_with_retry(&self, payload: String) -> Result<(), (String, bool)> {
        let mut attempt = 0u32;
        loop {
            let outcome = self
                .transport
                .post(
                    &self.config.endpoint,
                    &self.headers(),
                    payload.clone(),
                    self.config.request_timeout,
                )
                .await;

            let (message, transient) = match outcome {
                Ok(response) if (200..300).contains(&response.status) => return Ok(()),
                Ok(response) => (
                    format!("endpoint returned {}: {}", response.status, response.body),
                    is_transient_status(response.status),
                ),
                Err(err) => (err.to_string(), true),
            };

            if !transient {
                return Err((message, false));
            }
            if attempt >= self.config.max_retry_attempts {
                return Err((message, true));
            }
            attempt += 1;
            let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt - 1);
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %message, "transient export failure, retrying");
            tokio::time::sleep(delay).await;
        }
    }

    /// Export a single event
    pub async fn export(&self, event: &AuditEvent) -> ExportResult {
        let payload = self.envelope(event).to_string();
        match self.send_with_retry(payload).await {
            Ok(()) => {
                debug!(event_id = %event.event_id, "audit event exported");
                ExportResult {
                    success: true,
                    event_id: event.event_id,
                    exported_at: Utc::now(),
                    error_message: None,
                    is_transient_error: false,
                }
            }
            Err((message, transient)) => ExportResult {
                success: false,
                event_id: event.event_id,
                exported_at: Utc::now(),
                error_message: Some(message),
                is_transient_error: transient,
            },
        }
    }

    /// Export a batch, chunked to the backend's batch size
    ///
    /// A chunk failure fails every event in that chunk; other chunks
    /// still attempt.
    pub async fn export_batch(&self, events: &[AuditEvent]) -> BatchExportResult {
        let mut result = BatchExportResult {
            total_count: events.len(),
            success_count: 0,
            failed_count: 0,
            failed_event_ids: Vec::new(),
            errors: Vec::new(),
        };

        for chunk in events.chunks(self.config.max_batch_size.max(1)) {
            let payload = self.batch_payload(chunk);
            match self.send_with_retry(payload).await {
                Ok(()) => result.success_count += chunk.len(),
                Err((message, transient)) => {
                    result.failed_count += chunk.len();
                    for event in chunk {
                        result.failed_event_ids.push(event.event_id);
                        result.errors.push(BatchExportError {
                            event_id: event.event_id,
                            message: message.clone(),
                            is_transient: transient,
                        });
                    }
                }
            }
        }
        result
    }

    /// Probe the endpoint
    ///
    /// {200, 400, 405} count as healthy: the endpoint is reachable even
    /// when it rejects the probe method.
    pub async fn check_health(&self) -> HealthResult {
        let started = Instant::now();
        let outcome = self
            .transport
            .post(
                &self.config.endpoint,
                &self.headers(),
                String::new(),
                self.config.request_timeout,
            )
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) if HEALTHY_PROBE_STATUS_CODES.contains(&response.status) => HealthResult {
                is_healthy: true,
                endpoint: self.config.endpoint.clone(),
                latency_ms: Some(latency_ms),
                diagnostics: format!("endpoint answered {}", response.status),
            },
            Ok(response) => HealthResult {
                is_healthy: false,
                endpoint: self.config.endpoint.clone(),
                latency_ms: Some(latency_ms),
                diagnostics: format!("endpoint answered {}", response.status),
            },
            Err(err) => HealthResult {
                is_healthy: false,
                endpoint: self.config.endpoint.clone(),
                latency_ms: None,
                diagnostics: err.to_string(),
            },
        }
    }
}
