//! Journal drain
//!
//! A long-running service pushing newly appended audit events to the
//! collector. The pump keeps a cursor (the last exported event id, which
//! sorts by append time) and advances it only when a batch is accepted,
//! so transient collector outages replay from the same position on the
//! next poll.

use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use excalibur_audit::{AuditJournal, AuditQuery};
use excalibur_types::{AuditEventId, Result};

use crate::exporter::HecAuditExporter;

/// Pump options
#[derive(Debug, Clone)]
pub struct ExportPumpOptions {
    /// Poll cadence
    pub poll_interval: std::time::Duration,
    /// Events fetched per poll
    pub batch_limit: usize,
}

impl Default for ExportPumpOptions {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(5),
            batch_limit: 100,
        }
    }
}

/// Pump position: how many events have been exported, and the id of the
/// last one as a duplicate guard
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    exported: usize,
    last_id: Option<AuditEventId>,
}

/// Drains the audit journal into a SIEM exporter
pub struct AuditExportPump {
    journal: Arc<dyn AuditJournal>,
    exporter: Arc<HecAuditExporter>,
    options: ExportPumpOptions,
    cursor: RwLock<Cursor>,
}

impl AuditExportPump {
    /// Create a pump between a journal and an exporter
    pub fn new(journal: Arc<dyn AuditJournal>, exporter: Arc<HecAuditExporter>) -> Self {
        Self {
            journal,
            exporter,
            options: ExportPumpOptions::default(),
            cursor: RwLock::new(Cursor::default()),
        }
    }

    /// Replace the options
    pub fn with_options(mut self, options: ExportPumpOptions) -> Self {
        self.options = options;
        self
    }

    /// Run until cancelled; the in-flight batch finishes before exit
    pub async fn run(&self, cancellation: CancellationToken) {
        info!(
            poll_interval_ms = self.options.poll_interval.as_millis() as u64,
            "audit export pump started"
        );
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => break,
                _ = tokio::time::sleep(self.options.poll_interval) => {
                    if let Err(err) = self.drain_once().await {
                        warn!(error = %err, "audit export cycle failed");
                    }
                }
            }
        }
        info!("service-stopped");
    }

    /// One drain cycle: fetch events past the cursor, export, advance
    pub async fn drain_once(&self) -> Result<usize> {
        let cursor = *self.cursor.read().await;

        let query = AuditQuery {
            sort_descending: false,
            skip: cursor.exported,
            max_results: self.options.batch_limit,
            ..AuditQuery::default()
        };
        let batch: Vec<_> = self
            .journal
            .query(&query)
            .await?
            .into_iter()
            .filter(|event| cursor.last_id.map_or(true, |last| event.event_id > last))
            .collect();
        if batch.is_empty() {
            return Ok(0);
        }

        let result = self.exporter.export_batch(&batch).await;
        if result.all_succeeded() {
            let last = batch.iter().map(|event| event.event_id).max();
            let mut cursor = self.cursor.write().await;
            cursor.exported += batch.len();
            cursor.last_id = last;
            debug!(count = batch.len(), "audit events exported");
            Ok(batch.len())
        } else {
            // The cursor stays; the whole batch replays next cycle.
            warn!(
                failed = result.failed_count,
                "audit export batch failed, will replay"
            );
            Ok(result.success_count)
        }
    }
}
