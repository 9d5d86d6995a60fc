//! Progress reporting for long-running document handlers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use excalibur_types::{DispatchError, Result};

/// Sentinel percent value meaning "indeterminate"
pub const PERCENT_INDETERMINATE: f64 = -1.0;

/// A single progress report from a document handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentProgress {
    /// Percent complete in `[-1, 100]`; `-1` denotes indeterminate
    pub percent_complete: f64,
    /// Items processed so far; must not regress within a single run
    pub items_processed: u64,
    /// Total items, when known up front
    pub total_items: Option<u64>,
    /// Human-readable phase label
    pub current_phase: Option<String>,
}

impl DocumentProgress {
    /// A determinate report derived from processed/total counts
    pub fn of(items_processed: u64, total_items: u64) -> Self {
        let percent = if total_items == 0 {
            0.0
        } else {
            (items_processed as f64 / total_items as f64) * 100.0
        };
        Self {
            percent_complete: percent,
            items_processed,
            total_items: Some(total_items),
            current_phase: None,
        }
    }

    /// An indeterminate report
    pub fn indeterminate(items_processed: u64) -> Self {
        Self {
            percent_complete: PERCENT_INDETERMINATE,
            items_processed,
            total_items: None,
            current_phase: None,
        }
    }

    /// Attach a phase label
    pub fn phase(mut self, phase: impl Into<String>) -> Self {
        self.current_phase = Some(phase.into());
        self
    }

    /// Range check on the percent field
    pub fn validate(&self) -> Result<()> {
        if self.percent_complete < PERCENT_INDETERMINATE || self.percent_complete > 100.0 {
            return Err(DispatchError::argument(
                "percent_complete",
                format!("must be in [-1, 100], got {}", self.percent_complete),
            ));
        }
        Ok(())
    }
}

/// Receives progress reports from a handler
pub trait ProgressSink: Send + Sync {
    /// Accept one report
    fn report(&self, progress: DocumentProgress) -> Result<()>;
}

/// Sink wrapper enforcing the per-run reporting rules
///
/// Rejects out-of-range percents and regressions in `items_processed`
/// before the report reaches the inner sink.
pub struct MonotonicSink<'a> {
    inner: &'a dyn ProgressSink,
    last_items: AtomicU64,
}

impl<'a> MonotonicSink<'a> {
    /// Wrap a sink for one handler run
    pub fn new(inner: &'a dyn ProgressSink) -> Self {
        Self {
            inner,
            last_items: AtomicU64::new(0),
        }
    }
}

impl ProgressSink for MonotonicSink<'_> {
    fn report(&self, progress: DocumentProgress) -> Result<()> {
        progress.validate()?;
        let last = self.last_items.load(Ordering::Acquire);
        if progress.items_processed < last {
            return Err(DispatchError::argument(
                "items_processed",
                format!(
                    "must be monotonically non-decreasing within a run: {} after {}",
                    progress.items_processed, last
                ),
            ));
        }
        self.last_items
            .store(progress.items_processed, Ordering::Release);
        self.inner.report(progress)
    }
}

/// Sink collecting reports in memory, for tests and local observation
#[derive(Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<DocumentProgress>>,
}

impl CollectingSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the reports received so far
    pub fn reports(&self) -> Vec<DocumentProgress> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ProgressSink for CollectingSink {
    fn report(&self, progress: DocumentProgress) -> Result<()> {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(progress);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_bounds() {
        assert!(DocumentProgress::of(5, 10).validate().is_ok());
        assert!(DocumentProgress::indeterminate(3).validate().is_ok());

        let bad = DocumentProgress {
            percent_complete: 101.0,
            items_processed: 0,
            total_items: None,
            current_phase: None,
        };
        assert!(bad.validate().is_err());

        let bad = DocumentProgress {
            percent_complete: -2.0,
            items_processed: 0,
            total_items: None,
            current_phase: None,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_monotonic_sink_rejects_regression() {
        let collecting = CollectingSink::new();
        let sink = MonotonicSink::new(&collecting);

        sink.report(DocumentProgress::of(3, 10)).unwrap();
        sink.report(DocumentProgress::of(7, 10)).unwrap();
        let err = sink.report(DocumentProgress::of(5, 10)).unwrap_err();
        assert_eq!(err.error_code(), "ARGUMENT_INVALID");

        // Only the accepted reports reached the inner sink.
        assert_eq!(collecting.reports().len(), 2);
    }

    #[test]
    fn test_zero_total_is_zero_percent() {
        let progress = DocumentProgress::of(0, 0);
        assert_eq!(progress.percent_complete, 0.0);
    }
}
