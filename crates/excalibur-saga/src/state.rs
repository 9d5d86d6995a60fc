//! Saga instance state
//!
//! A saga instance is a persisted state machine: a status, an opaque
//! payload, and an ordered step history. The `version` field carries the
//! optimistic concurrency token; every persisted change must increase it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use excalibur_types::{SagaId, TimeoutId};

/// Saga lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaStatus {
    /// Created but not yet started
    Pending,
    /// Executing steps
    Running,
    /// All steps completed
    Completed,
    /// Terminal failure (a compensation failed, or none was possible)
    Failed,
    /// Rolling back completed steps
    Compensating,
    /// Rollback finished cleanly
    Compensated,
    /// Cancelled by the host
    Cancelled,
}

impl SagaStatus {
    /// True for states no transition leaves
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Compensated | Self::Cancelled
        )
    }
}

/// Outcome of a recorded step or compensation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// Step executed successfully
    Completed,
    /// Step raised a failure
    Failed,
    /// Compensation executed successfully
    Compensated,
    /// Compensation raised a failure (walk continues regardless)
    CompensationFailed,
    /// Compensation skipped because the step declares none
    Skipped,
    /// Step interrupted by host cancellation
    Cancelled,
}

/// One entry in a saga's step history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step name from the definition
    pub step_name: String,
    /// When execution of this record began
    pub started_at: DateTime<Utc>,
    /// When it finished; `None` marks the active step
    pub completed_at: Option<DateTime<Utc>>,
    /// Result, once finished
    pub outcome: Option<StepOutcome>,
    /// True when this record is a compensation of an earlier step
    pub is_compensation: bool,
    /// Failure detail, when the outcome was a failure
    pub error: Option<String>,
}

impl StepRecord {
    /// Start a new execution record
    pub fn started(step_name: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            step_name: step_name.into(),
            started_at: at,
            completed_at: None,
            outcome: None,
            is_compensation: false,
            error: None,
        }
    }

    /// Mark the record finished
    pub fn finish(&mut self, outcome: StepOutcome, at: DateTime<Utc>, error: Option<String>) {
        self.completed_at = Some(at);
        self.outcome = Some(outcome);
        self.error = error;
    }
}

/// A persisted saga instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaState {
    /// Instance identity
    pub saga_id: SagaId,
    /// Definition name this instance runs
    pub saga_type: String,
    /// Current status
    pub status: SagaStatus,
    /// Correlation key routing messages to this instance
    pub correlation_key: Option<String>,
    /// Opaque payload, owned by the steps
    pub payload: serde_json::Value,
    /// Ordered step history
    pub step_history: Vec<StepRecord>,
    /// Optimistic concurrency token; strictly increases on every save
    pub version: u64,
    /// Creation time (UTC)
    pub created_at: DateTime<Utc>,
    /// Last persisted change (UTC)
    pub last_updated_at: DateTime<Utc>,
}

impl SagaState {
    /// Create a fresh pending instance
    pub fn new(saga_type: impl Into<String>, correlation_key: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            saga_id: SagaId::new(),
            saga_type: saga_type.into(),
            status: SagaStatus::Pending,
            correlation_key,
            payload: serde_json::Value::Null,
            step_history: Vec::new(),
            version: 0,
            created_at: now,
            last_updated_at: now,
        }
    }

    /// The record still executing, when one exists
    pub fn active_step(&self) -> Option<&StepRecord> {
        self.step_history.iter().find(|r| r.completed_at.is_none())
    }

    /// Append a started record; at most one may be active while Running
    pub fn record_step_started(&mut self, step_name: impl Into<String>, now: DateTime<Utc>) {
        self.step_history.push(StepRecord::started(step_name, now));
    }

    /// Finish the most recent record for the named step
    pub fn record_step_finished(
        &mut self,
        step_name: &str,
        outcome: StepOutcome,
        now: DateTime<Utc>,
        error: Option<String>,
    ) {
        if let Some(record) = self
            .step_history
            .iter_mut()
            .rev()
            .find(|r| r.step_name == step_name && r.completed_at.is_none())
        {
            record.finish(outcome, now, error);
        }
    }

    /// Append an already-finished compensation record
    pub fn record_compensation(
        &mut self,
        step_name: impl Into<String>,
        outcome: StepOutcome,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        error: Option<String>,
    ) {
        self.step_history.push(StepRecord {
            step_name: step_name.into(),
            started_at,
            completed_at: Some(completed_at),
            outcome: Some(outcome),
            is_compensation: true,
            error,
        });
    }
}

/// A scheduled saga timeout
///
/// `delivered_at` is set at most once; cancellation deletes the row
/// instead of marking it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaTimeout {
    /// Timeout identity
    pub timeout_id: TimeoutId,
    /// Owning saga
    pub saga_id: SagaId,
    /// When the timeout becomes due (UTC)
    pub due_at: DateTime<Utc>,
    /// Message type to reconstruct on delivery
    pub message_type: String,
    /// Serialized message payload
    pub serialized_payload: String,
    /// Set exactly once, on successful delivery
    pub delivered_at: Option<DateTime<Utc>>,
    /// Delivery attempts that ended in a resolution or decode error
    pub attempts: u32,
    /// Most recent delivery error
    pub last_error: Option<String>,
    /// True once the timeout exhausted its attempts
    pub dead_lettered: bool,
}

impl SagaTimeout {
    /// Schedule a timeout for a saga
    pub fn new(
        saga_id: SagaId,
        due_at: DateTime<Utc>,
        message_type: impl Into<String>,
        serialized_payload: impl Into<String>,
    ) -> Self {
        Self {
            timeout_id: TimeoutId::new(),
            saga_id,
            due_at,
            message_type: message_type.into(),
            serialized_payload: serialized_payload.into(),
            delivered_at: None,
            attempts: 0,
            last_error: None,
            dead_lettered: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_history_records() {
        let now = Utc::now();
        let mut state = SagaState::new("order", Some("order-1".to_string()), now);
        state.record_step_started("Reserve", now);
        assert!(state.active_step().is_some());

        state.record_step_finished("Reserve", StepOutcome::Completed, now, None);
        assert!(state.active_step().is_none());
        assert_eq!(state.step_history.len(), 1);
        assert_eq!(state.step_history[0].outcome, Some(StepOutcome::Completed));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SagaStatus::Completed.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
        assert!(SagaStatus::Cancelled.is_terminal());
        assert!(!SagaStatus::Running.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
    }
}
