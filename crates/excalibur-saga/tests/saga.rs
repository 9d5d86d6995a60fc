//! End-to-end saga scenarios

use std::sync::Arc;
use std::sync::Mutex;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use excalibur_saga::{
    InMemorySagaStore, ParallelFailureMode, SagaCoordinator, SagaDefinition, SagaStatus, SagaStep,
    SagaStepContext, StepFn, StepNode, StepOutcome,
};
use excalibur_types::{DispatchError, Result};

type Log = Arc<Mutex<Vec<String>>>;

fn recording_step(
    log: Log,
    label: &'static str,
    fail: bool,
) -> StepFn<
    impl Fn(
            serde_json::Value,
            SagaStepContext,
        ) -> futures::future::Ready<Result<Option<serde_json::Value>>>
        + Send
        + Sync,
> {
    StepFn(move |_payload: serde_json::Value, _ctx: SagaStepContext| {
        log.lock().unwrap().push(label.to_string());
        if fail {
            futures::future::ready(Err(DispatchError::internal(format!("{} blew up", label))))
        } else {
            futures::future::ready(Ok(None))
        }
    })
}

#[tokio::test]
async fn test_compensation_on_late_failure() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(InMemorySagaStore::new());
    let coordinator = SagaCoordinator::new(store.clone());

    let definition = SagaDefinition::new("fulfillment")
        .step(
            SagaStep::new("Reserve", recording_step(log.clone(), "Reserve", false))
                .with_compensation(recording_step(log.clone(), "Reserve.compensate", false)),
        )
        .step(
            SagaStep::new("Charge", recording_step(log.clone(), "Charge", false))
                .with_compensation(recording_step(log.clone(), "Charge.compensate", false)),
        )
        .step(SagaStep::new(
            "Ship",
            recording_step(log.clone(), "Ship", true),
        ));

    let state = coordinator
        .run(
            &definition,
            Some("order-9".to_string()),
            json!({}),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // Ship failed; compensations ran in reverse completion order.
    assert_eq!(state.status, SagaStatus::Compensated);
    assert_eq!(state.step_history.len(), 5);

    let ship = state
        .step_history
        .iter()
        .find(|r| r.step_name == "Ship")
        .unwrap();
    assert_eq!(ship.outcome, Some(StepOutcome::Failed));

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "Reserve",
            "Charge",
            "Ship",
            "Charge.compensate",
            "Reserve.compensate"
        ]
    );

    let compensations: Vec<_> = state
        .step_history
        .iter()
        .filter(|r| r.is_compensation)
        .collect();
    assert_eq!(compensations.len(), 2);
    assert_eq!(compensations[0].step_name, "Charge");
    assert_eq!(compensations[1].step_name, "Reserve");
    assert!(compensations
        .iter()
        .all(|r| r.outcome == Some(StepOutcome::Compensated)));
}

#[tokio::test]
async fn test_compensation_failure_marks_saga_failed_but_walk_continues() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(InMemorySagaStore::new());
    let coordinator = SagaCoordinator::new(store);

    let definition = SagaDefinition::new("fulfillment")
        .step(
            SagaStep::new("Reserve", recording_step(log.clone(), "Reserve", false))
                .with_compensation(recording_step(log.clone(), "Reserve.compensate", false)),
        )
        .step(
            SagaStep::new("Charge", recording_step(log.clone(), "Charge", false))
                .with_compensation(recording_step(log.clone(), "Charge.compensate", true)),
        )
        .step(SagaStep::new(
            "Ship",
            recording_step(log.clone(), "Ship", true),
        ));

    let state = coordinator
        .run(
            &definition,
            Some("order-10".to_string()),
            json!({}),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    // Charge's compensation failed, so the saga lands on Failed, yet
    // Reserve's compensation still ran.
    assert_eq!(state.status, SagaStatus::Failed);
    assert!(log
        .lock()
        .unwrap()
        .contains(&"Reserve.compensate".to_string()));

    let failed_compensation = state
        .step_history
        .iter()
        .find(|r| r.is_compensation && r.step_name == "Charge")
        .unwrap();
    assert_eq!(
        failed_compensation.outcome,
        Some(StepOutcome::CompensationFailed)
    );
}

#[tokio::test]
async fn test_step_without_compensation_is_skipped_in_walk() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(InMemorySagaStore::new());
    let coordinator = SagaCoordinator::new(store);

    let definition = SagaDefinition::new("fulfillment")
        .step(SagaStep::new(
            "Audit",
            recording_step(log.clone(), "Audit", false),
        ))
        .step(
            SagaStep::new("Charge", recording_step(log.clone(), "Charge", false))
                .with_compensation(recording_step(log.clone(), "Charge.compensate", false)),
        )
        .step(SagaStep::new(
            "Ship",
            recording_step(log.clone(), "Ship", true),
        ));

    let state = coordinator
        .run(
            &definition,
            Some("order-11".to_string()),
            json!({}),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(state.status, SagaStatus::Compensated);
    // Audit completed but declares no compensation: only Charge rolled
    // back, and the walk records Audit's skip.
    let compensations: Vec<_> = state
        .step_history
        .iter()
        .filter(|r| r.is_compensation)
        .collect();
    assert_eq!(compensations.len(), 2);
    assert_eq!(compensations[0].step_name, "Charge");
    assert_eq!(compensations[0].outcome, Some(StepOutcome::Compensated));
    assert_eq!(compensations[1].step_name, "Audit");
    assert_eq!(compensations[1].outcome, Some(StepOutcome::Skipped));
    assert!(!log.lock().unwrap().iter().any(|l| l.contains("Audit.")));
}

#[tokio::test]
async fn test_parallel_fail_fast_compensates_completed_siblings() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::new(InMemorySagaStore::new());
    let coordinator = SagaCoordinator::new(store);

    let definition = SagaDefinition::new("provisioning")
        .step(
            SagaStep::new("Allocate", recording_step(log.clone(), "Allocate", false))
                .with_compensation(recording_step(log.clone(), "Allocate.compensate", false)),
        )
        .node(StepNode::Parallel {
            name: "Configure".to_string(),
            children: vec![
                SagaStep::new("Dns", recording_step(log.clone(), "Dns", false)),
                SagaStep::new("Cert", recording_step(log.clone(), "Cert", true)),
            ],
            failure_mode: ParallelFailureMode::FailFast,
        });

    let state = coordinator
        .run(
            &definition,
            Some("prov-1".to_string()),
            json!({}),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(state.status, SagaStatus::Compensated);
    assert!(log
        .lock()
        .unwrap()
        .contains(&"Allocate.compensate".to_string()));
}
