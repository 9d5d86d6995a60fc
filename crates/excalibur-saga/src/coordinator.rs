//! Saga step coordination
//!
//! Executes a declarative step graph against a persisted instance:
//! sequential steps, conditionals, multi-conditional switches, and
//! parallel groups. Step failures are outcomes, not panics: a failing
//! step moves the saga to `Compensating`, and the coordinator walks the
//! completed history in reverse invoking each step's compensation. A
//! compensation failure never aborts the walk; it downgrades the terminal
//! status from `Compensated` to `Failed`.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use excalibur_types::{Clock, DispatchError, Result, SagaId, SharedClock, SystemClock};

use crate::state::{SagaState, SagaStatus, StepOutcome};
use crate::store::SagaStore;

/// Context handed to every step execution and compensation
#[derive(Clone)]
pub struct SagaStepContext {
    /// Instance being executed
    pub saga_id: SagaId,
    /// Definition name
    pub saga_type: String,
    /// Correlation key, when the instance has one
    pub correlation_key: Option<String>,
    /// Host cancellation; long steps should observe it
    pub cancellation: CancellationToken,
}

/// A step's executable unit
///
/// Receives a snapshot of the saga payload and may return an updated
/// payload; returning `None` leaves the payload untouched.
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Run the unit
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &SagaStepContext,
    ) -> Result<Option<serde_json::Value>>;
}

/// Adapter turning an async closure into a [`StepAction`]
pub struct StepFn<F>(pub F);

#[async_trait]
impl<F, Fut> StepAction for StepFn<F>
where
    F: Fn(serde_json::Value, SagaStepContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Option<serde_json::Value>>> + Send,
{
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: &SagaStepContext,
    ) -> Result<Option<serde_json::Value>> {
        (self.0)(payload, ctx.clone()).await
    }
}

/// Branch predicate over the saga payload
pub trait StepPredicate: Send + Sync {
    /// Evaluate against the current payload
    fn evaluate(&self, payload: &serde_json::Value) -> Result<bool>;
}

/// Adapter turning a closure into a [`StepPredicate`]
pub struct PredicateFn<F>(pub F);

impl<F> StepPredicate for PredicateFn<F>
where
    F: Fn(&serde_json::Value) -> Result<bool> + Send + Sync,
{
    fn evaluate(&self, payload: &serde_json::Value) -> Result<bool> {
        (self.0)(payload)
    }
}

/// How a parallel group reacts to a child failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelFailureMode {
    /// Cancel remaining children on the first failure
    FailFast,
    /// Let every child finish, then compensate if any failed
    CompleteAll,
}

/// A named sequential step with an optional compensation
pub struct SagaStep {
    /// Step name; unique within a definition
    pub name: String,
    pub(crate) execute: Arc<dyn StepAction>,
    pub(crate) compensate: Option<Arc<dyn StepAction>>,
}

impl SagaStep {
    /// A step without compensation
    pub fn new(name: impl Into<String>, execute: impl StepAction + 'static) -> Self {
        Self {
            name: name.into(),
            execute: Arc::new(execute),
            compensate: None,
        }
    }

    /// Attach a compensation
    pub fn with_compensation(mut self, compensate: impl StepAction + 'static) -> Self {
        self.compensate = Some(Arc::new(compensate));
        self
    }
}

/// A node in the step graph
pub enum StepNode {
    /// Plain sequential step
    Step(SagaStep),
    /// Two-way branch; a predicate error fails the saga
    Conditional {
        /// Name recorded when the predicate itself fails
        name: String,
        /// Branch predicate
        predicate: Arc<dyn StepPredicate>,
        /// Executed when the predicate holds
        on_true: Box<StepNode>,
        /// Executed otherwise, when present
        on_false: Option<Box<StepNode>>,
    },
    /// First-match-wins multi-branch; a branch predicate error logs and
    /// falls through to the next branch
    Switch {
        /// Name for diagnostics
        name: String,
        /// Ordered (predicate, step) branches
        branches: Vec<(Arc<dyn StepPredicate>, StepNode)>,
        /// Fallback when no branch matches
        default: Option<Box<StepNode>>,
    },
    /// Concurrent children
    Parallel {
        /// Name for diagnostics
        name: String,
        /// Children executed concurrently
        children: Vec<SagaStep>,
        /// Failure reaction
        failure_mode: ParallelFailureMode,
    },
}

impl StepNode {
    /// Collect every [`SagaStep`] reachable from this node
    fn collect<'a>(&'a self, into: &mut Vec<&'a SagaStep>) {
        match self {
            Self::Step(step) => into.push(step),
            Self::Conditional {
                on_true, on_false, ..
            } => {
                on_true.collect(into);
                if let Some(node) = on_false {
                    node.collect(into);
                }
            }
            Self::Switch {
                branches, default, ..
            } => {
                for (_, node) in branches {
                    node.collect(into);
                }
                if let Some(node) = default {
                    node.collect(into);
                }
            }
            Self::Parallel { children, .. } => into.extend(children.iter()),
        }
    }
}

/// A declarative saga definition
pub struct SagaDefinition {
    saga_type: String,
    steps: Vec<StepNode>,
}

impl SagaDefinition {
    /// Start a definition
    pub fn new(saga_type: impl Into<String>) -> Self {
        Self {
            saga_type: saga_type.into(),
            steps: Vec::new(),
        }
    }

    /// The definition name
    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    /// Append a sequential step
    pub fn step(mut self, step: SagaStep) -> Self {
        self.steps.push(StepNode::Step(step));
        self
    }

    /// Append any node
    pub fn node(mut self, node: StepNode) -> Self {
        self.steps.push(node);
        self
    }

    /// Find a step by name anywhere in the graph
    fn find_step(&self, name: &str) -> Option<&SagaStep> {
        let mut all = Vec::new();
        for node in &self.steps {
            node.collect(&mut all);
        }
        all.into_iter().find(|s| s.name == name)
    }
}

/// Outcome of a node execution
enum NodeOutcome {
    /// Node finished (or was skipped entirely)
    Done,
    /// A step inside the node failed
    Failed { step_name: String, error: DispatchError },
}

/// Drives saga definitions against the state store
pub struct SagaCoordinator {
    store: Arc<dyn SagaStore>,
    clock: SharedClock,
}

impl SagaCoordinator {
    /// Create a coordinator over a store with the system clock
    pub fn new(store: Arc<dyn SagaStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    /// Create a coordinator with an explicit clock
    pub fn with_clock(store: Arc<dyn SagaStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Execute a definition for the given correlation key
    ///
    /// Loads the existing instance for the key, or creates one with
    /// status `Pending` and transitions it to `Running`. Returns the
    /// terminal state.
    pub async fn run(
        &self,
        definition: &SagaDefinition,
        correlation_key: Option<String>,
        initial_payload: serde_json::Value,
        cancellation: &CancellationToken,
    ) -> Result<SagaState> {
        let now = self.clock.now_utc();
        let mut state = match &correlation_key {
            Some(key) => self
                .store
                .get_by_correlation(&definition.saga_type, key)
                .await?,
            None => None,
        }
        .unwrap_or_else(|| {
            let mut state =
                SagaState::new(&definition.saga_type, correlation_key.clone(), now);
            state.payload = initial_payload;
            state
        });

        if state.status.is_terminal() {
            return Ok(state);
        }
        if state.status == SagaStatus::Running || state.status == SagaStatus::Compensating {
            return Err(DispatchError::ConcurrencyConflict {
                saga_id: state.saga_id.to_string(),
                expected_version: state.version,
                actual_version: state.version,
            });
        }

        state.status = SagaStatus::Running;
        state = self.store.save(state).await?;

        let ctx = SagaStepContext {
            saga_id: state.saga_id.clone(),
            saga_type: state.saga_type.clone(),
            correlation_key: state.correlation_key.clone(),
            cancellation: cancellation.clone(),
        };

        for node in &definition.steps {
            let outcome = self.execute_node(&mut state, node, &ctx).await?;
            if let NodeOutcome::Failed { step_name, error } = outcome {
                warn!(
                    saga_id = %state.saga_id,
                    step = %step_name,
                    error = %error,
                    "saga step failed, compensating"
                );
                return self.compensate(state, definition, &ctx).await;
            }

            // Host cancellation propagates after the current atomic unit.
            if cancellation.is_cancelled() {
                state.status = SagaStatus::Cancelled;
                state = self.store.save(state).await?;
                info!(saga_id = %state.saga_id, "saga cancelled by host");
                return Ok(state);
            }
        }

        state.status = SagaStatus::Completed;
        let state = self.store.save(state).await?;
        Ok(state)
    }

    /// Execute one node, persisting around every recorded step
    async fn execute_node(
        &self,
        state: &mut SagaState,
        node: &StepNode,
        ctx: &SagaStepContext,
    ) -> Result<NodeOutcome> {
        match node {
            StepNode::Step(step) => self.execute_step(state, step, ctx).await,
            StepNode::Conditional {
                name,
                predicate,
                on_true,
                on_false,
            } => match predicate.evaluate(&state.payload) {
                Ok(true) => Box::pin(self.execute_node(state, on_true, ctx)).await,
                Ok(false) => match on_false {
                    Some(node) => Box::pin(self.execute_node(state, node, ctx)).await,
                    None => Ok(NodeOutcome::Done),
                },
                Err(err) => {
                    // The conditional executed no child; its failure is
                    // recorded but produces nothing to compensate.
                    let now = self.clock.now_utc();
                    state.record_step_started(name.clone(), now);
                    let error = DispatchError::ConditionEval {
                        step: name.clone(),
                        reason: err.to_string(),
                    };
                    state.record_step_finished(
                        name,
                        StepOutcome::Failed,
                        now,
                        Some(error.to_string()),
                    );
                    *state = self.store.save(state.clone()).await?;
                    Ok(NodeOutcome::Failed {
                        step_name: name.clone(),
                        error,
                    })
                }
            },
            StepNode::Switch {
                name,
                branches,
                default,
            } => {
                for (index, (predicate, branch)) in branches.iter().enumerate() {
                    match predicate.evaluate(&state.payload) {
                        Ok(true) => return Box::pin(self.execute_node(state, branch, ctx)).await,
                        Ok(false) => {}
                        Err(err) => {
                            // A branch predicate error fails only that
                            // branch's evaluation; fall through.
                            warn!(
                                switch = %name,
                                branch = index,
                                error = %err,
                                "switch branch predicate failed, falling through"
                            );
                        }
                    }
                }
                match default {
                    Some(node) => Box::pin(self.execute_node(state, node, ctx)).await,
                    None => Ok(NodeOutcome::Done),
                }
            }
            StepNode::Parallel {
                name,
                children,
                failure_mode,
            } => {
                self.execute_parallel(state, name, children, *failure_mode, ctx)
                    .await
            }
        }
    }

    async fn execute_step(
        &self,
        state: &mut SagaState,
        step: &SagaStep,
        ctx: &SagaStepContext,
    ) -> Result<NodeOutcome> {
        let started = self.clock.now_utc();
        state.record_step_started(step.name.clone(), started);
        *state = self.store.save(state.clone()).await?;

        let outcome = step.execute.run(state.payload.clone(), ctx).await;
        let finished = self.clock.now_utc();
        match outcome {
            Ok(update) => {
                if let Some(payload) = update {
                    state.payload = payload;
                }
                state.record_step_finished(&step.name, StepOutcome::Completed, finished, None);
                *state = self.store.save(state.clone()).await?;
                Ok(NodeOutcome::Done)
            }
            Err(error) => {
                state.record_step_finished(
                    &step.name,
                    StepOutcome::Failed,
                    finished,
                    Some(error.to_string()),
                );
                *state = self.store.save(state.clone()).await?;
                Ok(NodeOutcome::Failed {
                    step_name: step.name.clone(),
                    error,
                })
            }
        }
    }

    async fn execute_parallel(
        &self,
        state: &mut SagaState,
        group: &str,
        children: &[SagaStep],
        failure_mode: ParallelFailureMode,
        ctx: &SagaStepContext,
    ) -> Result<NodeOutcome> {
        let started = self.clock.now_utc();
        for child in children {
            state.record_step_started(child.name.clone(), started);
        }
        *state = self.store.save(state.clone()).await?;

        let snapshot = state.payload.clone();
        let group_token = ctx.cancellation.child_token();
        let mut futures = FuturesUnordered::new();
        for (index, child) in children.iter().enumerate() {
            let action = Arc::clone(&child.execute);
            let payload = snapshot.clone();
            let child_ctx = SagaStepContext {
                cancellation: group_token.clone(),
                ..ctx.clone()
            };
            futures.push(async move { (index, action.run(payload, &child_ctx).await) });
        }

        // Every pushed future yields exactly once, so each child settles.
        let mut results: Vec<(usize, Result<Option<serde_json::Value>>)> =
            Vec::with_capacity(children.len());
        while let Some(entry) = futures.next().await {
            if entry.1.is_err() && failure_mode == ParallelFailureMode::FailFast {
                group_token.cancel();
            }
            results.push(entry);
        }
        results.sort_by_key(|(index, _)| *index);

        let finished = self.clock.now_utc();
        let mut failure: Option<(String, DispatchError)> = None;
        for (child, (_, outcome)) in children.iter().zip(results.into_iter()) {
            match outcome {
                Ok(update) => {
                    // Updates merge in declaration order.
                    if let Some(payload) = update {
                        merge_payload(&mut state.payload, payload);
                    }
                    state.record_step_finished(&child.name, StepOutcome::Completed, finished, None);
                }
                Err(error) => {
                    let outcome = if error.is_cancellation() {
                        StepOutcome::Cancelled
                    } else {
                        StepOutcome::Failed
                    };
                    state.record_step_finished(
                        &child.name,
                        outcome,
                        finished,
                        Some(error.to_string()),
                    );
                    if failure.is_none() && !error.is_cancellation() {
                        failure = Some((child.name.clone(), error));
                    }
                }
            }
        }
        *state = self.store.save(state.clone()).await?;

        match failure {
            Some((step_name, error)) => {
                warn!(group, step = %step_name, "parallel child failed");
                Ok(NodeOutcome::Failed { step_name, error })
            }
            None => Ok(NodeOutcome::Done),
        }
    }

    /// Walk the completed history in reverse, invoking compensations
    async fn compensate(
        &self,
        mut state: SagaState,
        definition: &SagaDefinition,
        ctx: &SagaStepContext,
    ) -> Result<SagaState> {
        state.status = SagaStatus::Compensating;
        state = self.store.save(state).await?;

        let completed: Vec<String> = state
            .step_history
            .iter()
            .filter(|r| !r.is_compensation && r.outcome == Some(StepOutcome::Completed))
            .map(|r| r.step_name.clone())
            .collect();

        let mut all_compensated = true;
        for step_name in completed.iter().rev() {
            if ctx.cancellation.is_cancelled() {
                // Cancellation never abandons compensations already due;
                // it is recorded and the walk continues.
                info!(saga_id = %state.saga_id, "cancellation observed during compensation");
            }
            let compensate = definition
                .find_step(step_name)
                .and_then(|step| step.compensate.as_ref().map(Arc::clone));
            let Some(action) = compensate else {
                // Completed steps without a compensation skip with a record.
                info!(saga_id = %state.saga_id, step = %step_name, "no compensation declared, skipping");
                let now = self.clock.now_utc();
                state.record_compensation(
                    step_name.clone(),
                    StepOutcome::Skipped,
                    now,
                    now,
                    None,
                );
                state = self.store.save(state).await?;
                continue;
            };

            let started = self.clock.now_utc();
            let outcome = action.run(state.payload.clone(), ctx).await;
            let finished = self.clock.now_utc();
            match outcome {
                Ok(update) => {
                    if let Some(payload) = update {
                        state.payload = payload;
                    }
                    state.record_compensation(
                        step_name.clone(),
                        StepOutcome::Compensated,
                        started,
                        finished,
                        None,
                    );
                }
                Err(error) => {
                    warn!(
                        saga_id = %state.saga_id,
                        step = %step_name,
                        error = %error,
                        "compensation failed, continuing walk"
                    );
                    all_compensated = false;
                    state.record_compensation(
                        step_name.clone(),
                        StepOutcome::CompensationFailed,
                        started,
                        finished,
                        Some(error.to_string()),
                    );
                }
            }
            state = self.store.save(state).await?;
        }

        state.status = if all_compensated {
            SagaStatus::Compensated
        } else {
            SagaStatus::Failed
        };
        state = self.store.save(state).await?;
        Ok(state)
    }
}

/// Shallow-merge an update into the payload
///
/// Object-into-object merges key-wise; anything else replaces wholesale.
fn merge_payload(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                target_map.insert(key, value);
            }
        }
        (target_slot, update) => *target_slot = update,
    }
}
