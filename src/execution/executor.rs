//! Replay Executor
//!
//! Runs one invocation of a workflow function against its ledger.
//!
//! The function is re-entered from the top on every invocation. Each step
//! call consumes the next logical position(s): settled positions replay
//! their recorded output, and the first open position either executes (and
//! stops the function with a continuation) or, for parallel groups,
//! whatever the resolver decides. Execution of user code only ever happens
//! for the one position this delivery is about.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use serde_json::Value;

use crate::error::{Result, WorkflowError};
use crate::workflow::{Delay, LazyStep, Ledger, ParsedRequest, Step};

use super::context::WorkflowContext;
use super::parallel::{ParallelCallState, ParallelGroup};

/// A message the queue should deliver back to the workflow endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Continuation {
    pub workflow_id: String,
    pub url: String,
    /// Records this message appends to the history
    pub records: Vec<Step>,
    pub delay: Option<Delay>,
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    /// Publish these continuations
    Continue(Vec<Continuation>),
    /// The delivery carried nothing to act on
    Discarded,
    /// The workflow function returned
    Completed,
}

impl InvocationOutcome {
    /// Continuations to publish, empty unless the outcome is `Continue`.
    pub fn continuations(&self) -> &[Continuation] {
        match self {
            Self::Continue(continuations) => continuations,
            Self::Discarded | Self::Completed => &[],
        }
    }
}

impl std::fmt::Display for InvocationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue(c) => write!(f, "continue ({} message(s))", c.len()),
            Self::Discarded => write!(f, "discarded"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Mutable state of one invocation.
#[derive(Debug, Default)]
struct ExecutorState {
    /// Logical positions consumed so far
    step_count: usize,
    /// Set once the invocation has decided how to end
    outcome: Option<InvocationOutcome>,
}

#[derive(Debug)]
struct ExecutorInner {
    workflow_id: String,
    url: String,
    ledger: Ledger,
    is_first_invocation: bool,
    state: Mutex<ExecutorState>,
}

/// Replays a ledger through a workflow function.
///
/// Cloning is cheap: clones share the same invocation state, which is how
/// [`WorkflowContext`] reaches it.
///
/// # Example
///
/// ```
/// use stepledger::execution::{Executor, InvocationOutcome};
/// use stepledger::workflow::Ledger;
///
/// # #[tokio::main]
/// # async fn main() -> stepledger::Result<()> {
/// let ledger = Ledger::fresh(serde_json::json!(2));
/// let executor = Executor::new("wf1", "https://app.example.com/wf", ledger);
///
/// let outcome = executor
///     .run(|ctx| async move {
///         let input: u32 = ctx.request_payload()?;
///         let doubled: u32 = ctx
///             .run("double", move || async move { Ok::<_, std::convert::Infallible>(input * 2) })
///             .await?;
///         assert_eq!(doubled, 4);
///         Ok(())
///     })
///     .await?;
///
/// // The first step executed and the function stopped after it
/// assert!(matches!(outcome, InvocationOutcome::Continue(_)));
/// assert_eq!(outcome.continuations()[0].records[0].out, Some(serde_json::json!(4)));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    /// Creates an executor for a continuation of `workflow_id`.
    pub fn new(workflow_id: impl Into<String>, url: impl Into<String>, ledger: Ledger) -> Self {
        Self::build(workflow_id.into(), url.into(), ledger, false)
    }

    /// Creates an executor from a parsed request.
    ///
    /// Continuations emitted by the first invocation carry the Init record
    /// ahead of their own, so the queue can seed the workflow's history.
    pub fn from_parsed(parsed: ParsedRequest) -> Self {
        Self::build(parsed.workflow_id, parsed.url, parsed.ledger, parsed.is_first_invocation)
    }

    fn build(workflow_id: String, url: String, ledger: Ledger, is_first_invocation: bool) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                workflow_id,
                url,
                ledger,
                is_first_invocation,
                state: Mutex::new(ExecutorState::default()),
            }),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.inner.workflow_id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    /// Runs the workflow function for this invocation.
    ///
    /// # Returns
    ///
    /// * `Ok(outcome)` - What the caller should do next
    /// * `Err(StepExecution)` - A step failed; nothing should be published
    /// * `Err(ProtocolViolation)` - The ledger does not match the function
    pub async fn run<F, Fut>(self, route: F) -> Result<InvocationOutcome>
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.inner.ledger.validate()?;

        if self.inner.ledger.is_redundant_trigger() {
            info!(
                "Workflow {}: redelivered record {}, discarding",
                self.inner.workflow_id,
                self.inner.ledger.trigger().map(Step::summary).unwrap_or_default()
            );
            return Ok(InvocationOutcome::Discarded);
        }

        debug!(
            "Workflow {}: replaying {} record(s)",
            self.inner.workflow_id,
            self.inner.ledger.len()
        );

        let result = route(WorkflowContext::new(self.clone())).await;
        let outcome = self.lock().outcome.take();

        match (outcome, result) {
            (Some(outcome), Ok(())) | (Some(outcome), Err(WorkflowError::Suspended)) => {
                debug!("Workflow {}: invocation {}", self.inner.workflow_id, outcome);
                Ok(outcome)
            }
            (Some(outcome), Err(e)) => {
                warn!(
                    "Workflow {}: function returned '{}' after suspending, keeping {}",
                    self.inner.workflow_id, e, outcome
                );
                Ok(outcome)
            }
            (None, Ok(())) => {
                info!("Workflow {} completed", self.inner.workflow_id);
                Ok(InvocationOutcome::Completed)
            }
            (None, Err(WorkflowError::Suspended)) => Err(WorkflowError::ProtocolViolation(
                "workflow function suspended without reaching a step".to_string(),
            )),
            (None, Err(e)) => Err(e),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExecutorState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserves `count` logical positions and returns the first one.
    fn reserve(&self, count: usize) -> Result<usize> {
        let mut state = self.lock();
        if state.outcome.is_some() {
            return Err(WorkflowError::Suspended);
        }
        let first = state.step_count + 1;
        state.step_count += count;
        Ok(first)
    }

    /// Records how the invocation ends and stops the workflow function.
    fn suspend(&self, outcome: InvocationOutcome) -> WorkflowError {
        let mut state = self.lock();
        if state.outcome.is_none() {
            state.outcome = Some(outcome);
        }
        WorkflowError::Suspended
    }

    fn continuation(&self, record: Step) -> Continuation {
        let delay = Delay::from_step(&record);
        let mut records = Vec::with_capacity(2);
        if self.inner.is_first_invocation {
            if let Some(init) = self.inner.ledger.init() {
                records.push(init.clone());
            }
        }
        records.push(record);

        Continuation {
            workflow_id: self.inner.workflow_id.clone(),
            url: self.inner.url.clone(),
            records,
            delay,
        }
    }

    /// Resolves a single sequential step.
    pub(crate) async fn execute_step(&self, step: LazyStep) -> Result<Value> {
        let position = self.reserve(1)?;
        let step_id = position as u64;
        let ledger = &self.inner.ledger;

        if let Some(record) = ledger.settled(step_id) {
            check_replayed(record, &step, 1, position)?;
            debug!("Replaying step {}", record.summary());
            return Ok(record.out.clone().unwrap_or(Value::Null));
        }

        if ledger.results_for(step_id).next().is_some() {
            debug!("Step '{}' at position {} is still in flight", step.name(), position);
            return Err(self.suspend(InvocationOutcome::Discarded));
        }

        info!("Executing step '{}' at position {}", step.name(), position);
        let record = step.result_step(1, step_id, position).await?;
        let continuation = self.continuation(record);
        Err(self.suspend(InvocationOutcome::Continue(vec![continuation])))
    }

    /// Resolves a parallel group of steps.
    pub(crate) async fn execute_parallel(&self, steps: Vec<LazyStep>) -> Result<Vec<Value>> {
        let concurrent = steps.len();
        if concurrent == 0 {
            return Ok(Vec::new());
        }

        let target = self.reserve(concurrent)?;
        let ledger = &self.inner.ledger;
        let group = ParallelGroup::collect(concurrent, target, ledger)?;
        check_branches(&group, &steps, target)?;

        let trigger_in_group = ledger.trigger().map(|t| group.contains(t)).unwrap_or(false);
        if group.is_complete() && !trigger_in_group {
            debug!("Replaying parallel group of {} at position {}", concurrent, target);
            return Ok(group.outputs());
        }

        let state = group.classify(ledger);
        debug!("Parallel group of {} at position {}: {}", concurrent, target, state);

        match state {
            ParallelCallState::First => {
                info!("Fanning out {} branches at position {}", concurrent, target);
                let continuations = steps
                    .iter()
                    .enumerate()
                    .map(|(i, step)| self.continuation(step.plan_step(concurrent, target + i)))
                    .collect();
                Err(self.suspend(InvocationOutcome::Continue(continuations)))
            }
            ParallelCallState::Partial { branch } => {
                let step = steps.into_iter().nth(branch).ok_or_else(|| {
                    WorkflowError::ProtocolViolation(format!(
                        "branch {} does not exist in group of {}",
                        branch, concurrent
                    ))
                })?;
                let position = target + branch;
                info!("Executing branch {} '{}' at position {}", branch, step.name(), position);
                let record = step.result_step(concurrent, position as u64, target).await?;
                let continuation = self.continuation(record);
                Err(self.suspend(InvocationOutcome::Continue(vec![continuation])))
            }
            ParallelCallState::Discard => Err(self.suspend(InvocationOutcome::Discarded)),
            ParallelCallState::Last => {
                info!("All {} branches at position {} resolved", concurrent, target);
                Ok(group.outputs())
            }
        }
    }
}

/// Checks that a replayed record was produced by the same kind of step.
fn check_replayed(record: &Step, step: &LazyStep, concurrent: usize, target: usize) -> Result<()> {
    if let Some(recorded) = record.step_type {
        if recorded != step.step_type() {
            return Err(WorkflowError::ProtocolViolation(format!(
                "record {} replayed as {} step '{}'",
                record.summary(),
                step.step_type(),
                step.name()
            )));
        }
    }

    if record.concurrent != concurrent || record.target_step != target {
        return Err(WorkflowError::ProtocolViolation(format!(
            "record {} replayed at position {} in a group of {}",
            record.summary(),
            target,
            concurrent
        )));
    }

    if record.step_name != step.name() {
        warn!(
            "Step at position {} was recorded as '{}' but is now named '{}'",
            record.step_id,
            record.step_name,
            step.name()
        );
    }

    Ok(())
}

fn check_branches(group: &ParallelGroup<'_>, steps: &[LazyStep], target: usize) -> Result<()> {
    for (branch, step) in steps.iter().enumerate() {
        if let Some(result) = group.result(branch) {
            check_replayed(result, step, steps.len(), target)?;
        }
        if let Some(plan) = group.plan(branch) {
            if plan.step_type.is_some_and(|t| t != step.step_type()) {
                return Err(WorkflowError::ProtocolViolation(format!(
                    "plan {} does not match branch {} '{}'",
                    plan.summary(),
                    branch,
                    step.name()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{BoxError, StepType};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const URL: &str = "https://app.example.com/wf";

    fn executor(steps: Vec<Step>) -> Executor {
        Executor::new("wf-test", URL, Ledger::new(steps))
    }

    fn run_result(step_id: u64, out: Value) -> Step {
        Step::new(step_id, "step", StepType::Run, 1, step_id as usize).with_out(out)
    }

    async fn two_steps(ctx: WorkflowContext, calls: Arc<AtomicUsize>) -> Result<()> {
        let first = Arc::clone(&calls);
        let a: i64 = ctx
            .run("step", move || async move {
                first.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(1)
            })
            .await?;
        let second = Arc::clone(&calls);
        let b: i64 = ctx
            .run("step", move || async move {
                second.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(a + 1)
            })
            .await?;
        assert_eq!(b, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_first_invocation_executes_first_step() {
        let calls = Arc::new(AtomicUsize::new(0));
        let parsed = ParsedRequest {
            workflow_id: "wf-test".to_string(),
            url: URL.to_string(),
            ledger: Ledger::fresh(json!({"foo": "bar"})),
            is_first_invocation: true,
        };

        let counter = Arc::clone(&calls);
        let outcome = Executor::from_parsed(parsed)
            .run(move |ctx| two_steps(ctx, counter))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let continuations = outcome.continuations();
        assert_eq!(continuations.len(), 1);

        let records = &continuations[0].records;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].step_type, Some(StepType::Init));
        assert_eq!(records[1].step_id, 1);
        assert_eq!(records[1].out, Some(json!(1)));
        assert_eq!(continuations[0].delay, None);
    }

    #[tokio::test]
    async fn test_replay_skips_settled_steps() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let outcome = executor(vec![Step::init(json!(null)), run_result(1, json!(1))])
            .run(move |ctx| two_steps(ctx, counter))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let records = &outcome.continuations()[0].records;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].step_id, 2);
        assert_eq!(records[0].out, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_fully_replayed_workflow_completes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let outcome = executor(vec![
            Step::init(json!(null)),
            run_result(1, json!(1)),
            run_result(2, json!(2)),
        ])
        .run(move |ctx| two_steps(ctx, counter))
        .await
        .unwrap();

        assert_eq!(outcome, InvocationOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_redelivered_result_is_discarded_before_user_code() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let outcome = executor(vec![
            Step::init(json!(null)),
            run_result(1, json!(1)),
            run_result(1, json!(1)),
        ])
        .run(move |ctx| two_steps(ctx, counter))
        .await
        .unwrap();

        assert_eq!(outcome, InvocationOutcome::Discarded);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_step_failure_returns_error() {
        let err = executor(vec![Step::init(json!(null))])
            .run(|ctx| async move {
                let _: u32 = ctx.run("explode", || async { Err::<u32, _>("disk full") }).await?;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::StepExecution { .. }));
    }

    #[tokio::test]
    async fn test_swallowed_suspension_keeps_outcome() {
        let outcome = executor(vec![Step::init(json!(null))])
            .run(|ctx| async move {
                let _ = ctx.sleep("nap", Duration::from_secs(5)).await;
                // Further steps after the stop are ignored
                let _ = ctx.sleep("again", Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap();

        let continuations = outcome.continuations();
        assert_eq!(continuations.len(), 1);
        assert_eq!(continuations[0].records[0].step_name, "nap");
        assert_eq!(continuations[0].delay, Some(Delay::For(Duration::from_secs(5))));
    }

    #[tokio::test]
    async fn test_type_mismatch_is_protocol_violation() {
        let err = executor(vec![Step::init(json!(null)), run_result(1, json!(1))])
            .run(|ctx| async move {
                ctx.sleep("step", Duration::from_secs(1)).await?;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_call_in_flight_is_discarded() {
        let request = Step::new(1, "hook", StepType::Call, 1, 1);
        let outcome = executor(vec![Step::init(json!(null)), request])
            .run(|ctx| async move {
                let request = crate::workflow::CallRequest::new("https://example.com");
                let _: Value = ctx.call("hook", request).await?;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(outcome, InvocationOutcome::Discarded);
    }

    async fn fan_out(ctx: WorkflowContext, calls: Arc<AtomicUsize>) -> Result<()> {
        let branches = ["a", "b"]
            .into_iter()
            .map(|name| {
                let counter = Arc::clone(&calls);
                LazyStep::run(name, move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BoxError>(format!("{} done", name))
                })
            })
            .collect();
        let outputs: Vec<String> = ctx.parallel_as(branches).await?;
        assert_eq!(outputs, vec!["a done", "b done"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_parallel_first_emits_plans() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let outcome = executor(vec![Step::init(json!(null))])
            .run(move |ctx| fan_out(ctx, counter))
            .await
            .unwrap();

        let continuations = outcome.continuations();
        assert_eq!(continuations.len(), 2);
        for (i, continuation) in continuations.iter().enumerate() {
            assert_eq!(continuation.records.len(), 1);
            assert!(continuation.records[0].is_plan());
            assert_eq!(continuation.records[0].target_step, 1 + i);
            assert_eq!(continuation.records[0].concurrent, 2);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parallel_partial_runs_only_its_branch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let plan = Step::new(0, "b", StepType::Run, 2, 2);
        let steps = vec![Step::init(json!(null)), Step::new(0, "a", StepType::Run, 2, 1), plan];
        let outcome = executor(steps)
            .run(move |ctx| fan_out(ctx, counter))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let record = &outcome.continuations()[0].records[0];
        assert_eq!(record.step_id, 2);
        assert_eq!(record.target_step, 1);
        assert_eq!(record.concurrent, 2);
        assert_eq!(record.out, Some(json!("b done")));
    }

    #[tokio::test]
    async fn test_parallel_last_resumes_and_completes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let steps = vec![
            Step::init(json!(null)),
            Step::new(0, "a", StepType::Run, 2, 1),
            Step::new(0, "b", StepType::Run, 2, 2),
            Step::new(2, "b", StepType::Run, 2, 1).with_out(json!("b done")),
            Step::new(1, "a", StepType::Run, 2, 1).with_out(json!("a done")),
        ];
        let outcome = executor(steps)
            .run(move |ctx| fan_out(ctx, counter))
            .await
            .unwrap();

        assert_eq!(outcome, InvocationOutcome::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_parallel_intermediate_result_is_discarded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let steps = vec![
            Step::init(json!(null)),
            Step::new(0, "a", StepType::Run, 2, 1),
            Step::new(1, "a", StepType::Run, 2, 1).with_out(json!("a done")),
        ];
        let outcome = executor(steps)
            .run(move |ctx| fan_out(ctx, counter))
            .await
            .unwrap();

        assert_eq!(outcome, InvocationOutcome::Discarded);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_parallel_group() {
        let outcome = executor(vec![Step::init(json!(null))])
            .run(|ctx| async move {
                let outputs = ctx.parallel(Vec::new()).await?;
                assert!(outputs.is_empty());
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(outcome, InvocationOutcome::Completed);
    }

    #[tokio::test]
    async fn test_invalid_ledger_is_rejected_before_user_code() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let err = executor(vec![run_result(1, json!(1))])
            .run(move |ctx| two_steps(ctx, counter))
            .await
            .unwrap_err();

        assert!(matches!(err, WorkflowError::ProtocolViolation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
