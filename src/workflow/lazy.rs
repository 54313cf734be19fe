//! Lazy Steps
//!
//! A lazy step is what a workflow function hands to the executor when it
//! reaches a step: a description of the step plus, for `Run`, the code to
//! execute. It is rebuilt on every invocation and only turned into ledger
//! records when the executor decides the step is open.
//!
//! Every variant supports the same two operations:
//!
//! - [`LazyStep::plan_step`]: the placeholder record written when the step
//!   is fanned out as a parallel branch
//! - [`LazyStep::result_step`]: performs the effect and returns the
//!   resolved record. It consumes the step, so the effect runs at most once
//!   per value.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use log::debug;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, WorkflowError};

use super::step::{HttpMethod, Step, StepType};

/// Error type user code may return from a `Run` step.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future produced by a `Run` step.
pub type StepFuture = BoxFuture<'static, std::result::Result<Value, BoxError>>;

type StepFn = Box<dyn FnOnce() -> StepFuture + Send>;

/// Delivery delay attached to a continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Deliver after the given duration
    For(Duration),
    /// Deliver no earlier than the given instant
    Until(DateTime<Utc>),
}

impl Delay {
    /// Derives the delivery delay encoded in a resolved sleep record.
    ///
    /// Plans never delay: a sleeping branch waits when its result is sent.
    pub fn from_step(step: &Step) -> Option<Self> {
        if !step.is_result() {
            return None;
        }
        match step.step_type {
            Some(StepType::SleepFor) => {
                step.sleep_for.map(|secs| Self::For(Duration::from_secs(secs)))
            }
            Some(StepType::SleepUntil) => step
                .sleep_until
                .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
                .map(Self::Until),
            _ => None,
        }
    }

    /// Returns the absolute delivery time relative to `now`.
    pub fn not_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::For(duration) => {
                let offset = chrono::Duration::from_std(*duration)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                now + offset
            }
            Self::Until(at) => *at,
        }
    }
}

/// Outbound HTTP request declared by a `Call` step.
///
/// # Example
///
/// ```
/// use stepledger::workflow::{CallRequest, HttpMethod};
///
/// let request = CallRequest::new("https://api.example.com/notify")
///     .with_method(HttpMethod::Put)
///     .with_header("Content-Type", "application/json")
///     .with_body(serde_json::json!({"order": 42}));
/// assert_eq!(request.method, HttpMethod::Put);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub url: String,
    pub method: HttpMethod,
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
}

impl CallRequest {
    /// Creates a `POST` request with no body or headers.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::default(),
            body: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A step waiting to be planned, replayed or executed.
pub enum LazyStep {
    Run { name: String, func: StepFn },
    SleepFor { name: String, duration: Duration },
    SleepUntil { name: String, until: DateTime<Utc> },
    Call { name: String, request: CallRequest },
}

impl std::fmt::Debug for LazyStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run { name, .. } => {
                f.debug_struct("Run").field("name", name).finish_non_exhaustive()
            }
            Self::SleepFor { name, duration } => f
                .debug_struct("SleepFor")
                .field("name", name)
                .field("duration", duration)
                .finish(),
            Self::SleepUntil { name, until } => f
                .debug_struct("SleepUntil")
                .field("name", name)
                .field("until", until)
                .finish(),
            Self::Call { name, request } => f
                .debug_struct("Call")
                .field("name", name)
                .field("request", request)
                .finish(),
        }
    }
}

/// Awaits user code and serializes its output.
async fn run_to_value<Fut, T, E>(fut: Fut) -> std::result::Result<Value, BoxError>
where
    Fut: Future<Output = std::result::Result<T, E>>,
    T: Serialize,
    E: Into<BoxError>,
{
    let value = fut.await.map_err(|e| -> BoxError { e.into() })?;
    Ok(serde_json::to_value(value)?)
}

impl LazyStep {
    /// Creates a `Run` step from an async closure.
    ///
    /// The closure is only called if the step is open in this invocation;
    /// on replay the recorded output is returned instead.
    pub fn run<F, Fut, T, E>(name: impl Into<String>, func: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Serialize + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let func: StepFn = Box::new(move || -> StepFuture { Box::pin(run_to_value(func())) });
        Self::Run {
            name: name.into(),
            func,
        }
    }

    /// Creates a step that resumes after `duration` (second granularity).
    pub fn sleep_for(name: impl Into<String>, duration: Duration) -> Self {
        Self::SleepFor {
            name: name.into(),
            duration,
        }
    }

    /// Creates a step that resumes at `until` (second granularity).
    pub fn sleep_until(name: impl Into<String>, until: DateTime<Utc>) -> Self {
        Self::SleepUntil {
            name: name.into(),
            until,
        }
    }

    /// Creates a step whose HTTP request is performed by the platform.
    pub fn call(name: impl Into<String>, request: CallRequest) -> Self {
        Self::Call {
            name: name.into(),
            request,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Run { name, .. }
            | Self::SleepFor { name, .. }
            | Self::SleepUntil { name, .. }
            | Self::Call { name, .. } => name,
        }
    }

    pub fn step_type(&self) -> StepType {
        match self {
            Self::Run { .. } => StepType::Run,
            Self::SleepFor { .. } => StepType::SleepFor,
            Self::SleepUntil { .. } => StepType::SleepUntil,
            Self::Call { .. } => StepType::Call,
        }
    }

    /// Builds the plan record for a parallel branch.
    ///
    /// Pure: no user code runs and the record always has `stepId` 0.
    ///
    /// # Arguments
    ///
    /// * `concurrent` - Size of the parallel group
    /// * `target_step` - Logical position of this branch
    pub fn plan_step(&self, concurrent: usize, target_step: usize) -> Step {
        let mut step = Step::new(0, self.name(), self.step_type(), concurrent, target_step);
        self.attach_payload(&mut step);
        step
    }

    /// Performs the step's effect and builds its result record.
    ///
    /// # Arguments
    ///
    /// * `concurrent` - Size of the group the step belongs to (1 if sequential)
    /// * `step_id` - Logical position being resolved
    /// * `target_step` - Coordinate shared by the step's group
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::StepExecution`] if user code in a `Run`
    /// step fails. No record is produced in that case.
    pub async fn result_step(
        self,
        concurrent: usize,
        step_id: u64,
        target_step: usize,
    ) -> Result<Step> {
        let mut step = Step::new(step_id, self.name(), self.step_type(), concurrent, target_step);
        self.attach_payload(&mut step);

        match self {
            Self::Run { name, func } => {
                debug!("Executing run step '{}' at position {}", name, step_id);
                let out = func().await.map_err(|e| WorkflowError::StepExecution {
                    step_name: name.clone(),
                    message: e.to_string(),
                })?;
                Ok(step.with_out(out))
            }
            Self::Call { request, .. } => {
                step.call_url = Some(request.url);
                step.call_method = Some(request.method);
                step.call_body = request.body;
                step.call_headers = Some(request.headers);
                Ok(step)
            }
            Self::SleepFor { .. } | Self::SleepUntil { .. } => Ok(step),
        }
    }

    /// Copies the sleep parameters onto a record.
    fn attach_payload(&self, step: &mut Step) {
        match self {
            Self::SleepFor { duration, .. } => step.sleep_for = Some(duration.as_secs()),
            Self::SleepUntil { until, .. } => step.sleep_until = Some(until.timestamp()),
            Self::Run { .. } | Self::Call { .. } => {}
        }
    }
}
