//! Workflow Context
//!
//! The handle a workflow function uses to declare its steps.
//!
//! Every step method either returns the step's recorded output or
//! `Err(WorkflowError::Suspended)`, which the function propagates with `?`
//! so the invocation stops at the step boundary.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, WorkflowError};
use crate::workflow::{BoxError, CallRequest, LazyStep};

use super::executor::Executor;

/// Step API handed to the workflow function.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use stepledger::execution::WorkflowContext;
/// use stepledger::workflow::{BoxError, LazyStep};
///
/// async fn onboarding(ctx: WorkflowContext) -> stepledger::Result<()> {
///     let email: String = ctx.request_payload()?;
///
///     let user_id: u64 = ctx
///         .run("create-user", move || async move { Ok::<_, BoxError>(email.len() as u64) })
///         .await?;
///
///     ctx.sleep("cool-down", Duration::from_secs(60)).await?;
///
///     let _: Vec<String> = ctx
///         .parallel_as(vec![
///             LazyStep::run("welcome-mail", move || async move {
///                 Ok::<_, BoxError>(format!("mail {}", user_id))
///             }),
///             LazyStep::run("crm-sync", move || async move {
///                 Ok::<_, BoxError>(format!("crm {}", user_id))
///             }),
///         ])
///         .await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    executor: Executor,
}

impl WorkflowContext {
    pub(crate) fn new(executor: Executor) -> Self {
        Self { executor }
    }

    pub fn workflow_id(&self) -> &str {
        self.executor.workflow_id()
    }

    /// Endpoint continuations are delivered to.
    pub fn url(&self) -> &str {
        self.executor.url()
    }

    /// Deserializes the payload the workflow was started with.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Serialization`] if the payload does not fit `T`.
    pub fn request_payload<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self
            .executor
            .ledger()
            .request_payload()
            .cloned()
            .unwrap_or(Value::Null);
        Ok(serde_json::from_value(payload)?)
    }

    /// Runs `func` once across all invocations and returns its output.
    pub async fn run<F, Fut, T, E>(&self, name: impl Into<String>, func: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let value = self.executor.execute_step(LazyStep::run(name, func)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Pauses the workflow for `duration`.
    pub async fn sleep(&self, name: impl Into<String>, duration: Duration) -> Result<()> {
        self.executor
            .execute_step(LazyStep::sleep_for(name, duration))
            .await
            .map(|_| ())
    }

    /// Pauses the workflow until `until`.
    pub async fn sleep_until(&self, name: impl Into<String>, until: DateTime<Utc>) -> Result<()> {
        self.executor
            .execute_step(LazyStep::sleep_until(name, until))
            .await
            .map(|_| ())
    }

    /// Has the platform perform an HTTP request and returns its response.
    pub async fn call<T: DeserializeOwned>(
        &self,
        name: impl Into<String>,
        request: CallRequest,
    ) -> Result<T> {
        let value = self.executor.execute_step(LazyStep::call(name, request)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Runs the steps as one parallel group.
    ///
    /// Outputs are ordered like `steps`, whatever order the branches
    /// completed in. Sleep branches yield `null`.
    pub async fn parallel(&self, steps: Vec<LazyStep>) -> Result<Vec<Value>> {
        self.executor.execute_parallel(steps).await
    }

    /// Like [`parallel`](Self::parallel), deserializing every output as `T`.
    pub async fn parallel_as<T: DeserializeOwned>(&self, steps: Vec<LazyStep>) -> Result<Vec<T>> {
        self.parallel(steps)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(WorkflowError::from))
            .collect()
    }
}
