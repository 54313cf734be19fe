//! Workflow Serving Engine
//!
//! Glue between a transport and the executor. For each inbound request:
//! - Verifies the queue signature, when configured
//! - Parses the request into a workflow id and ledger
//! - Replays the workflow function through the [`Executor`]
//! - Publishes the resulting continuations

use std::future::Future;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::json;

use crate::config::ServeConfig;
use crate::error::{Result, WorkflowError};
use crate::queue::{DeliveryId, PublishRequest, QueueClient, SignatureVerifier};
use crate::workflow::{parse_request, InboundRequest};

use super::context::WorkflowContext;
use super::executor::{Executor, InvocationOutcome};

/// What one handled request did.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationReport {
    pub workflow_id: String,
    pub outcome: InvocationOutcome,
    /// Ids of the continuations published, in order
    pub delivery_ids: Vec<DeliveryId>,
}

/// Status and JSON body to answer the transport with.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerResponse {
    pub status: u16,
    pub body: String,
}

impl HandlerResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Serves a workflow endpoint.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use stepledger::config::ServeConfig;
/// use stepledger::execution::WorkflowEngine;
/// use stepledger::queue::InMemoryQueue;
/// use stepledger::workflow::{BoxError, InboundRequest};
///
/// # async fn example() {
/// let engine = WorkflowEngine::new(
///     ServeConfig::default().with_signature_verification(false),
///     Arc::new(InMemoryQueue::new()),
/// );
///
/// let request = InboundRequest::new("https://app.example.com/wf", r#""hello""#);
/// let response = engine
///     .serve(&request, |ctx| async move {
///         let greeting: String = ctx.request_payload()?;
///         ctx.run("shout", move || async move { Ok::<_, BoxError>(greeting.to_uppercase()) })
///             .await
///             .map(|_: String| ())
///     })
///     .await;
///
/// assert_eq!(response.status, 200);
/// # }
/// ```
pub struct WorkflowEngine {
    config: ServeConfig,
    queue: Arc<dyn QueueClient>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
}

impl WorkflowEngine {
    /// Creates an engine publishing through `queue`.
    pub fn new(config: ServeConfig, queue: Arc<dyn QueueClient>) -> Self {
        Self {
            config,
            queue,
            verifier: None,
        }
    }

    /// Sets the verifier used for inbound signatures.
    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn config(&self) -> &ServeConfig {
        &self.config
    }

    /// Handles one delivery.
    ///
    /// This is the main entry point that:
    /// 1. Checks the request signature
    /// 2. Parses the workflow history
    /// 3. Runs the workflow function against it
    /// 4. Publishes every continuation the invocation produced
    ///
    /// # Returns
    ///
    /// * `Ok(report)` - The invocation finished and its messages are queued
    /// * `Err` - Nothing was published; the queue should redeliver or drop
    pub async fn handle<F, Fut>(
        &self,
        request: &InboundRequest,
        route: F,
    ) -> Result<InvocationReport>
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.verify(request).await?;

        let parsed = parse_request(request, &self.config)?;
        let workflow_id = parsed.workflow_id.clone();
        debug!(
            "Workflow {}: {} record(s), first invocation: {}",
            workflow_id,
            parsed.ledger.len(),
            parsed.is_first_invocation
        );

        let outcome = Executor::from_parsed(parsed).run(route).await?;

        let mut delivery_ids = Vec::new();
        for continuation in outcome.continuations() {
            let message = PublishRequest::from_continuation(continuation, &self.config)?;
            let id = self
                .queue
                .publish(message)
                .await
                .map_err(|e| WorkflowError::Dispatch(e.to_string()))?;
            debug!("Workflow {}: published {}", workflow_id, id);
            delivery_ids.push(id);
        }

        info!("Workflow {}: {}", workflow_id, outcome);

        Ok(InvocationReport {
            workflow_id,
            outcome,
            delivery_ids,
        })
    }

    /// Handles one delivery and renders the result for the transport.
    pub async fn serve<F, Fut>(&self, request: &InboundRequest, route: F) -> HandlerResponse
    where
        F: FnOnce(WorkflowContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        match self.handle(request, route).await {
            Ok(report) => HandlerResponse {
                status: 200,
                body: json!({ "workflowRunId": report.workflow_id }).to_string(),
            },
            Err(e) => {
                if e.is_retryable() {
                    warn!("Workflow request failed, queue will retry: {}", e);
                } else {
                    error!("Workflow request failed: {}", e);
                }
                HandlerResponse {
                    status: e.status_code(),
                    body: json!({ "error": e.to_string() }).to_string(),
                }
            }
        }
    }

    /// Rejects a request whose signature cannot be checked.
    ///
    /// With verification on and no verifier installed every request is
    /// refused; turn verification off explicitly to accept unsigned traffic.
    async fn verify(&self, request: &InboundRequest) -> Result<()> {
        if !self.config.verify_signatures {
            return Ok(());
        }

        let Some(verifier) = &self.verifier else {
            return Err(WorkflowError::Signature(
                "signature verification is on but no verifier is configured".to_string(),
            ));
        };

        let signature = request.header(&self.config.signature_header).ok_or_else(|| {
            WorkflowError::Signature(format!("missing {} header", self.config.signature_header))
        })?;

        let valid = verifier
            .verify(signature, &request.body)
            .await
            .map_err(|e| WorkflowError::Signature(e.to_string()))?;

        if !valid {
            return Err(WorkflowError::Signature("signature does not match body".to_string()));
        }
        Ok(())
    }
}
