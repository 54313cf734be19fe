//! Workflow Errors
//!
//! A single error type shared by the parser, the executor and the serving
//! engine. Each variant maps to the HTTP status a handler should answer
//! with, so the surrounding transport can stay oblivious to the taxonomy.

use thiserror::Error;

/// Errors raised while parsing, replaying or dispatching a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Malformed or inconsistent ledger encoding on the inbound request.
    #[error("failed to parse workflow request: {0}")]
    Parse(String),

    /// The inbound request failed signature verification.
    #[error("signature verification failed: {0}")]
    Signature(String),

    /// User code inside a step raised. The step stays unresolved.
    #[error("step '{step_name}' failed: {message}")]
    StepExecution { step_name: String, message: String },

    /// The ledger contradicts itself or the replaying function.
    #[error("workflow protocol violation: {0}")]
    ProtocolViolation(String),

    /// The invocation stopped at a step boundary.
    ///
    /// Step methods on [`WorkflowContext`](crate::execution::WorkflowContext)
    /// return this once the current invocation has nothing left to do.
    /// Propagate it with `?`; the executor turns it into the recorded outcome.
    #[error("workflow invocation suspended at a step boundary")]
    Suspended,

    /// The queue refused a continuation.
    #[error("failed to dispatch continuation: {0}")]
    Dispatch(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    /// HTTP status code the handler should respond with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Parse(_) => 400,
            Self::Signature(_) => 401,
            Self::Dispatch(_) => 502,
            Self::StepExecution { .. }
            | Self::ProtocolViolation(_)
            | Self::Suspended
            | Self::Config(_)
            | Self::Serialization(_) => 500,
        }
    }

    /// Returns true for errors that the queue's redelivery can recover from.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StepExecution { .. } | Self::Dispatch(_))
    }
}

/// Shorthand used across the crate.
pub type Result<T> = std::result::Result<T, WorkflowError>;
