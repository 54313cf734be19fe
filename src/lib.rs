//! Stepledger - Durable Workflows on Stateless Handlers
//!
//! Runs multi-step workflows on top of stateless HTTP handlers. The only
//! state is the ordered ledger of step records that travels with every
//! request; each invocation replays the workflow function against it,
//! executes exactly one new unit of work and hands a continuation to a
//! message queue.
//!
//! # Architecture
//!
//! The library is organized into four main modules:
//!
//! - [`workflow`]: Step records, lazy steps, the ledger and its wire format
//! - [`execution`]: Replay executor, parallel resolver and serving engine
//! - [`queue`]: Queue and signature collaborators, plus an in-memory queue
//! - [`config`]: Header names, continuation url and verification settings
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stepledger::{InboundRequest, ServeConfig, WorkflowContext, WorkflowEngine};
//! use stepledger::queue::InMemoryQueue;
//! use stepledger::workflow::BoxError;
//!
//! async fn reminder(ctx: WorkflowContext) -> stepledger::Result<()> {
//!     let user: String = ctx.request_payload()?;
//!     ctx.sleep("wait-a-day", Duration::from_secs(86_400)).await?;
//!     let _: bool = ctx
//!         .run("send-reminder", move || async move { Ok::<_, BoxError>(!user.is_empty()) })
//!         .await?;
//!     Ok(())
//! }
//!
//! # async fn serve(request: InboundRequest) {
//! // Without a verifier, signature checks must be switched off explicitly
//! let config = ServeConfig::default().with_signature_verification(false);
//! let engine = WorkflowEngine::new(config, Arc::new(InMemoryQueue::new()));
//! let response = engine.serve(&request, reminder).await;
//! println!("{} {}", response.status, response.body);
//! # }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod queue;
pub mod workflow;

// Re-export commonly used types
pub use config::ServeConfig;
pub use error::{Result, WorkflowError};
pub use execution::{Executor, InvocationOutcome, WorkflowContext, WorkflowEngine};
pub use workflow::{InboundRequest, LazyStep, Ledger, Step, StepType};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Stepledger";
