//! Workflow Execution Module
//!
//! Replays a workflow function against its ledger and decides what each
//! delivery does, including the fan-out and fan-in of parallel groups.
//!
//! # Architecture
//!
//! - [`engine`]: Request handling and continuation dispatch
//! - [`executor`]: Replay of one invocation
//! - [`context`]: Step API used by workflow functions
//! - [`parallel`]: Parallel state resolver

pub mod context;
pub mod engine;
pub mod executor;
pub mod parallel;

pub use context::WorkflowContext;
pub use engine::{HandlerResponse, InvocationReport, WorkflowEngine};
pub use executor::{Continuation, Executor, InvocationOutcome};
pub use parallel::{parallel_call_state, ParallelCallState, ParallelGroup};
