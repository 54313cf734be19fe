//! Workflow History Module
//!
//! Provides the step records a workflow's history is made of, the lazy
//! steps that produce them, and the parsing of inbound requests into a
//! ledger.
//!
//! # Structure
//!
//! - [`step`]: Ledger record model (Step, StepType, StepRole)
//! - [`lazy`]: Step variants awaiting planning or execution
//! - [`ledger`]: Read-only view and structural validation of the history
//! - [`parser`]: Wire encoding and request parsing

pub mod lazy;
pub mod ledger;
pub mod parser;
pub mod step;

pub use lazy::{BoxError, CallRequest, Delay, LazyStep};
pub use ledger::Ledger;
pub use parser::{
    decode_ledger,
    decode_step,
    encode_ledger,
    encode_step,
    parse_request,
    InboundRequest,
    ParsedRequest,
};
pub use step::{HttpMethod, Step, StepRole, StepType};
