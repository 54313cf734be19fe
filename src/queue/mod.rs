//! Dispatcher Boundary
//!
//! The engine never talks to a message queue directly. It publishes
//! continuations through a [`QueueClient`] and checks inbound signatures
//! through a [`SignatureVerifier`]; both are opaque capabilities supplied
//! by the host.
//!
//! - [`memory`]: In-process queue for local runs and tests

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{ServeConfig, CONTINUATION_MARKER};
use crate::error::Result;
use crate::execution::Continuation;
use crate::workflow::{encode_ledger, Delay};

pub use memory::InMemoryQueue;

/// Identifier the queue assigns to a published message.
pub type DeliveryId = String;

/// Errors reported by queue collaborators.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueueError {
    #[error("queue rejected the message: {0}")]
    Rejected(String),

    #[error("queue unavailable: {0}")]
    Unavailable(String),
}

/// A message addressed back to the workflow endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Encoded records this message appends to the workflow history
    pub body: String,
    pub delay: Option<Delay>,
}

impl PublishRequest {
    /// Builds the wire message for a continuation.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Serialization`](crate::WorkflowError::Serialization)
    /// if a record cannot be encoded.
    pub fn from_continuation(continuation: &Continuation, config: &ServeConfig) -> Result<Self> {
        let mut headers = BTreeMap::new();
        headers.insert(config.internal_header.clone(), CONTINUATION_MARKER.to_string());
        headers.insert(config.workflow_id_header.clone(), continuation.workflow_id.clone());
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        Ok(Self {
            url: continuation.url.clone(),
            headers,
            body: encode_ledger(&continuation.records)?,
            delay: continuation.delay,
        })
    }
}

/// Publishes messages for later delivery.
///
/// Implementations deliver at least once: a message may arrive more than
/// once and in any order relative to other messages.
///
/// Delivery contract:
/// - On first delivery, the message's records are appended to the
///   workflow history and the history as of that append is sent.
/// - If the handler answers with a non-2xx status, the queue retries the
///   same body. The records are not appended a second time, so the retry
///   re-opens the step that failed.
/// - A publish of the same message twice is a duplicate, not a retry: each
///   copy appends its records and the later copy is discarded on replay.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Publishes a message.
    ///
    /// ## Returns
    /// The id the queue assigned to the message.
    async fn publish(&self, request: PublishRequest)
        -> std::result::Result<DeliveryId, QueueError>;
}

/// Checks that an inbound request was sent by the queue.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    /// Returns `Ok(false)` for a signature that does not match the body.
    async fn verify(&self, signature: &str, body: &str) -> std::result::Result<bool, QueueError>;
}
