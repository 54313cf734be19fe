//! History Parser
//!
//! Turns an inbound request into a workflow identity and ledger.
//!
//! Two request forms exist:
//! - **Fresh**: no continuation marker. The body is the caller's payload
//!   and becomes the `out` of a synthetic Init record.
//! - **Continuation**: marker and workflow id headers are set. The body is
//!   a JSON array of encoded step records.
//!
//! Each record travels as base64 of a JSON string that itself holds the
//! record's JSON, so payloads survive transports that mangle nested JSON.

use std::collections::BTreeMap;

use base64::{engine::general_purpose, Engine as _};
use log::{debug, info};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{ServeConfig, CONTINUATION_MARKER};
use crate::error::{Result, WorkflowError};

use super::ledger::Ledger;
use super::step::Step;

/// A request as seen by the workflow handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundRequest {
    /// Full url the request was delivered to
    pub url: String,
    /// Headers keyed by lowercase name
    headers: BTreeMap<String, String>,
    /// Raw request body
    pub body: String,
}

impl InboundRequest {
    pub fn new(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Adds a header. Names are case-insensitive.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Looks up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Workflow identity and history reconstructed from a request.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub workflow_id: String,
    pub url: String,
    pub ledger: Ledger,
    /// True when the request started a new workflow run
    pub is_first_invocation: bool,
}

/// Generates the id of a new workflow run.
pub fn generate_workflow_id() -> String {
    format!("wf{}", Uuid::new_v4().simple())
}

/// Encodes a single step record for the wire.
pub fn encode_step(step: &Step) -> Result<String> {
    let record = serde_json::to_string(step)?;
    let wrapped = serde_json::to_string(&record)?;
    Ok(general_purpose::STANDARD.encode(wrapped))
}

/// Decodes a single step record.
///
/// Accepts both the wrapped form produced by [`encode_step`] and a bare
/// record object.
pub fn decode_step(encoded: &str) -> Result<Step> {
    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| WorkflowError::Parse(format!("step is not valid base64: {}", e)))?;

    let text = String::from_utf8(bytes)
        .map_err(|e| WorkflowError::Parse(format!("step is not valid UTF-8: {}", e)))?;

    let value: Value = serde_json::from_str(&text)
        .map_err(|e| WorkflowError::Parse(format!("step is not valid JSON: {}", e)))?;

    let step = match value {
        Value::String(record) => serde_json::from_str(&record),
        other => serde_json::from_value(other),
    }
    .map_err(|e| WorkflowError::Parse(format!("step record is malformed: {}", e)))?;

    Ok(step)
}

/// Encodes records as a continuation body.
pub fn encode_ledger(steps: &[Step]) -> Result<String> {
    let encoded = steps.iter().map(encode_step).collect::<Result<Vec<_>>>()?;
    Ok(serde_json::to_string(&encoded)?)
}

/// Decodes a continuation body into records, preserving order.
pub fn decode_ledger(body: &str) -> Result<Vec<Step>> {
    let encoded: Vec<String> = serde_json::from_str(body).map_err(|e| {
        WorkflowError::Parse(format!(
            "continuation body must be a JSON array of encoded steps: {}",
            e
        ))
    })?;

    encoded
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            decode_step(entry).map_err(|e| match e {
                WorkflowError::Parse(msg) => {
                    WorkflowError::Parse(format!("entry {}: {}", index, msg))
                }
                other => other,
            })
        })
        .collect()
}

/// Interprets a fresh request body as the workflow payload.
///
/// JSON bodies are parsed; anything else is kept as a string and an empty
/// body becomes `null`.
fn parse_payload(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

/// Parses an inbound request into identity and ledger.
///
/// # Errors
///
/// Returns [`WorkflowError::Parse`] for a continuation without a workflow
/// id, with an undecodable body, or whose ledger does not start with the
/// Init record, and [`WorkflowError::ProtocolViolation`] for a ledger that
/// contradicts itself.
///
/// # Example
///
/// ```
/// use stepledger::config::ServeConfig;
/// use stepledger::workflow::{parse_request, InboundRequest};
///
/// let request = InboundRequest::new("https://app.example.com/wf", r#"{"foo":"bar"}"#);
/// let parsed = parse_request(&request, &ServeConfig::default()).unwrap();
///
/// assert!(parsed.is_first_invocation);
/// assert_eq!(parsed.ledger.len(), 1);
/// ```
pub fn parse_request(request: &InboundRequest, config: &ServeConfig) -> Result<ParsedRequest> {
    let is_continuation = request
        .header(&config.internal_header)
        .map(|v| v.trim().eq_ignore_ascii_case(CONTINUATION_MARKER))
        .unwrap_or(false);

    let url = config.url.clone().unwrap_or_else(|| request.url.clone());
    if url.trim().is_empty() {
        return Err(WorkflowError::Parse("request has no url to continue at".to_string()));
    }

    if !is_continuation {
        let workflow_id = generate_workflow_id();
        info!("Starting workflow run {}", workflow_id);

        return Ok(ParsedRequest {
            workflow_id,
            url,
            ledger: Ledger::fresh(parse_payload(&request.body)),
            is_first_invocation: true,
        });
    }

    let workflow_id = request
        .header(&config.workflow_id_header)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| {
            WorkflowError::Parse(format!(
                "continuation request is missing the {} header",
                config.workflow_id_header
            ))
        })?
        .to_string();

    let ledger = Ledger::new(decode_ledger(&request.body)?);
    debug!("Decoded {} records for workflow {}", ledger.len(), workflow_id);

    if ledger.init().is_none() {
        return Err(WorkflowError::Parse(
            "continuation ledger must start with the init record".to_string(),
        ));
    }

    ledger.validate()?;

    Ok(ParsedRequest {
        workflow_id,
        url,
        ledger,
        is_first_invocation: false,
    })
}
