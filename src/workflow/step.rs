//! Step Record Model
//!
//! The immutable unit of workflow history. Every invocation receives the
//! full list of step records and appends new ones; nothing is ever edited
//! in place.
//!
//! # Example JSON Format
//!
//! ```json
//! {
//!   "stepId": 2,
//!   "stepName": "charge-card",
//!   "stepType": "Run",
//!   "concurrent": 1,
//!   "targetStep": 2,
//!   "out": { "receipt": "r_123" }
//! }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Step variant recorded in the ledger.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepType {
    /// Synthetic first record holding the inbound payload
    Init,
    /// Caller-supplied code
    Run,
    /// Relative delay
    SleepFor,
    /// Absolute wake time
    SleepUntil,
    /// Outbound HTTP request performed by the platform
    Call,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Init => "Init",
            Self::Run => "Run",
            Self::SleepFor => "SleepFor",
            Self::SleepUntil => "SleepUntil",
            Self::Call => "Call",
        };
        f.write_str(name)
    }
}

/// HTTP methods a `Call` step may use.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
    Put,
    Patch,
    Delete,
}

/// What a record means in the ledger.
///
/// `stepId == 0` is shared by the Init record and by Plan records, so the
/// role is derived here once instead of being re-guessed by every caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepRole {
    /// Position 0, carries the request payload
    Init,
    /// Declares a parallel branch before it runs
    Plan,
    /// A resolved step effect
    Result,
}

/// A single ledger record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// `0` for Init and Plan records, the resolved logical position otherwise
    pub step_id: u64,

    /// Developer-supplied label (not used for identity)
    pub step_name: String,

    /// Variant of the step. Legacy records may omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_type: Option<StepType>,

    /// Size of the parallel group this record belongs to
    #[serde(default = "default_concurrent")]
    pub concurrent: usize,

    /// Branch coordinate on a Plan, group coordinate on a Result
    #[serde(default)]
    pub target_step: usize,

    /// Resolved payload (Init, Run, Call response)
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub out: Option<Value>,

    /// Delay in seconds for `SleepFor`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_for: Option<u64>,

    /// Unix timestamp (seconds) for `SleepUntil`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_until: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_method: Option<HttpMethod>,

    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub call_body: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_headers: Option<BTreeMap<String, String>>,
}

fn default_concurrent() -> usize {
    1
}

/// Keeps an explicit `null` as `Some(Value::Null)`.
///
/// A `Run` step returning `()` resolves to `null`, and that must survive a
/// round trip distinct from "no output".
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Step {
    /// Creates a bare record with the given identity and no payload.
    pub fn new(
        step_id: u64,
        step_name: impl Into<String>,
        step_type: StepType,
        concurrent: usize,
        target_step: usize,
    ) -> Self {
        Self {
            step_id,
            step_name: step_name.into(),
            step_type: Some(step_type),
            concurrent,
            target_step,
            out: None,
            sleep_for: None,
            sleep_until: None,
            call_url: None,
            call_method: None,
            call_body: None,
            call_headers: None,
        }
    }

    /// The synthetic Init record for a fresh invocation.
    ///
    /// # Example
    ///
    /// ```
    /// use stepledger::workflow::{Step, StepRole};
    ///
    /// let init = Step::init(serde_json::json!({"foo": "bar"}));
    /// assert_eq!(init.role(), StepRole::Init);
    /// assert_eq!(init.step_name, "init");
    /// ```
    pub fn init(payload: Value) -> Self {
        Self::new(0, "init", StepType::Init, 1, 0).with_out(payload)
    }

    /// Sets the resolved payload.
    pub fn with_out(mut self, out: Value) -> Self {
        self.out = Some(out);
        self
    }

    /// Returns the role of this record in the ledger.
    pub fn role(&self) -> StepRole {
        if self.step_id > 0 {
            return StepRole::Result;
        }
        match self.step_type {
            Some(StepType::Init) => StepRole::Init,
            Some(_) => StepRole::Plan,
            // Untyped legacy records: only Init carries an output at id 0
            None if self.out.is_some() => StepRole::Init,
            None => StepRole::Plan,
        }
    }

    pub fn is_plan(&self) -> bool {
        self.role() == StepRole::Plan
    }

    pub fn is_result(&self) -> bool {
        self.role() == StepRole::Result
    }

    /// Returns true if this record carries the final outcome of its step.
    ///
    /// A `Call` result is first recorded as the outgoing request; the
    /// position only settles once the platform merges the response as a
    /// record with `out`.
    pub fn settles(&self) -> bool {
        match self.role() {
            StepRole::Result => match self.step_type {
                Some(StepType::Call) => self.out.is_some(),
                _ => true,
            },
            _ => false,
        }
    }

    /// Returns true if both records describe the same resolved step.
    pub fn same_identity(&self, other: &Step) -> bool {
        self.step_id == other.step_id
            && self.step_type == other.step_type
            && self.concurrent == other.concurrent
            && self.target_step == other.target_step
    }

    /// One-line description used in logs and by the inspector.
    pub fn summary(&self) -> String {
        let kind = self
            .step_type
            .map(|t| t.to_string())
            .unwrap_or_else(|| "?".to_string());
        format!(
            "#{} {} '{}' (concurrent {}, target {})",
            self.step_id, kind, self.step_name, self.concurrent, self.target_step
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_init_record() {
        let init = Step::init(json!({"foo": "bar"}));
        assert_eq!(init.step_id, 0);
        assert_eq!(init.concurrent, 1);
        assert_eq!(init.target_step, 0);
        assert_eq!(init.out, Some(json!({"foo": "bar"})));
        assert_eq!(init.role(), StepRole::Init);
    }

    #[test]
    fn test_camel_case_field_names() {
        let step = Step::new(3, "fetch", StepType::Run, 1, 3).with_out(json!(1));
        let value = serde_json::to_value(&step).unwrap();

        assert_eq!(value["stepId"], json!(3));
        assert_eq!(value["stepName"], json!("fetch"));
        assert_eq!(value["stepType"], json!("Run"));
        assert_eq!(value["targetStep"], json!(3));
        assert!(value.get("sleepFor").is_none());
    }

    #[test]
    fn test_roles() {
        let plan = Step::new(0, "a", StepType::Run, 2, 1);
        let result = Step::new(1, "a", StepType::Run, 2, 1).with_out(json!("x"));

        assert_eq!(plan.role(), StepRole::Plan);
        assert!(plan.is_plan());
        assert_eq!(result.role(), StepRole::Result);
        assert!(result.is_result());
    }

    #[test]
    fn test_untyped_legacy_records() {
        let init: Step = serde_json::from_str(
            r#"{"stepId":0,"stepName":"init","out":{"foo":"bar"},"concurrent":1,"targetStep":0}"#,
        )
        .unwrap();
        let plan: Step =
            serde_json::from_str(r#"{"stepId":0,"stepName":"mock","concurrent":2,"targetStep":1}"#)
                .unwrap();

        assert_eq!(init.step_type, None);
        assert_eq!(init.role(), StepRole::Init);
        assert_eq!(plan.role(), StepRole::Plan);
    }

    #[test]
    fn test_null_output_survives_roundtrip() {
        let step = Step::new(1, "void", StepType::Run, 1, 1).with_out(Value::Null);
        let json = serde_json::to_string(&step).unwrap();
        assert!(json.contains("\"out\":null"));

        let decoded: Step = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, step);
        assert_eq!(decoded.out, Some(Value::Null));
    }

    #[test]
    fn test_settles() {
        let run = Step::new(1, "r", StepType::Run, 1, 1).with_out(json!(1));
        let sleep = Step::new(2, "s", StepType::SleepFor, 1, 2);
        let call_request = Step::new(3, "c", StepType::Call, 1, 3);
        let call_response = call_request.clone().with_out(json!({"status": 200}));
        let plan = Step::new(0, "p", StepType::Run, 2, 4);

        assert!(run.settles());
        assert!(sleep.settles());
        assert!(!call_request.settles());
        assert!(call_response.settles());
        assert!(!plan.settles());
        assert!(!Step::init(json!(null)).settles());
    }

    #[test]
    fn test_same_identity_ignores_output() {
        let a = Step::new(2, "x", StepType::Run, 2, 1).with_out(json!("first"));
        let b = Step::new(2, "y", StepType::Run, 2, 1).with_out(json!("second"));
        let c = Step::new(2, "x", StepType::Run, 1, 2);

        assert!(a.same_identity(&b));
        assert!(!a.same_identity(&c));
    }

    #[test]
    fn test_http_method_serialization() {
        assert_eq!(serde_json::to_value(HttpMethod::Get).unwrap(), json!("GET"));
        assert_eq!(HttpMethod::default(), HttpMethod::Post);
    }

    #[test]
    fn test_summary() {
        let step = Step::new(4, "notify", StepType::Call, 1, 4);
        assert_eq!(step.summary(), "#4 Call 'notify' (concurrent 1, target 4)");
    }
}
