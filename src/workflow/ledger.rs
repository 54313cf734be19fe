//! Workflow Ledger
//!
//! The ordered, append-only list of step records carried by every request.
//! It is the only state that survives between invocations: the executor
//! reads it, never mutates it, and hands the queue a new copy with the
//! records it wants appended.

use std::collections::HashMap;

use log::{debug, warn};
use serde_json::Value;

use crate::error::{Result, WorkflowError};

use super::step::{Step, StepRole};

/// Read-only view over a workflow's step history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger {
    steps: Vec<Step>,
}

impl Ledger {
    /// Wraps an ordered list of records.
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Creates the ledger of a fresh invocation.
    pub fn fresh(payload: Value) -> Self {
        Self::new(vec![Step::init(payload)])
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the Init record, if the ledger starts with one.
    pub fn init(&self) -> Option<&Step> {
        self.steps.first().filter(|s| s.role() == StepRole::Init)
    }

    /// Returns the payload the workflow was started with.
    pub fn request_payload(&self) -> Option<&Value> {
        self.init().and_then(|s| s.out.as_ref())
    }

    /// Returns the record whose delivery triggered this invocation.
    ///
    /// The queue appends a message's records to the history when it
    /// delivers the message, so the last record is always the newest one.
    pub fn trigger(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// Returns the authoritative settling record for a logical position.
    ///
    /// The first settling record wins; later copies are redeliveries.
    pub fn settled(&self, step_id: u64) -> Option<&Step> {
        self.steps
            .iter()
            .find(|s| s.step_id == step_id && s.settles())
    }

    /// Returns every result record for a logical position, settling or not.
    pub fn results_for(&self, step_id: u64) -> impl Iterator<Item = &Step> {
        self.steps
            .iter()
            .filter(move |s| s.is_result() && s.step_id == step_id)
    }

    /// Iterates over plan records.
    pub fn plans(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.is_plan())
    }

    /// Highest resolved step id, 0 if nothing has resolved yet.
    pub fn max_step_id(&self) -> u64 {
        self.steps.iter().map(|s| s.step_id).max().unwrap_or(0)
    }

    /// Returns true if the trigger repeats an earlier record.
    ///
    /// That happens when the queue redelivers a message whose records were
    /// already folded into the history.
    pub fn is_redundant_trigger(&self) -> bool {
        let Some((trigger, earlier)) = self.steps.split_last() else {
            return false;
        };

        match trigger.role() {
            StepRole::Result => earlier.iter().any(|s| {
                s.is_result() && s.same_identity(trigger) && s.settles() == trigger.settles()
            }),
            StepRole::Plan => earlier.iter().any(|s| {
                s.is_plan()
                    && s.concurrent == trigger.concurrent
                    && s.target_step == trigger.target_step
            }),
            StepRole::Init => false,
        }
    }

    /// Returns a copy of this ledger with `records` appended.
    pub fn appended(&self, records: &[Step]) -> Ledger {
        let mut steps = self.steps.clone();
        steps.extend_from_slice(records);
        Ledger::new(steps)
    }

    /// Checks the structural invariants of the ledger.
    ///
    /// Performs the following checks:
    /// 1. The first record is the Init record, and it is the only one
    /// 2. Every record belongs to a group of at least one step
    /// 3. A parallel result resolves a position inside its group
    /// 4. Results sharing a step id agree on type, group and coordinate
    ///
    /// Inconsistencies are never repaired; they abort the workflow.
    pub fn validate(&self) -> Result<()> {
        debug!("Validating ledger with {} records", self.steps.len());

        if self.init().is_none() {
            return Err(WorkflowError::ProtocolViolation(
                "ledger does not start with an init record".to_string(),
            ));
        }

        let mut seen: HashMap<u64, &Step> = HashMap::new();

        for (index, step) in self.steps.iter().enumerate().skip(1) {
            if step.role() == StepRole::Init {
                return Err(WorkflowError::ProtocolViolation(format!(
                    "unexpected init record at ledger position {}",
                    index
                )));
            }

            if step.concurrent == 0 {
                return Err(WorkflowError::ProtocolViolation(format!(
                    "record {} declares a group of zero steps",
                    step.summary()
                )));
            }

            if !step.is_result() {
                continue;
            }

            if step.concurrent > 1 {
                let start = step.target_step as u64;
                let end = start + step.concurrent as u64;
                if step.step_id < start || step.step_id >= end {
                    return Err(WorkflowError::ProtocolViolation(format!(
                        "result {} lies outside its parallel group",
                        step.summary()
                    )));
                }
            }

            match seen.get(&step.step_id) {
                Some(first) if !first.same_identity(step) => {
                    return Err(WorkflowError::ProtocolViolation(format!(
                        "conflicting records for step {}: {} vs {}",
                        step.step_id,
                        first.summary(),
                        step.summary()
                    )));
                }
                Some(_) => {
                    warn!("Duplicate record for step {} in ledger", step.step_id);
                }
                None => {
                    seen.insert(step.step_id, step);
                }
            }
        }

        Ok(())
    }
}
