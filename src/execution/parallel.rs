//! Parallel State Resolver
//!
//! Decides what an invocation does when the workflow reaches a parallel
//! group. The decision is a pure function of the group's shape and the
//! ledger, recomputed on every delivery, so duplicated or reordered
//! deliveries cannot corrupt the fan-in.
//!
//! A group of `K` steps starting at logical position `T` occupies
//! positions `T..T+K`. Branch `i`:
//! - is declared by a Plan with `concurrent = K`, `targetStep = T + i`
//! - is resolved by a Result with `stepId = T + i`, `concurrent = K`,
//!   `targetStep = T`

use std::collections::BTreeMap;

use log::debug;
use serde_json::Value;

use crate::error::{Result, WorkflowError};
use crate::workflow::{Ledger, Step, StepRole};

/// What the current delivery means for a parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelCallState {
    /// Nothing planned yet: fan out one message per branch
    First,
    /// The delivery of a planned branch: run that branch only
    Partial { branch: usize },
    /// Nothing new for this group: stop silently
    Discard,
    /// The final branch landed: resume with all outputs
    Last,
}

impl std::fmt::Display for ParallelCallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::First => write!(f, "first"),
            Self::Partial { branch } => write!(f, "partial (branch {})", branch),
            Self::Discard => write!(f, "discard"),
            Self::Last => write!(f, "last"),
        }
    }
}

/// The records of one parallel group, gathered from the ledger.
#[derive(Debug, Clone)]
pub struct ParallelGroup<'a> {
    concurrent: usize,
    target_step: usize,
    /// Plan per branch index
    plans: BTreeMap<usize, &'a Step>,
    /// First settling result per branch index
    settled: BTreeMap<usize, &'a Step>,
    /// Whether any result exists for the group, settled or not
    has_results: bool,
}

impl<'a> ParallelGroup<'a> {
    /// Collects the group's records.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::ProtocolViolation`] if a record at one of the
    /// group's positions disagrees with the group's shape, if a result
    /// names the group from outside its positions, or if results exist
    /// without any plan.
    pub fn collect(concurrent: usize, target_step: usize, ledger: &'a Ledger) -> Result<Self> {
        if concurrent == 0 || target_step == 0 {
            return Err(WorkflowError::ProtocolViolation(format!(
                "invalid parallel group of {} at position {}",
                concurrent, target_step
            )));
        }

        let end = target_step + concurrent;
        let mut group = Self {
            concurrent,
            target_step,
            plans: BTreeMap::new(),
            settled: BTreeMap::new(),
            has_results: false,
        };

        for step in ledger.steps() {
            match step.role() {
                StepRole::Init => {}
                StepRole::Plan => {
                    if step.target_step < target_step || step.target_step >= end {
                        continue;
                    }
                    if step.concurrent != concurrent {
                        return Err(mismatch(step, concurrent, target_step));
                    }
                    group.plans.entry(step.target_step - target_step).or_insert(step);
                }
                StepRole::Result => {
                    let position = step.step_id as usize;
                    if position < target_step || position >= end {
                        // Claims this group but sits outside its positions
                        if step.concurrent == concurrent && step.target_step == target_step {
                            return Err(mismatch(step, concurrent, target_step));
                        }
                        continue;
                    }
                    if step.concurrent != concurrent || step.target_step != target_step {
                        return Err(mismatch(step, concurrent, target_step));
                    }
                    group.has_results = true;
                    if step.settles() {
                        group.settled.entry(position - target_step).or_insert(step);
                    }
                }
            }
        }

        if group.has_results && group.plans.is_empty() {
            return Err(WorkflowError::ProtocolViolation(format!(
                "parallel group at position {} has results but no plan",
                target_step
            )));
        }

        Ok(group)
    }

    /// Returns true if the record is one of this group's plans or results.
    pub fn contains(&self, step: &Step) -> bool {
        let end = self.target_step + self.concurrent;
        match step.role() {
            StepRole::Init => false,
            StepRole::Plan => {
                step.concurrent == self.concurrent
                    && step.target_step >= self.target_step
                    && step.target_step < end
            }
            StepRole::Result => {
                let position = step.step_id as usize;
                step.concurrent == self.concurrent
                    && step.target_step == self.target_step
                    && position >= self.target_step
                    && position < end
            }
        }
    }

    /// Number of branches whose outcome is in the ledger.
    pub fn settled_count(&self) -> usize {
        self.settled.len()
    }

    pub fn is_complete(&self) -> bool {
        self.settled.len() == self.concurrent
    }

    /// Plan record of a branch, if it was planned.
    pub fn plan(&self, branch: usize) -> Option<&'a Step> {
        self.plans.get(&branch).copied()
    }

    /// Settling result of a branch, if it resolved.
    pub fn result(&self, branch: usize) -> Option<&'a Step> {
        self.settled.get(&branch).copied()
    }

    /// Branch outputs ordered by branch index, not by arrival.
    ///
    /// Branches without a payload (sleeps) contribute `null`.
    pub fn outputs(&self) -> Vec<Value> {
        (0..self.concurrent)
            .map(|branch| {
                self.settled
                    .get(&branch)
                    .and_then(|s| s.out.clone())
                    .unwrap_or(Value::Null)
            })
            .collect()
    }

    /// Classifies the delivery that carried `ledger`.
    pub fn classify(&self, ledger: &Ledger) -> ParallelCallState {
        if self.plans.is_empty() && !self.has_results {
            return ParallelCallState::First;
        }

        let Some(trigger) = ledger.trigger() else {
            return ParallelCallState::Discard;
        };

        if !self.contains(trigger) {
            // Deliveries that belong elsewhere carry no news for this group
            return ParallelCallState::Discard;
        }

        match trigger.role() {
            StepRole::Plan => {
                let branch = trigger.target_step - self.target_step;
                if self.settled.contains_key(&branch) {
                    ParallelCallState::Discard
                } else {
                    ParallelCallState::Partial { branch }
                }
            }
            StepRole::Result => {
                if !trigger.settles() || ledger.is_redundant_trigger() {
                    ParallelCallState::Discard
                } else if self.is_complete() {
                    ParallelCallState::Last
                } else {
                    ParallelCallState::Discard
                }
            }
            StepRole::Init => ParallelCallState::Discard,
        }
    }
}

fn mismatch(step: &Step, concurrent: usize, target_step: usize) -> WorkflowError {
    WorkflowError::ProtocolViolation(format!(
        "record {} conflicts with parallel group of {} at position {}",
        step.summary(),
        concurrent,
        target_step
    ))
}

/// Classifies the current delivery for the group `(concurrent, target_step)`.
///
/// # Example
///
/// ```
/// use stepledger::execution::{parallel_call_state, ParallelCallState};
/// use stepledger::workflow::{Ledger, Step, StepType};
///
/// let ledger = Ledger::new(vec![Step::init(serde_json::json!(null))]);
/// assert_eq!(parallel_call_state(2, 1, &ledger).unwrap(), ParallelCallState::First);
///
/// let planned = ledger.appended(&[Step::new(0, "a", StepType::Run, 2, 1)]);
/// assert_eq!(
///     parallel_call_state(2, 1, &planned).unwrap(),
///     ParallelCallState::Partial { branch: 0 }
/// );
/// ```
pub fn parallel_call_state(
    concurrent: usize,
    target_step: usize,
    ledger: &Ledger,
) -> Result<ParallelCallState> {
    let group = ParallelGroup::collect(concurrent, target_step, ledger)?;
    let state = group.classify(ledger);
    debug!(
        "Parallel group of {} at {}: {} ({} settled)",
        concurrent,
        target_step,
        state,
        group.settled_count()
    );
    Ok(state)
}
