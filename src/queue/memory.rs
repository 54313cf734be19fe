//! In-Memory Queue
//!
//! A [`QueueClient`] that keeps everything in process. It mirrors what the
//! hosted queue does with workflow messages:
//!
//! 1. Published messages wait until their delay has passed
//! 2. On delivery, the message's records are appended to the workflow's
//!    history and the whole history is sent as the request body
//! 3. A `Call` request record is answered right away by appending a
//!    response record for the same step
//! 4. A delivery the handler failed is retried with the same body via
//!    [`InMemoryQueue::redeliver`], without appending again
//!
//! Time is virtual: delivering a delayed message advances the clock
//! instead of sleeping.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::config::DEFAULT_WORKFLOW_ID_HEADER;
use crate::error::Result;
use crate::workflow::{decode_ledger, encode_ledger, InboundRequest, Step, StepRole, StepType};

use super::{DeliveryId, PublishRequest, QueueClient, QueueError};

/// Produces the response recorded for a `Call` step.
pub type CallResponder = Arc<dyn Fn(&Step) -> Value + Send + Sync>;

#[derive(Debug, Clone)]
struct PendingMessage {
    id: DeliveryId,
    sequence: u64,
    not_before: DateTime<Utc>,
    workflow_id: String,
    request: PublishRequest,
}

#[derive(Debug)]
struct QueueState {
    histories: HashMap<String, Vec<Step>>,
    pending: Vec<PendingMessage>,
    /// Failed deliveries waiting to be sent again as they were
    retries: VecDeque<InboundRequest>,
    published: Vec<(DeliveryId, PublishRequest)>,
    next_sequence: u64,
    clock: DateTime<Utc>,
    available: bool,
}

/// In-process queue with per-workflow histories.
///
/// # Example
///
/// ```
/// use stepledger::queue::InMemoryQueue;
///
/// let queue = InMemoryQueue::new();
/// assert_eq!(queue.pending(), 0);
/// assert!(queue.next_delivery().unwrap().is_none());
/// ```
pub struct InMemoryQueue {
    responder: CallResponder,
    state: Mutex<QueueState>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl InMemoryQueue {
    /// Creates a queue starting at the current time.
    pub fn new() -> Self {
        Self {
            responder: Arc::new(|_| json!({"status": 200})),
            state: Mutex::new(QueueState {
                histories: HashMap::new(),
                pending: Vec::new(),
                retries: VecDeque::new(),
                published: Vec::new(),
                next_sequence: 0,
                clock: Utc::now(),
                available: true,
            }),
        }
    }

    /// Sets the virtual clock.
    pub fn with_clock(self, now: DateTime<Utc>) -> Self {
        self.lock().clock = now;
        self
    }

    /// Sets how `Call` steps are answered.
    pub fn with_call_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&Step) -> Value + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes `publish` fail with [`QueueError::Unavailable`] while false.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Number of messages waiting for delivery, retries included.
    pub fn pending(&self) -> usize {
        let state = self.lock();
        state.pending.len() + state.retries.len()
    }

    /// Every message published so far, in publish order.
    pub fn published(&self) -> Vec<PublishRequest> {
        self.lock()
            .published
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    /// Looks up a published message by the id `publish` returned.
    pub fn published_message(&self, id: &str) -> Option<PublishRequest> {
        self.lock()
            .published
            .iter()
            .find(|(published_id, _)| published_id == id)
            .map(|(_, request)| request.clone())
    }

    /// The history accumulated for a workflow.
    pub fn history(&self, workflow_id: &str) -> Vec<Step> {
        self.lock()
            .histories
            .get(workflow_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Current virtual time.
    pub fn now(&self) -> DateTime<Utc> {
        self.lock().clock
    }

    /// Schedules a failed delivery to be sent again unchanged.
    ///
    /// The history is not touched: the retry carries the same records as
    /// the failed attempt, so the step that failed is open again.
    /// Retries go out before any pending message.
    pub fn redeliver(&self, request: InboundRequest) {
        warn!("Scheduling retry of a failed delivery to {}", request.url);
        self.lock().retries.push_back(request);
    }

    /// Delivers the next due message.
    ///
    /// Retries come first. Other messages are delivered by earliest
    /// delivery time, then publish order. Returns `Ok(None)` when nothing
    /// is pending.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Parse`](crate::WorkflowError::Parse) if a
    /// message body does not decode.
    pub fn next_delivery(&self) -> Result<Option<InboundRequest>> {
        let mut state = self.lock();

        if let Some(retry) = state.retries.pop_front() {
            debug!("Retrying delivery to {}", retry.url);
            return Ok(Some(retry));
        }

        let Some(index) = state
            .pending
            .iter()
            .enumerate()
            .min_by_key(|(_, m)| (m.not_before, m.sequence))
            .map(|(i, _)| i)
        else {
            return Ok(None);
        };

        let message = state.pending.remove(index);
        if message.not_before > state.clock {
            state.clock = message.not_before;
        }

        let records = decode_ledger(&message.request.body)?;
        let history = state.histories.entry(message.workflow_id.clone()).or_default();
        for record in records {
            let has_init = history.iter().any(|s| s.role() == StepRole::Init);
            if record.role() == StepRole::Init && has_init {
                continue;
            }
            let is_call_request = record.is_result()
                && record.step_type == Some(StepType::Call)
                && !record.settles();
            let response = is_call_request.then(|| {
                let out = (self.responder)(&record);
                record.clone().with_out(out)
            });

            history.push(record);
            history.extend(response);
        }

        debug!(
            "Delivering {} for workflow {} ({} record(s) in history)",
            message.id,
            message.workflow_id,
            history.len()
        );

        let body = encode_ledger(history)?;
        let mut request = InboundRequest::new(message.request.url.clone(), body);
        for (name, value) in &message.request.headers {
            request = request.with_header(name, value.clone());
        }

        Ok(Some(request))
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn publish(
        &self,
        request: PublishRequest,
    ) -> std::result::Result<DeliveryId, QueueError> {
        let workflow_id = request
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(DEFAULT_WORKFLOW_ID_HEADER))
            .map(|(_, value)| value.clone())
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                QueueError::Rejected(format!("missing {} header", DEFAULT_WORKFLOW_ID_HEADER))
            })?;

        decode_ledger(&request.body).map_err(|e| QueueError::Rejected(e.to_string()))?;

        let mut state = self.lock();
        if !state.available {
            return Err(QueueError::Unavailable("in-memory queue is paused".to_string()));
        }

        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let id = format!("msg_{}", sequence);
        let not_before = request
            .delay
            .map(|delay| delay.not_before(state.clock))
            .unwrap_or(state.clock);

        info!("Published {} to {} (deliver at {})", id, request.url, not_before);

        state.published.push((id.clone(), request.clone()));
        state.pending.push(PendingMessage {
            id: id.clone(),
            sequence,
            not_before,
            workflow_id,
            request,
        });

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServeConfig;
    use crate::execution::Continuation;
    use crate::workflow::Delay;
    use chrono::TimeZone;
    use std::time::Duration;

    fn message(records: Vec<Step>, delay: Option<Delay>) -> PublishRequest {
        let continuation = Continuation {
            workflow_id: "wf-mem".to_string(),
            url: "https://app.example.com/wf".to_string(),
            records,
            delay,
        };
        PublishRequest::from_continuation(&continuation, &ServeConfig::default()).unwrap()
    }

    fn plan(name: &str, target: usize) -> Step {
        Step::new(0, name, StepType::Run, 2, target)
    }

    #[tokio::test]
    async fn test_delivery_appends_records_to_history() {
        let queue = InMemoryQueue::new();
        let init = Step::init(json!("payload"));
        let result = Step::new(1, "a", StepType::Run, 1, 1).with_out(json!(1));

        let records = vec![init.clone(), result.clone()];
        let id = queue.publish(message(records, None)).await.unwrap();
        assert_eq!(id, "msg_0");
        assert_eq!(queue.pending(), 1);
        assert!(queue.published_message("msg_0").is_some());

        let delivered = queue.next_delivery().unwrap().unwrap();
        assert_eq!(delivered.header("workflow-id"), Some("wf-mem"));
        assert_eq!(delivered.header("Workflow-Internal"), Some("yes"));
        assert_eq!(decode_ledger(&delivered.body).unwrap(), vec![init, result]);
        assert_eq!(queue.pending(), 0);
        assert!(queue.next_delivery().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeated_init_is_folded_once() {
        let queue = InMemoryQueue::new();
        let init = Step::init(json!(null));

        queue.publish(message(vec![init.clone(), plan("a", 1)], None)).await.unwrap();
        queue.publish(message(vec![init, plan("b", 2)], None)).await.unwrap();

        queue.next_delivery().unwrap();
        queue.next_delivery().unwrap();

        let history = queue.history("wf-mem");
        assert_eq!(history.len(), 3);
        assert_eq!(history.iter().filter(|s| s.role() == StepRole::Init).count(), 1);
    }

    #[tokio::test]
    async fn test_delayed_messages_advance_the_clock() {
        let start = Utc.timestamp_opt(1_000_000, 0).single().unwrap();
        let queue = InMemoryQueue::new().with_clock(start);

        let nap = Step::new(1, "nap", StepType::SleepFor, 1, 1);
        let delay = Some(Delay::For(Duration::from_secs(60)));
        queue.publish(message(vec![Step::init(json!(null)), nap], delay)).await.unwrap();
        queue.publish(message(vec![plan("x", 1)], None)).await.unwrap();

        // Undelayed message first despite later publish
        let first = queue.next_delivery().unwrap().unwrap();
        assert_eq!(decode_ledger(&first.body).unwrap().len(), 1);
        assert_eq!(queue.now(), start);

        queue.next_delivery().unwrap().unwrap();
        assert_eq!(queue.now().timestamp(), 1_000_060);
    }

    #[tokio::test]
    async fn test_call_request_gets_response() {
        let queue =
            InMemoryQueue::new().with_call_responder(|step| json!({"echo": step.step_name}));
        let request = Step::new(1, "hook", StepType::Call, 1, 1);

        queue.publish(message(vec![Step::init(json!(null)), request], None)).await.unwrap();
        let delivered = queue.next_delivery().unwrap().unwrap();

        let records = decode_ledger(&delivered.body).unwrap();
        assert_eq!(records.len(), 3);
        assert!(!records[1].settles());
        assert!(records[2].settles());
        assert_eq!(records[2].out, Some(json!({"echo": "hook"})));
    }

    #[tokio::test]
    async fn test_redeliver_resends_snapshot_without_appending() {
        let queue = InMemoryQueue::new();
        let result = Step::new(1, "a", StepType::Run, 1, 1).with_out(json!(1));
        queue.publish(message(vec![Step::init(json!(null)), result], None)).await.unwrap();
        queue.publish(message(vec![plan("later", 2)], None)).await.unwrap();

        let failed = queue.next_delivery().unwrap().unwrap();
        queue.redeliver(failed.clone());
        assert_eq!(queue.pending(), 2);

        // The retry jumps ahead of the pending message
        let retry = queue.next_delivery().unwrap().unwrap();
        assert_eq!(retry, failed);
        assert_eq!(queue.history("wf-mem").len(), 2);

        let next = queue.next_delivery().unwrap().unwrap();
        assert_eq!(decode_ledger(&next.body).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unroutable_message_is_rejected() {
        let queue = InMemoryQueue::new();

        let mut anonymous = message(vec![Step::init(json!(null))], None);
        anonymous.headers.remove(DEFAULT_WORKFLOW_ID_HEADER);
        let err = queue.publish(anonymous).await.unwrap_err();
        assert!(matches!(err, QueueError::Rejected(_)));

        let mut garbled = message(vec![Step::init(json!(null))], None);
        garbled.body = "not a ledger".to_string();
        let err = queue.publish(garbled).await.unwrap_err();
        assert!(matches!(err, QueueError::Rejected(_)));

        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_queue_rejects_publish() {
        let queue = InMemoryQueue::new();
        queue.set_available(false);

        let request = message(vec![Step::init(json!(null))], None);
        let err = queue.publish(request).await.unwrap_err();
        assert!(matches!(err, QueueError::Unavailable(_)));
        assert!(queue.published().is_empty());
    }
}
