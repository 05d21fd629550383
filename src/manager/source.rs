//! Upstream and downstream edges of the dispatch loop
//!
//! Transport to the outside world is not this crate's business: the
//! dispatcher pulls from a `WorkOrderSource` and pushes outcomes to a
//! `ResultSink`. In-memory implementations back the tests, the demo and
//! the line-delimited file mode of the binary.

use crate::work_order::WorkOrderRequest;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// A pending unit of work as the dispatcher sees it
#[derive(Debug, Clone)]
pub struct WorkOrder {
    pub id: String,
    /// Serialized `WorkOrderRequest`, passed to the enclave untouched
    pub request: Vec<u8>,
    pub submitted_at: Instant,
    /// Dispatches that ended in an enclave fault
    pub attempts: u32,
}

impl WorkOrder {
    pub fn new(id: impl Into<String>, request: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            request,
            submitted_at: Instant::now(),
            attempts: 0,
        }
    }

    pub fn age(&self) -> Duration {
        self.submitted_at.elapsed()
    }
}

/// Why an order will never be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    MalformedRequest,
    ExecutionFault,
    /// Enclave faults on every allowed attempt
    RetriesExhausted,
    /// Older than the configured maximum latency
    Timeout,
    /// The produced response could not be retrieved
    ResponseUnavailable,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::MalformedRequest => "MALFORMED_REQUEST",
            FailureReason::ExecutionFault => "EXECUTION_FAULT",
            FailureReason::RetriesExhausted => "RETRIES_EXHAUSTED",
            FailureReason::Timeout => "TIMEOUT",
            FailureReason::ResponseUnavailable => "RESPONSE_UNAVAILABLE",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

pub trait WorkOrderSource: Send + Sync {
    /// Next pending order, or `None` when nothing is waiting
    fn fetch_next(&self) -> Option<WorkOrder>;
    /// Put an order back; it will be fetched again
    fn requeue(&self, order: WorkOrder);
    /// The order reached a final outcome
    fn acknowledge(&self, order_id: &str);
}

pub trait ResultSink: Send + Sync {
    fn deliver(&self, order_id: &str, encoded_response: &str);
    fn fail(&self, order_id: &str, reason: FailureReason, detail: &str);
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<WorkOrder>,
    in_flight: HashSet<String>,
}

/// FIFO queue; requeued orders go to the front
#[derive(Default)]
pub struct MemoryWorkOrderQueue {
    state: Mutex<QueueState>,
}

impl MemoryWorkOrderQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn submit(&self, order: WorkOrder) {
        debug!("Queued work order {}", order.id);
        self.state().pending.push_back(order);
    }

    /// Queue a request under its own work order id
    pub fn submit_request(&self, request: &WorkOrderRequest) {
        self.submit(WorkOrder::new(
            request.work_order_id.clone(),
            request.to_bytes(),
        ));
    }

    pub fn pending(&self) -> usize {
        self.state().pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }

    /// Nothing pending and nothing in flight
    pub fn is_drained(&self) -> bool {
        let state = self.state();
        state.pending.is_empty() && state.in_flight.is_empty()
    }
}

impl WorkOrderSource for MemoryWorkOrderQueue {
    fn fetch_next(&self) -> Option<WorkOrder> {
        let mut state = self.state();
        let order = state.pending.pop_front()?;
        state.in_flight.insert(order.id.clone());
        Some(order)
    }

    fn requeue(&self, order: WorkOrder) {
        let mut state = self.state();
        state.in_flight.remove(&order.id);
        state.pending.push_front(order);
    }

    fn acknowledge(&self, order_id: &str) {
        self.state().in_flight.remove(order_id);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(String),
    Failed {
        reason: FailureReason,
        detail: String,
    },
}

/// Records every outcome in arrival order
#[derive(Default)]
pub struct MemoryResultSink {
    outcomes: Mutex<Vec<(String, DeliveryOutcome)>>,
    changed: Notify,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, order_id: &str, outcome: DeliveryOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((order_id.to_string(), outcome));
        self.changed.notify_waiters();
    }

    pub fn outcomes(&self) -> Vec<(String, DeliveryOutcome)> {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.outcomes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn outcome(&self, order_id: &str) -> Option<DeliveryOutcome> {
        self.outcomes()
            .into_iter()
            .find(|(id, _)| id == order_id)
            .map(|(_, outcome)| outcome)
    }

    /// Wait until at least `count` outcomes are recorded
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            if self.len() >= count {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.len() >= count;
            }
        }
    }
}

impl ResultSink for MemoryResultSink {
    fn deliver(&self, order_id: &str, encoded_response: &str) {
        self.record(
            order_id,
            DeliveryOutcome::Delivered(encoded_response.to_string()),
        );
    }

    fn fail(&self, order_id: &str, reason: FailureReason, detail: &str) {
        self.record(
            order_id,
            DeliveryOutcome::Failed {
                reason,
                detail: detail.to_string(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_fifo_with_requeue_to_front() {
        let queue = MemoryWorkOrderQueue::new();
        queue.submit(WorkOrder::new("a", vec![]));
        queue.submit(WorkOrder::new("b", vec![]));

        let a = queue.fetch_next().unwrap();
        assert_eq!(a.id, "a");
        assert_eq!(queue.in_flight(), 1);
        queue.requeue(a);
        assert_eq!(queue.in_flight(), 0);

        assert_eq!(queue.fetch_next().unwrap().id, "a");
        assert_eq!(queue.fetch_next().unwrap().id, "b");
        assert!(queue.fetch_next().is_none());

        queue.acknowledge("a");
        queue.acknowledge("b");
        assert!(queue.is_drained());
    }

    #[test]
    fn test_failure_codes() {
        assert_eq!(FailureReason::Timeout.to_string(), "TIMEOUT");
        assert_eq!(
            FailureReason::RetriesExhausted.code(),
            "RETRIES_EXHAUSTED"
        );
    }

    #[tokio::test]
    async fn test_sink_wait_for() {
        let sink = std::sync::Arc::new(MemoryResultSink::new());
        assert!(!sink.wait_for(1, Duration::from_millis(10)).await);

        let writer = sink.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.deliver("a", "x");
            writer.fail("b", FailureReason::ExecutionFault, "boom");
        });
        assert!(sink.wait_for(2, Duration::from_secs(5)).await);
        assert_eq!(
            sink.outcome("a"),
            Some(DeliveryOutcome::Delivered("x".into()))
        );
        assert!(matches!(
            sink.outcome("b"),
            Some(DeliveryOutcome::Failed {
                reason: FailureReason::ExecutionFault,
                ..
            })
        ));
    }
}
