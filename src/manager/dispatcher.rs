//! Enclave Manager — the untrusted dispatch loop
//!
//! One cycle takes one work order from the source, borrows one enclave
//! from the pool, runs the order across the trust boundary, retrieves and
//! verifies the response and hands it downstream. An enclave is never held
//! across cycles, and a fetched order always ends delivered, failed or
//! requeued.

use super::retry::RetryPolicy;
use super::source::{FailureReason, ResultSink, WorkOrder, WorkOrderSource};
use crate::bootstrap::WorkerPhase;
use crate::pool::{PoolError, ReadyEnclavePool};
use crate::work_order::{verify_response, WorkOrderError, WorkOrderHandler, WorkOrderResponse};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub retry: RetryPolicy,
    /// Sleep when the source is empty
    pub idle_wait: Duration,
    /// Bounded wait for a free enclave; zero means fail fast
    pub checkout_wait: Duration,
    /// Orders older than this that cannot be served are failed
    pub max_latency: Option<Duration>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            idle_wait: Duration::from_millis(50),
            checkout_wait: Duration::ZERO,
            max_latency: Some(Duration::from_secs(300)),
        }
    }
}

/// What one `run_cycle` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Source was empty
    Idle,
    /// The worker is not registered yet; nothing was fetched
    NotServing,
    Delivered { order_id: String, index: usize },
    /// No idle enclave; the order went back to the source
    PoolExhausted { order_id: String },
    /// An enclave faulted; the order went back for another enclave
    Redispatched { order_id: String, attempts: u32 },
    Failed {
        order_id: String,
        reason: FailureReason,
    },
}

/// Counters of one dispatch loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub cycles: u64,
    pub delivered: u64,
    pub failed: u64,
    pub redispatched: u64,
    pub pool_exhausted: u64,
}

impl DispatchStats {
    fn record(&mut self, outcome: &CycleOutcome) {
        self.cycles += 1;
        match outcome {
            CycleOutcome::Delivered { .. } => self.delivered += 1,
            CycleOutcome::Failed { .. } => self.failed += 1,
            CycleOutcome::Redispatched { .. } => self.redispatched += 1,
            CycleOutcome::PoolExhausted { .. } => self.pool_exhausted += 1,
            CycleOutcome::Idle | CycleOutcome::NotServing => {}
        }
    }

    pub fn merge(&mut self, other: DispatchStats) {
        self.cycles += other.cycles;
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.redispatched += other.redispatched;
        self.pool_exhausted += other.pool_exhausted;
    }
}

#[derive(Clone)]
pub struct EnclaveManager {
    handler: Arc<WorkOrderHandler>,
    pool: Arc<ReadyEnclavePool>,
    source: Arc<dyn WorkOrderSource>,
    sink: Arc<dyn ResultSink>,
    settings: DispatchSettings,
}

impl EnclaveManager {
    /// The pool is sized from the handler so every index has a context
    pub fn new(
        handler: Arc<WorkOrderHandler>,
        source: Arc<dyn WorkOrderSource>,
        sink: Arc<dyn ResultSink>,
        settings: DispatchSettings,
    ) -> Self {
        let pool = Arc::new(ReadyEnclavePool::new(handler.size()));
        Self {
            handler,
            pool,
            source,
            sink,
            settings,
        }
    }

    pub fn pool(&self) -> &ReadyEnclavePool {
        &self.pool
    }

    pub fn handler(&self) -> &WorkOrderHandler {
        &self.handler
    }

    /// Process at most one work order
    pub async fn run_cycle(&self) -> CycleOutcome {
        if !self.handler.gate().is_serving() {
            return CycleOutcome::NotServing;
        }
        let order = match self.source.fetch_next() {
            Some(order) => order,
            None => return CycleOutcome::Idle,
        };

        if let Some(limit) = self.settings.max_latency {
            if order.age() > limit {
                let detail = format!("waited {:?}, limit {:?}", order.age(), limit);
                return self.fail(order, FailureReason::Timeout, &detail);
            }
        }

        let checkout = if self.settings.checkout_wait.is_zero() {
            self.pool.checkout()
        } else {
            self.pool.checkout_wait(self.settings.checkout_wait).await
        };
        let index = match checkout {
            Ok(index) => index,
            Err(e) => {
                if let PoolError::PoolExhausted { live: 0, .. } = e {
                    error!("No live enclaves left; work order {} stays queued", order.id);
                } else {
                    debug!("Work order {} waiting for an enclave: {}", order.id, e);
                }
                let order_id = order.id.clone();
                self.source.requeue(order);
                return CycleOutcome::PoolExhausted { order_id };
            }
        };

        debug!("Dispatching work order {} to enclave {}", order.id, index);
        match self.handler.handle(&order.request, index).await {
            Ok((identifier, size)) => self.collect(order, index, identifier, size).await,
            Err(WorkOrderError::MalformedRequest(detail)) => {
                self.release(index);
                self.fail(order, FailureReason::MalformedRequest, &detail)
            }
            Err(WorkOrderError::ExecutionFault(detail)) => {
                self.release(index);
                self.fail(order, FailureReason::ExecutionFault, &detail)
            }
            Err(WorkOrderError::NotRegistered(phase)) => {
                // Gate closed between the check and the call
                warn!("Worker left serving state ({}); requeueing {}", phase, order.id);
                self.release(index);
                self.source.requeue(order);
                CycleOutcome::NotServing
            }
            Err(e) => self.quarantine(order, index, &e.to_string()),
        }
    }

    async fn collect(
        &self,
        order: WorkOrder,
        index: usize,
        identifier: u32,
        size: usize,
    ) -> CycleOutcome {
        let encoded = match self.handler.get_response(identifier, size, index).await {
            Ok(encoded) => encoded,
            Err(e @ WorkOrderError::EnclaveFault { .. }) => {
                return self.quarantine(order, index, &e.to_string())
            }
            Err(e) => {
                // Never retried: the order already ran once
                self.release(index);
                return self.fail(order, FailureReason::ResponseUnavailable, &e.to_string());
            }
        };

        if let Err(reason) = self.verify(&encoded, index) {
            return self.quarantine(order, index, &reason);
        }

        self.release(index);
        self.sink.deliver(&order.id, &encoded);
        self.source.acknowledge(&order.id);
        debug!("Delivered work order {} from enclave {}", order.id, index);
        CycleOutcome::Delivered {
            order_id: order.id,
            index,
        }
    }

    /// A response that does not verify against its enclave's key is an
    /// integrity failure of that enclave
    fn verify(&self, encoded: &str, index: usize) -> Result<(), String> {
        let response = WorkOrderResponse::decode(encoded).map_err(|e| e.to_string())?;
        if response.enclave_index != index {
            return Err(format!(
                "response claims enclave {} but came from {}",
                response.enclave_index, index
            ));
        }
        let key = self
            .handler
            .verifying_key(index)
            .ok_or_else(|| format!("no verifying key for enclave {}", index))?;
        verify_response(&response, &key).map_err(|e| format!("response rejected: {}", e))
    }

    fn release(&self, index: usize) {
        if let Err(e) = self.pool.checkin(index) {
            warn!("Check-in of enclave {} failed: {}", index, e);
        }
    }

    fn quarantine(&self, mut order: WorkOrder, index: usize, reason: &str) -> CycleOutcome {
        error!("Enclave {} quarantined: {}", index, reason);
        if let Err(e) = self.pool.mark_unavailable(index) {
            warn!("Could not quarantine enclave {}: {}", index, e);
        }

        order.attempts += 1;
        if !self.settings.retry.allows(order.attempts) {
            let detail = format!("{} enclave faults, last: {}", order.attempts, reason);
            return self.fail(order, FailureReason::RetriesExhausted, &detail);
        }
        info!(
            "Redispatching work order {} (attempt {})",
            order.id,
            order.attempts + 1
        );
        let order_id = order.id.clone();
        let attempts = order.attempts;
        self.source.requeue(order);
        CycleOutcome::Redispatched { order_id, attempts }
    }

    fn fail(&self, order: WorkOrder, reason: FailureReason, detail: &str) -> CycleOutcome {
        warn!("Work order {} failed [{}]: {}", order.id, reason, detail);
        self.sink.fail(&order.id, reason, detail);
        self.source.acknowledge(&order.id);
        CycleOutcome::Failed {
            order_id: order.id,
            reason,
        }
    }

    /// Run cycles until `shutdown` flips to true. A cycle in progress is
    /// always finished first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> DispatchStats {
        let mut stats = DispatchStats::default();
        let mut exhausted_streak: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let outcome = self.run_cycle().await;
            stats.record(&outcome);

            let pause = match &outcome {
                CycleOutcome::Delivered { .. } | CycleOutcome::Failed { .. } => {
                    exhausted_streak = 0;
                    Duration::ZERO
                }
                CycleOutcome::Idle => {
                    exhausted_streak = 0;
                    let evicted = self.handler.evict_expired_responses();
                    if evicted > 0 {
                        debug!("Evicted {} unretrieved responses", evicted);
                    }
                    self.settings.idle_wait
                }
                CycleOutcome::NotServing => {
                    let phase = self
                        .handler
                        .gate()
                        .wait_serving(self.settings.idle_wait)
                        .await;
                    if phase == WorkerPhase::Rejected {
                        error!("Worker was rejected by the KME; dispatch loop stopping");
                        break;
                    }
                    Duration::ZERO
                }
                CycleOutcome::PoolExhausted { .. } => {
                    exhausted_streak = exhausted_streak.saturating_add(1);
                    self.settings.retry.delay(exhausted_streak)
                }
                CycleOutcome::Redispatched { attempts, .. } => self.settings.retry.delay(*attempts),
            };

            if !pause.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    changed = shutdown.changed() => {
                        // Sender gone: nobody can ask us to stop any more
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        debug!("Dispatch loop stopped after {} cycles", stats.cycles);
        stats
    }

    /// Run `count` dispatch loops over the same pool
    pub fn spawn_workers(
        &self,
        count: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<DispatchStats>> {
        info!(
            "Starting {} dispatch workers over {} enclaves",
            count,
            self.pool.capacity()
        );
        (0..count)
            .map(|_| {
                let manager = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { manager.run(shutdown).await })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::RegistrationGate;
    use crate::manager::source::{DeliveryOutcome, MemoryResultSink, MemoryWorkOrderQueue};
    use crate::pool::SlotState;
    use crate::work_order::{
        HandlerConfig, Workload, WorkloadError, WorkloadRegistry, WorkOrderRequest,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Slow;

    impl Workload for Slow {
        fn id(&self) -> &str {
            "slow"
        }
        fn process(&self, input: &[u8]) -> Result<Vec<u8>, WorkloadError> {
            std::thread::sleep(Duration::from_millis(100));
            Ok(input.to_vec())
        }
    }

    /// Integrity fault on the first call only
    #[derive(Default)]
    struct FaultOnce {
        tripped: AtomicBool,
    }

    impl Workload for FaultOnce {
        fn id(&self) -> &str {
            "fault-once"
        }
        fn process(&self, input: &[u8]) -> Result<Vec<u8>, WorkloadError> {
            if self.tripped.swap(true, Ordering::SeqCst) {
                Ok(input.to_vec())
            } else {
                Err(WorkloadError::Integrity("measurement drift".into()))
            }
        }
    }

    struct AlwaysFault;

    impl Workload for AlwaysFault {
        fn id(&self) -> &str {
            "always-fault"
        }
        fn process(&self, _input: &[u8]) -> Result<Vec<u8>, WorkloadError> {
            Err(WorkloadError::Integrity("tampered".into()))
        }
    }

    struct Fixture {
        manager: EnclaveManager,
        queue: Arc<MemoryWorkOrderQueue>,
        sink: Arc<MemoryResultSink>,
    }

    fn fixture_with(pool_size: usize, gate: RegistrationGate, settings: DispatchSettings) -> Fixture {
        let config = HandlerConfig {
            pool_size,
            ..Default::default()
        };
        fixture_from(&config, gate, settings)
    }

    fn fixture_from(
        config: &HandlerConfig,
        gate: RegistrationGate,
        settings: DispatchSettings,
    ) -> Fixture {
        let mut workloads = WorkloadRegistry::with_builtins();
        workloads.register(Arc::new(Slow));
        workloads.register(Arc::new(FaultOnce::default()));
        workloads.register(Arc::new(AlwaysFault));
        let handler = Arc::new(WorkOrderHandler::new(config, workloads, gate).unwrap());
        let queue = Arc::new(MemoryWorkOrderQueue::new());
        let sink = Arc::new(MemoryResultSink::new());
        let manager = EnclaveManager::new(handler, queue.clone(), sink.clone(), settings);
        Fixture {
            manager,
            queue,
            sink,
        }
    }

    fn fixture(pool_size: usize) -> Fixture {
        fixture_with(pool_size, RegistrationGate::open(), DispatchSettings::default())
    }

    fn submit(queue: &MemoryWorkOrderQueue, id: &str, workload: &str, data: &[u8]) {
        queue.submit_request(&WorkOrderRequest::new(id, workload, data.to_vec()));
    }

    #[tokio::test]
    async fn test_delivers_verified_response() {
        let f = fixture(2);
        submit(&f.queue, "wo-1", "echo", b"hello");

        let outcome = f.manager.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Delivered { ref order_id, .. } if order_id == "wo-1"));
        match f.sink.outcome("wo-1") {
            Some(DeliveryOutcome::Delivered(encoded)) => {
                let response = WorkOrderResponse::decode(&encoded).unwrap();
                assert_eq!(response.out_data, b"RESULT: hello");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(f.manager.pool().idle_count(), 2);
        assert!(f.queue.is_drained());
        assert_eq!(f.manager.run_cycle().await, CycleOutcome::Idle);
    }

    #[tokio::test]
    async fn test_single_enclave_contention_requeues() {
        let f = fixture(1);
        submit(&f.queue, "wo-a", "slow", b"a");
        submit(&f.queue, "wo-b", "slow", b"b");

        let (first, second) = tokio::join!(f.manager.run_cycle(), async {
            // Let the first cycle check out the only enclave
            tokio::time::sleep(Duration::from_millis(20)).await;
            f.manager.run_cycle().await
        });
        assert!(matches!(first, CycleOutcome::Delivered { .. }));
        assert_eq!(
            second,
            CycleOutcome::PoolExhausted {
                order_id: "wo-b".into()
            }
        );
        // The exhausted order was not lost
        assert_eq!(f.queue.pending(), 1);
        assert!(matches!(
            f.manager.run_cycle().await,
            CycleOutcome::Delivered { ref order_id, .. } if order_id == "wo-b"
        ));
        assert_eq!(f.sink.len(), 2);
    }

    #[tokio::test]
    async fn test_enclave_fault_quarantines_and_redispatches() {
        let f = fixture(2);
        submit(&f.queue, "wo-1", "fault-once", b"x");

        let outcome = f.manager.run_cycle().await;
        assert_eq!(
            outcome,
            CycleOutcome::Redispatched {
                order_id: "wo-1".into(),
                attempts: 1
            }
        );
        assert_eq!(f.manager.pool().state(0), Some(SlotState::Unavailable));

        let outcome = f.manager.run_cycle().await;
        assert_eq!(
            outcome,
            CycleOutcome::Delivered {
                order_id: "wo-1".into(),
                index: 1
            }
        );
        assert_eq!(f.manager.pool().live_count(), 1);
        // Index 0 is never handed out again
        for _ in 0..3 {
            submit(&f.queue, "wo-n", "echo", b"n");
            assert!(matches!(
                f.manager.run_cycle().await,
                CycleOutcome::Delivered { index: 1, .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_execution_fault_keeps_enclave() {
        let f = fixture(1);
        submit(&f.queue, "wo-1", "sha256", b"");
        assert_eq!(
            f.manager.run_cycle().await,
            CycleOutcome::Failed {
                order_id: "wo-1".into(),
                reason: FailureReason::ExecutionFault
            }
        );
        assert_eq!(f.manager.pool().state(0), Some(SlotState::Idle));

        f.queue.submit(crate::manager::WorkOrder::new("wo-2", b"garbage".to_vec()));
        assert_eq!(
            f.manager.run_cycle().await,
            CycleOutcome::Failed {
                order_id: "wo-2".into(),
                reason: FailureReason::MalformedRequest
            }
        );
        assert_eq!(f.manager.pool().state(0), Some(SlotState::Idle));
        assert!(f.queue.is_drained());
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_permanent() {
        let settings = DispatchSettings {
            retry: RetryPolicy {
                max_retries: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let f = fixture_with(3, RegistrationGate::open(), settings);
        submit(&f.queue, "wo-1", "always-fault", b"x");

        assert!(matches!(
            f.manager.run_cycle().await,
            CycleOutcome::Redispatched { attempts: 1, .. }
        ));
        assert_eq!(
            f.manager.run_cycle().await,
            CycleOutcome::Failed {
                order_id: "wo-1".into(),
                reason: FailureReason::RetriesExhausted
            }
        );
        assert_eq!(f.manager.pool().live_count(), 1);
        assert!(f.queue.is_drained());
    }

    #[tokio::test]
    async fn test_no_dispatch_before_registration() {
        let (tx, rx) = watch::channel(WorkerPhase::MeasurementPublished);
        let f = fixture_with(1, RegistrationGate::new(rx), DispatchSettings::default());
        submit(&f.queue, "wo-1", "echo", b"x");

        assert_eq!(f.manager.run_cycle().await, CycleOutcome::NotServing);
        assert_eq!(f.queue.pending(), 1);
        assert!(f.sink.is_empty());

        tx.send_replace(WorkerPhase::Registered);
        assert_eq!(f.manager.run_cycle().await, CycleOutcome::NotServing);
        tx.send_replace(WorkerPhase::Serving);
        assert!(matches!(
            f.manager.run_cycle().await,
            CycleOutcome::Delivered { .. }
        ));
    }

    #[tokio::test]
    async fn test_stale_order_times_out() {
        let settings = DispatchSettings {
            max_latency: Some(Duration::from_millis(10)),
            ..Default::default()
        };
        let f = fixture_with(1, RegistrationGate::open(), settings);
        submit(&f.queue, "wo-1", "echo", b"x");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            f.manager.run_cycle().await,
            CycleOutcome::Failed {
                order_id: "wo-1".into(),
                reason: FailureReason::Timeout
            }
        );
    }

    #[tokio::test]
    async fn test_workers_drain_queue_and_stop() {
        let settings = DispatchSettings {
            idle_wait: Duration::from_millis(5),
            ..Default::default()
        };
        let f = fixture_with(2, RegistrationGate::open(), settings);
        for n in 0..20 {
            submit(&f.queue, &format!("wo-{}", n), "echo", b"x");
        }

        let (stop, shutdown) = watch::channel(false);
        let workers = f.manager.spawn_workers(4, shutdown);
        assert!(f.sink.wait_for(20, Duration::from_secs(10)).await);
        stop.send_replace(true);

        let mut total = DispatchStats::default();
        for worker in workers {
            total.merge(worker.await.unwrap());
        }
        assert_eq!(total.delivered, 20);
        assert!(f.queue.is_drained());
        assert_eq!(f.manager.pool().idle_count(), 2);
    }

    #[tokio::test]
    async fn test_tight_response_cap_loses_nothing() {
        let config = HandlerConfig {
            pool_size: 4,
            max_pending_responses: 1,
            ..Default::default()
        };
        let settings = DispatchSettings {
            idle_wait: Duration::from_millis(5),
            ..Default::default()
        };
        let f = fixture_from(&config, RegistrationGate::open(), settings);
        for n in 0..200 {
            submit(&f.queue, &format!("wo-{}", n), "echo", b"x");
        }

        let (stop, shutdown) = watch::channel(false);
        let workers = f.manager.spawn_workers(4, shutdown);
        assert!(f.sink.wait_for(200, Duration::from_secs(20)).await);
        stop.send_replace(true);

        let mut total = DispatchStats::default();
        for worker in workers {
            total.merge(worker.await.unwrap());
        }
        assert_eq!(total.delivered, 200);
        assert_eq!(total.failed, 0);
        assert_eq!(f.manager.pool().live_count(), 4);
    }

    #[tokio::test]
    async fn test_loop_stops_when_rejected() {
        let (tx, rx) = watch::channel(WorkerPhase::MeasurementPublished);
        let settings = DispatchSettings {
            idle_wait: Duration::from_millis(5),
            ..Default::default()
        };
        let f = fixture_with(1, RegistrationGate::new(rx), settings);
        let (_stop, shutdown) = watch::channel(false);
        let manager = f.manager.clone();
        let worker = tokio::spawn(async move { manager.run(shutdown).await });
        tx.send_replace(WorkerPhase::Rejected);
        let stats = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.delivered, 0);
    }
}
