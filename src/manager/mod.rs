//! Enclave Manager — untrusted orchestration around the enclave pool
//!
//! - **dispatcher**: the per-cycle dispatch loop and parallel workers
//! - **source**: `WorkOrderSource` / `ResultSink` edges and in-memory versions
//! - **retry**: redispatch budget and jittered exponential backoff

pub mod dispatcher;
pub mod retry;
pub mod source;

pub use dispatcher::{CycleOutcome, DispatchSettings, DispatchStats, EnclaveManager};
pub use retry::RetryPolicy;
pub use source::{
    DeliveryOutcome, FailureReason, MemoryResultSink, MemoryWorkOrderQueue, ResultSink, WorkOrder,
    WorkOrderSource,
};
