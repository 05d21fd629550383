//! Enclave Dispatch — work-order execution across a pool of enclaves
//!
//! An untrusted Enclave Manager pulls work orders, borrows an idle enclave
//! from the Ready Enclave Pool, runs the order inside the enclave through
//! the Work Order Handler and hands the signed response downstream. Before
//! a Workload-Processing Enclave may serve, it registers its measurement
//! with a Key-Management Enclave over durable slots.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod manager;
pub mod pool;
pub mod storage;
pub mod tee;
pub mod work_order;

pub use bootstrap::{KeyManagementEnclave, RegistrationGate, WorkerBootstrap, WorkerPhase};
pub use config::{DispatchConfig, Role};
pub use error::DispatchError;
pub use manager::{EnclaveManager, MemoryResultSink, MemoryWorkOrderQueue};
pub use pool::{PoolError, ReadyEnclavePool};
pub use work_order::{WorkOrderError, WorkOrderHandler, WorkOrderRequest, WorkOrderResponse};
