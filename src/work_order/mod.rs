//! Work orders — wire types, the in-enclave handler and its response store
//!
//! - **request**: `WorkOrderRequest` / `WorkOrderResponse` wire forms
//! - **workload**: the `Workload` trait and the registry selecting one
//! - **response_store**: results parked until the requester retrieves them
//! - **signature**: response hashing, signing and verification
//! - **handler**: `WorkOrderHandler`, the only code that crosses into an enclave

pub mod handler;
pub mod request;
pub mod response_store;
pub mod signature;
pub mod workload;

pub use handler::{HandlerConfig, WorkOrderHandler};
pub use request::{WorkOrderRequest, WorkOrderResponse};
pub use response_store::{ResponseRecord, ResponseStore};
pub use signature::{compute_result_hash, verify_response};
pub use workload::{EchoWorkload, Sha256Workload, Workload, WorkloadError, WorkloadRegistry};

/// Errors surfaced by the work-order handler contract
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkOrderError {
    /// The request could not be decoded or names no known workload
    #[error("malformed work order request: {0}")]
    MalformedRequest(String),

    /// The workload ran and reported a logic error
    #[error("workload execution failed: {0}")]
    ExecutionFault(String),

    /// Unrecoverable trusted-side condition; the enclave must be quarantined
    #[error("enclave {index} fault: {reason}")]
    EnclaveFault { index: usize, reason: String },

    /// No response with this identifier, size and enclave index is pending
    #[error("no pending response {identifier} (size {size}) on enclave {index}")]
    NotFound {
        identifier: u32,
        size: usize,
        index: usize,
    },

    #[error("no enclave context with index {0}")]
    InvalidIndex(usize),

    /// The worker measurement has not been registered with the KME yet
    #[error("worker is not registered for dispatch (phase: {0})")]
    NotRegistered(String),
}

/// Serde helper: byte payloads as standard base-64 strings
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text.as_bytes()).map_err(D::Error::custom)
    }
}
