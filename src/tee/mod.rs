//! TEE (Trusted Execution Environment) — enclave identity and attestation
//!
//! - **Enclave**: TEE abstraction (Intel SGX / ARM TrustZone / Simulated),
//!   build measurement and per-slot response signing keys
//! - **Attestation**: quotes and the policy the Key-Management Enclave
//!   applies before trusting a worker measurement

pub mod attestation;
pub mod enclave;

pub use attestation::{
    generate_quote, verify_quote, AttestationPolicy, AttestationQuote, AttestationVerdict,
};
pub use enclave::{
    parse_mrenclave, EnclaveMeasurement, EnclaveStatus, SecurityLevel, TeeBackend, TeeEnclave,
    TeeError,
};
