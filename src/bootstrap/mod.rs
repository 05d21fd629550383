//! KME/WPE bootstrap — establishing trust before any dispatch
//!
//! Protocol over two durable slots:
//! 1. The Workload-Processing Enclave publishes a `MeasurementRecord`
//!    (its attestation quote) to the measurement slot
//! 2. The Key-Management Enclave polls that slot, verifies the quote once,
//!    binds the worker identity and writes a `RegistrationAck`
//! 3. The WPE waits for an ack matching its measurement and nonce, and
//!    only then opens its `RegistrationGate` for dispatch

pub mod gate;
pub mod kme;
pub mod rendezvous;
pub mod wpe;

pub use gate::{RegistrationGate, WorkerPhase};
pub use kme::{BindingSource, KeyManagementEnclave, PollOutcome, TrustedWorker};
pub use rendezvous::{read_slot, watch_until};
pub use wpe::WorkerBootstrap;

use crate::storage::SlotError;
use crate::tee::enclave::hex32;
use crate::tee::AttestationQuote;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Slot name of the published worker measurement
pub const MEASUREMENT_SLOT: &str = "wpe-measurement";
/// Slot name of the KME's registration acknowledgement
pub const ACK_SLOT: &str = "kme-ack";

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Slot(#[from] SlotError),

    #[error("slot record encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out after {waited:?} waiting on slot {slot}")]
    Timeout { slot: String, waited: Duration },

    /// The KME refused the worker measurement; the worker must never serve
    #[error("attestation failure: {0}")]
    AttestationFailure(String),

    #[error("illegal worker transition {from} -> {to}")]
    InvalidTransition { from: WorkerPhase, to: WorkerPhase },

    #[error("measurement {0} is not registered with the key-management enclave")]
    NotRegistered(String),
}

/// What a worker publishes for the KME to consume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub quote: AttestationQuote,
    pub published_at: DateTime<Utc>,
}

/// The KME's answer to one published measurement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationAck {
    #[serde(with = "hex32")]
    pub mrenclave: [u8; 32],
    /// Echo of the quote nonce, so a worker never trusts a stale ack
    pub nonce: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub kme_id: String,
    pub acknowledged_at: DateTime<Utc>,
}

impl RegistrationAck {
    /// Whether this ack answers `quote`
    pub fn answers(&self, quote: &AttestationQuote) -> bool {
        self.mrenclave == quote.measurement.mrenclave && self.nonce == quote.nonce
    }
}
