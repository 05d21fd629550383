//! Key-Management Enclave — binds and vouches for the worker measurement
//!
//! The KME starts unbound. It becomes bound either immediately, from an
//! operator-supplied MRENCLAVE override, or by consuming the measurement a
//! worker published. The measurement slot is consumed at most once per
//! process; re-reading an unchanged value is a no-op. A restarted KME that
//! finds its own earlier acknowledgement for the same value adopts it, as
//! long as the current operator override still agrees with that decision.
//! Otherwise it decides afresh and rewrites the acknowledgement.

use super::rendezvous::{read_slot, watch_until};
use super::{BootstrapError, MeasurementRecord, RegistrationAck};
use crate::storage::DurableSlot;
use crate::tee::enclave::hex32;
use crate::tee::{verify_quote, AttestationPolicy, AttestationQuote};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Where the KME's trusted identity came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingSource {
    /// Read from the shared measurement slot
    Discovered,
    /// Supplied by the operator at startup; always wins
    Override,
}

/// The worker identity the KME trusts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedWorker {
    #[serde(with = "hex32")]
    pub mrenclave: [u8; 32],
    pub source: BindingSource,
    /// Worker key digest from the accepted quote; `None` until a worker
    /// has registered
    pub report_data: Option<[u8; 32]>,
    pub bound_at: DateTime<Utc>,
}

/// Result of one look at the measurement slot
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Nothing published yet
    Pending,
    /// A measurement was consumed and accepted
    Registered(TrustedWorker),
    /// The measurement was consumed and refused
    Rejected(String),
    /// Same value as already consumed
    AlreadyConsumed,
    /// A different value appeared after consumption; one per deployment
    Ignored,
}

pub struct KeyManagementEnclave {
    kme_id: String,
    policy: AttestationPolicy,
    override_mrenclave: Option<[u8; 32]>,
    trusted: Option<TrustedWorker>,
    /// Quote signature of the consumed record
    consumed: Option<String>,
    measurement_slot: Arc<dyn DurableSlot>,
    ack_slot: Arc<dyn DurableSlot>,
}

impl KeyManagementEnclave {
    pub fn new(
        kme_id: impl Into<String>,
        policy: AttestationPolicy,
        override_mrenclave: Option<[u8; 32]>,
        measurement_slot: Arc<dyn DurableSlot>,
        ack_slot: Arc<dyn DurableSlot>,
    ) -> Self {
        let trusted = override_mrenclave.map(|mrenclave| {
            info!(
                "KME bound to operator-supplied measurement {}",
                hex::encode(mrenclave)
            );
            TrustedWorker {
                mrenclave,
                source: BindingSource::Override,
                report_data: None,
                bound_at: Utc::now(),
            }
        });
        Self {
            kme_id: kme_id.into(),
            policy,
            override_mrenclave,
            trusted,
            consumed: None,
            measurement_slot,
            ack_slot,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.trusted.is_some()
    }

    pub fn trusted_worker(&self) -> Option<&TrustedWorker> {
        self.trusted.as_ref()
    }

    /// Accept a request only from the bound worker measurement.
    ///
    /// This is the KME-side check a key service runs on every worker
    /// request before releasing key material.
    pub fn authorize(&self, mrenclave: &[u8; 32]) -> Result<(), BootstrapError> {
        match &self.trusted {
            Some(worker) if &worker.mrenclave == mrenclave => Ok(()),
            _ => Err(BootstrapError::NotRegistered(hex::encode(mrenclave))),
        }
    }

    /// Look at the measurement slot once
    pub fn poll_once(&mut self) -> Result<PollOutcome, BootstrapError> {
        match read_slot::<MeasurementRecord>(self.measurement_slot.as_ref())? {
            Some(record) => self.consume(record),
            None => Ok(PollOutcome::Pending),
        }
    }

    /// Wait for a published measurement and consume it.
    ///
    /// Returns the trusted worker, or `AttestationFailure` if the
    /// measurement was refused.
    pub async fn run(
        &mut self,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<TrustedWorker, BootstrapError> {
        info!(
            "KME {} waiting for a worker measurement on {}",
            self.kme_id,
            self.measurement_slot.describe()
        );
        let record: MeasurementRecord = watch_until(
            self.measurement_slot.as_ref(),
            poll_interval,
            timeout,
            |_: &MeasurementRecord| true,
        )
        .await?;

        match self.consume(record)? {
            PollOutcome::Rejected(reason) => Err(BootstrapError::AttestationFailure(reason)),
            _ => self
                .trusted
                .clone()
                .ok_or_else(|| BootstrapError::NotRegistered("no worker bound".into())),
        }
    }

    fn consume(&mut self, record: MeasurementRecord) -> Result<PollOutcome, BootstrapError> {
        let fingerprint = record.quote.signature.clone();
        match &self.consumed {
            Some(seen) if *seen == fingerprint => return Ok(PollOutcome::AlreadyConsumed),
            Some(_) => {
                warn!(
                    "Ignoring new measurement {} on {}: slot already consumed",
                    record.quote.measurement.mrenclave_hex(),
                    self.measurement_slot.describe()
                );
                return Ok(PollOutcome::Ignored);
            }
            None => {}
        }
        self.consumed = Some(fingerprint);

        if let Some(previous) = self.previous_ack(&record.quote)? {
            // An accepted quote may since have aged past the policy window;
            // only a conflicting override overturns it
            let still_holds = if previous.accepted {
                self.override_conflict(&record.quote).is_none()
            } else {
                self.check(&record.quote).is_some()
            };
            if still_holds {
                info!(
                    "KME {} found its earlier decision for {} (accepted={})",
                    self.kme_id,
                    record.quote.measurement.mrenclave_hex(),
                    previous.accepted
                );
                let reason = if previous.accepted {
                    None
                } else {
                    Some(
                        previous
                            .reason
                            .unwrap_or_else(|| "measurement refused".to_string()),
                    )
                };
                return Ok(self.apply_decision(&record.quote, reason));
            }
            warn!(
                "KME {} earlier decision for {} no longer holds; deciding again",
                self.kme_id,
                record.quote.measurement.mrenclave_hex()
            );
        }

        let reason = match self.override_conflict(&record.quote) {
            Some(conflict) => Some(conflict),
            None => self.check(&record.quote),
        };
        let ack = RegistrationAck {
            mrenclave: record.quote.measurement.mrenclave,
            nonce: record.quote.nonce.clone(),
            accepted: reason.is_none(),
            reason: reason.clone(),
            kme_id: self.kme_id.clone(),
            acknowledged_at: Utc::now(),
        };
        self.ack_slot.write(&serde_json::to_vec(&ack)?)?;
        Ok(self.apply_decision(&record.quote, reason))
    }

    /// Our own ack for exactly this quote, if a previous run wrote one
    fn previous_ack(
        &self,
        quote: &AttestationQuote,
    ) -> Result<Option<RegistrationAck>, BootstrapError> {
        let ack = match read_slot::<RegistrationAck>(self.ack_slot.as_ref()) {
            Ok(ack) => ack,
            Err(e) => {
                warn!("Discarding unreadable ack slot: {}", e);
                None
            }
        };
        Ok(ack.filter(|a| a.answers(quote) && a.kme_id == self.kme_id))
    }

    /// Reason to refuse `quote`, or `None` to accept it
    fn check(&self, quote: &AttestationQuote) -> Option<String> {
        let verdict = verify_quote(quote, &self.policy);
        if !verdict.is_trusted() {
            return Some(verdict.reason());
        }
        self.override_conflict(quote)
    }

    /// Set when an operator override names a different measurement
    fn override_conflict(&self, quote: &AttestationQuote) -> Option<String> {
        match self.override_mrenclave {
            Some(expected) if expected != quote.measurement.mrenclave => Some(format!(
                "measurement {} does not match operator override {}",
                quote.measurement.mrenclave_hex(),
                hex::encode(expected)
            )),
            _ => None,
        }
    }

    fn apply_decision(&mut self, quote: &AttestationQuote, reason: Option<String>) -> PollOutcome {
        if let Some(reason) = reason {
            error!(
                "KME {} rejected worker measurement {}: {}",
                self.kme_id,
                quote.measurement.mrenclave_hex(),
                reason
            );
            return PollOutcome::Rejected(reason);
        }

        let worker = match self.trusted.take() {
            Some(mut bound) => {
                bound.report_data = Some(quote.report_data);
                bound
            }
            None => TrustedWorker {
                mrenclave: quote.measurement.mrenclave,
                source: BindingSource::Discovered,
                report_data: Some(quote.report_data),
                bound_at: Utc::now(),
            },
        };
        info!(
            "KME {} registered worker {} ({:?})",
            self.kme_id,
            quote.measurement.mrenclave_hex(),
            worker.source
        );
        self.trusted = Some(worker.clone());
        PollOutcome::Registered(worker)
    }
}
