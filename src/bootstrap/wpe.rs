//! Workload-Processing Enclave bootstrap
//!
//! Drives a worker through Starting → MeasurementPublished → Registered →
//! Serving. The `RegistrationGate` handed out by `WorkerBootstrap::new`
//! reflects every transition, so the dispatcher never sends work to a
//! worker the KME has not acknowledged.

use super::rendezvous::watch_until;
use super::{BootstrapError, MeasurementRecord, RegistrationAck, RegistrationGate, WorkerPhase};
use crate::storage::DurableSlot;
use crate::tee::AttestationQuote;
use chrono::Utc;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub struct WorkerBootstrap {
    phase: watch::Sender<WorkerPhase>,
    measurement_slot: Arc<dyn DurableSlot>,
    ack_slot: Arc<dyn DurableSlot>,
    expected_kme: Option<String>,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl WorkerBootstrap {
    pub fn new(
        measurement_slot: Arc<dyn DurableSlot>,
        ack_slot: Arc<dyn DurableSlot>,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> (Self, RegistrationGate) {
        let (tx, rx) = watch::channel(WorkerPhase::Starting);
        let bootstrap = Self {
            phase: tx,
            measurement_slot,
            ack_slot,
            expected_kme: None,
            poll_interval,
            timeout,
        };
        (bootstrap, RegistrationGate::new(rx))
    }

    /// Only accept acknowledgements written by this KME
    pub fn with_expected_kme(mut self, kme_id: impl Into<String>) -> Self {
        self.expected_kme = Some(kme_id.into());
        self
    }

    pub fn phase(&self) -> WorkerPhase {
        *self.phase.borrow()
    }

    /// Another handle on the same phase
    pub fn gate(&self) -> RegistrationGate {
        RegistrationGate::new(self.phase.subscribe())
    }

    fn advance(&self, next: WorkerPhase) -> Result<(), BootstrapError> {
        let from = self.phase();
        if !from.can_advance_to(next) {
            return Err(BootstrapError::InvalidTransition { from, to: next });
        }
        self.phase.send_replace(next);
        info!("Worker phase {} -> {}", from, next);
        Ok(())
    }

    /// Write our measurement for the KME
    pub fn publish(&self, quote: &AttestationQuote) -> Result<(), BootstrapError> {
        let from = self.phase();
        if !from.can_advance_to(WorkerPhase::MeasurementPublished) {
            return Err(BootstrapError::InvalidTransition {
                from,
                to: WorkerPhase::MeasurementPublished,
            });
        }
        let record = MeasurementRecord {
            quote: quote.clone(),
            published_at: Utc::now(),
        };
        self.measurement_slot.write(&serde_json::to_vec(&record)?)?;
        info!(
            "Published measurement {} to {}",
            quote.measurement.mrenclave_hex(),
            self.measurement_slot.describe()
        );
        self.advance(WorkerPhase::MeasurementPublished)
    }

    /// Wait for the KME's answer to `quote`.
    ///
    /// On timeout the worker stays in MeasurementPublished and keeps its
    /// gate closed. A refusal is terminal.
    pub async fn await_registration(
        &self,
        quote: &AttestationQuote,
    ) -> Result<RegistrationAck, BootstrapError> {
        let from = self.phase();
        if from != WorkerPhase::MeasurementPublished {
            return Err(BootstrapError::InvalidTransition {
                from,
                to: WorkerPhase::Registered,
            });
        }

        let expected_kme = self.expected_kme.clone();
        let ack: RegistrationAck = watch_until(
            self.ack_slot.as_ref(),
            self.poll_interval,
            self.timeout,
            |ack: &RegistrationAck| {
                ack.answers(quote)
                    && expected_kme.as_deref().map_or(true, |id| id == ack.kme_id)
            },
        )
        .await?;

        if !ack.accepted {
            let reason = ack
                .reason
                .clone()
                .unwrap_or_else(|| "measurement refused".to_string());
            error!("KME {} refused this worker: {}", ack.kme_id, reason);
            self.advance(WorkerPhase::Rejected)?;
            return Err(BootstrapError::AttestationFailure(reason));
        }

        self.advance(WorkerPhase::Registered)?;
        Ok(ack)
    }

    /// Open the gate for dispatch
    pub fn begin_serving(&self) -> Result<(), BootstrapError> {
        self.advance(WorkerPhase::Serving)
    }

    /// Publish, wait for the acknowledgement, then serve
    pub async fn run(&self, quote: &AttestationQuote) -> Result<RegistrationAck, BootstrapError> {
        self.publish(quote)?;
        let ack = self.await_registration(quote).await?;
        self.begin_serving()?;
        Ok(ack)
    }
}
