//! Registration gate — the dispatch-side view of a worker's bootstrap phase

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

/// Phases of a Workload-Processing Enclave.
///
/// Starting → MeasurementPublished → Registered → Serving, or → Rejected
/// when the Key-Management Enclave refuses the measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerPhase {
    Starting,
    MeasurementPublished,
    Registered,
    Serving,
    /// Terminal: attestation failed, the worker never serves
    Rejected,
}

impl WorkerPhase {
    /// Whether `self → next` is a legal transition
    pub fn can_advance_to(self, next: WorkerPhase) -> bool {
        use WorkerPhase::*;
        matches!(
            (self, next),
            (Starting, MeasurementPublished)
                | (MeasurementPublished, Registered)
                | (Registered, Serving)
                | (Starting, Rejected)
                | (MeasurementPublished, Rejected)
        )
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerPhase::Starting => write!(f, "STARTING"),
            WorkerPhase::MeasurementPublished => write!(f, "MEASUREMENT_PUBLISHED"),
            WorkerPhase::Registered => write!(f, "REGISTERED"),
            WorkerPhase::Serving => write!(f, "SERVING"),
            WorkerPhase::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Read-only handle on a worker's phase, checked before every dispatch
#[derive(Debug, Clone)]
pub struct RegistrationGate {
    phase: watch::Receiver<WorkerPhase>,
}

impl RegistrationGate {
    pub(crate) fn new(phase: watch::Receiver<WorkerPhase>) -> Self {
        Self { phase }
    }

    /// A gate that is already serving, for a single-role deployment with no KME
    pub fn open() -> Self {
        let (_tx, rx) = watch::channel(WorkerPhase::Serving);
        Self { phase: rx }
    }

    pub fn phase(&self) -> WorkerPhase {
        *self.phase.borrow()
    }

    pub fn is_serving(&self) -> bool {
        self.phase() == WorkerPhase::Serving
    }

    /// Wait until the worker serves. Returns the phase it settled in, which
    /// is `Rejected` if bootstrap failed or the current phase on timeout.
    pub async fn wait_serving(&self, timeout: Duration) -> WorkerPhase {
        let mut rx = self.phase.clone();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|p| matches!(p, WorkerPhase::Serving | WorkerPhase::Rejected)),
        )
        .await;
        match settled {
            Ok(Ok(phase)) => *phase,
            // Timed out, or the bootstrap side went away
            _ => self.phase(),
        }
    }
}
