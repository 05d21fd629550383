//! Work Order Handler — the only path across the trust boundary
//!
//! Each enclave slot runs as an isolated execution context on its own
//! thread. The untrusted side never touches enclave state: it sends a
//! request message carrying bytes and awaits a reply message carrying
//! bytes. Two calls exist:
//!
//! 1. `handle(request_bytes, index)` → `(response_identifier, response_size)`
//! 2. `get_response(identifier, size, index)` → base-64 encoded response
//!
//! A context that hits an integrity fault answers the faulting call and
//! then shuts down; every later call to that index is an `EnclaveFault`.
//! Work already inside a context always runs to completion, even if the
//! caller stopped waiting for it.

use super::request::WorkOrderRequest;
use super::response_store::ResponseStore;
use super::signature::sign_response;
use super::workload::{WorkloadError, WorkloadRegistry};
use super::WorkOrderError;
use crate::bootstrap::RegistrationGate;
use crate::tee::{
    generate_quote, AttestationQuote, EnclaveMeasurement, EnclaveStatus, TeeBackend, TeeEnclave,
    TeeError,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::VerifyingKey;
use log::{debug, error, info};
use sha2::{Digest, Sha256};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Build identity used when no `enclave_build` is configured
pub const DEFAULT_ENCLAVE_BUILD: &str = concat!("enclave-dispatch-wpe-", env!("CARGO_PKG_VERSION"));
const ENCLAVE_SIGNER: &str = "enclave-dispatch-signer-v1";

/// Settings for the enclave contexts behind a handler
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub pool_size: usize,
    pub backend: TeeBackend,
    /// Code identity the enclave measurement is derived from
    pub enclave_build: String,
    pub isv_svn: u16,
    pub response_retention: Duration,
    pub max_pending_responses: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            backend: TeeBackend::Simulated,
            enclave_build: DEFAULT_ENCLAVE_BUILD.to_string(),
            isv_svn: 1,
            response_retention: Duration::from_secs(300),
            max_pending_responses: 1024,
        }
    }
}

impl HandlerConfig {
    /// Measurement every context of this build reports
    pub fn measurement(&self) -> EnclaveMeasurement {
        EnclaveMeasurement::compute(&self.enclave_build, ENCLAVE_SIGNER, 1, self.isv_svn)
    }
}

/// Messages that cross into an enclave context
enum Ecall {
    Handle {
        request: Vec<u8>,
        reply: oneshot::Sender<Result<(u32, usize), WorkOrderError>>,
    },
    GetResponse {
        identifier: u32,
        size: usize,
        reply: oneshot::Sender<Result<Vec<u8>, WorkOrderError>>,
    },
    Status {
        reply: oneshot::Sender<EnclaveStatus>,
    },
}

/// Trusted side of one slot. Lives only on its own thread.
struct EnclaveContext {
    index: usize,
    enclave: TeeEnclave,
    workloads: Arc<WorkloadRegistry>,
    responses: Arc<Mutex<ResponseStore>>,
    next_identifier: u32,
}

impl EnclaveContext {
    fn run(mut self, calls: mpsc::Receiver<Ecall>) {
        while let Ok(call) = calls.recv() {
            match call {
                Ecall::Handle { request, reply } => {
                    let result = self.handle(&request);
                    let fatal = matches!(result, Err(WorkOrderError::EnclaveFault { .. }));
                    if reply.send(result).is_err() {
                        debug!("Enclave {}: caller abandoned work order", self.index);
                    }
                    if fatal {
                        error!("Enclave {} shutting down after integrity fault", self.index);
                        return;
                    }
                }
                Ecall::GetResponse {
                    identifier,
                    size,
                    reply,
                } => {
                    let result = self.get_response(identifier, size);
                    let _ = reply.send(result);
                }
                Ecall::Status { reply } => {
                    let _ = reply.send(self.enclave.status());
                }
            }
        }
        debug!("Enclave {} context closed", self.index);
    }

    fn fault(&self, reason: impl Into<String>) -> WorkOrderError {
        WorkOrderError::EnclaveFault {
            index: self.index,
            reason: reason.into(),
        }
    }

    fn handle(&mut self, bytes: &[u8]) -> Result<(u32, usize), WorkOrderError> {
        let request = WorkOrderRequest::from_bytes(bytes)?;
        let workload = self.workloads.get(&request.workload_id).ok_or_else(|| {
            WorkOrderError::MalformedRequest(format!("unknown workload '{}'", request.workload_id))
        })?;

        let out_data = workload.process(&request.in_data).map_err(|e| match e {
            WorkloadError::Logic(msg) => WorkOrderError::ExecutionFault(msg),
            WorkloadError::Integrity(msg) => self.fault(msg),
        })?;

        let response = sign_response(&mut self.enclave, &request, self.index, out_data);
        let payload = serde_json::to_vec(&response).map_err(|e| self.fault(e.to_string()))?;

        let identifier = self.next_identifier;
        // Identifiers must stay unique for this context's lifetime
        self.next_identifier = self
            .next_identifier
            .checked_add(1)
            .ok_or_else(|| self.fault("response identifier space exhausted"))?;

        let size = self
            .responses
            .lock()
            .map_err(|_| self.fault("response store lock poisoned"))?
            .insert(identifier, self.index, payload);

        debug!(
            "Enclave {} completed work order {} as response {} ({} bytes)",
            self.index, request.work_order_id, identifier, size
        );
        Ok((identifier, size))
    }

    fn get_response(&self, identifier: u32, size: usize) -> Result<Vec<u8>, WorkOrderError> {
        self.responses
            .lock()
            .map_err(|_| self.fault("response store lock poisoned"))?
            .take(identifier, size, self.index)
    }
}

/// Untrusted-side handle on one context
struct ContextHandle {
    calls: mpsc::Sender<Ecall>,
    verifying_key: VerifyingKey,
    enclave_id: String,
}

/// Registry of enclave contexts, owned by the process and shared with the
/// dispatch loop.
pub struct WorkOrderHandler {
    contexts: Vec<ContextHandle>,
    measurement: EnclaveMeasurement,
    gate: RegistrationGate,
    responses: Arc<Mutex<ResponseStore>>,
    /// Used only to produce registration quotes
    attester: TeeEnclave,
}

impl WorkOrderHandler {
    /// Start `config.pool_size` enclave contexts
    pub fn new(
        config: &HandlerConfig,
        workloads: WorkloadRegistry,
        gate: RegistrationGate,
    ) -> Result<Self, TeeError> {
        let measurement = config.measurement();
        let workloads = Arc::new(workloads);
        let responses = Arc::new(Mutex::new(ResponseStore::new(
            config.response_retention,
            config.max_pending_responses,
        )));

        let mut contexts = Vec::with_capacity(config.pool_size);
        for index in 0..config.pool_size {
            let enclave = TeeEnclave::new(config.backend, measurement)?;
            let verifying_key = enclave.verifying_key();
            let enclave_id = enclave.id.clone();
            let (tx, rx) = mpsc::channel();
            let context = EnclaveContext {
                index,
                enclave,
                workloads: workloads.clone(),
                responses: responses.clone(),
                next_identifier: 1,
            };
            std::thread::Builder::new()
                .name(format!("enclave-{}", index))
                .spawn(move || context.run(rx))
                .map_err(|e| TeeError::Startup(e.to_string()))?;
            contexts.push(ContextHandle {
                calls: tx,
                verifying_key,
                enclave_id,
            });
        }

        let attester = TeeEnclave::new(config.backend, measurement)?;
        info!(
            "Work order handler ready: {} enclaves, mrenclave={}",
            contexts.len(),
            measurement.mrenclave_hex()
        );

        Ok(Self {
            contexts,
            measurement,
            gate,
            responses,
            attester,
        })
    }

    fn context(&self, index: usize) -> Result<&ContextHandle, WorkOrderError> {
        self.contexts
            .get(index)
            .ok_or(WorkOrderError::InvalidIndex(index))
    }

    /// Execute a serialized work order on enclave `index`
    pub async fn handle(
        &self,
        request_bytes: &[u8],
        index: usize,
    ) -> Result<(u32, usize), WorkOrderError> {
        if !self.gate.is_serving() {
            return Err(WorkOrderError::NotRegistered(self.gate.phase().to_string()));
        }
        let context = self.context(index)?;
        let (reply, response) = oneshot::channel();
        context
            .calls
            .send(Ecall::Handle {
                request: request_bytes.to_vec(),
                reply,
            })
            .map_err(|_| terminated(index))?;
        response.await.map_err(|_| terminated(index))?
    }

    /// Retrieve (and remove) a response as a base-64 string
    pub async fn get_response(
        &self,
        identifier: u32,
        size: usize,
        index: usize,
    ) -> Result<String, WorkOrderError> {
        let context = self.context(index)?;
        let (reply, response) = oneshot::channel();
        context
            .calls
            .send(Ecall::GetResponse {
                identifier,
                size,
                reply,
            })
            .map_err(|_| terminated(index))?;
        let payload = response.await.map_err(|_| terminated(index))??;
        Ok(STANDARD.encode(payload))
    }

    /// Live status of the context at `index`. A context that shut down
    /// after an integrity fault answers `EnclaveFault`.
    pub async fn status(&self, index: usize) -> Result<EnclaveStatus, WorkOrderError> {
        let context = self.context(index)?;
        let (reply, response) = oneshot::channel();
        context
            .calls
            .send(Ecall::Status { reply })
            .map_err(|_| terminated(index))?;
        response.await.map_err(|_| terminated(index))
    }

    /// Verifying key of the context at `index`
    pub fn verifying_key(&self, index: usize) -> Option<VerifyingKey> {
        self.contexts.get(index).map(|c| c.verifying_key)
    }

    pub fn enclave_id(&self, index: usize) -> Option<&str> {
        self.contexts.get(index).map(|c| c.enclave_id.as_str())
    }

    pub fn measurement(&self) -> &EnclaveMeasurement {
        &self.measurement
    }

    pub fn size(&self) -> usize {
        self.contexts.len()
    }

    pub fn gate(&self) -> &RegistrationGate {
        &self.gate
    }

    /// Digest of every context's verifying key, in index order
    pub fn report_data(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        for context in &self.contexts {
            h.update(context.verifying_key.as_bytes());
        }
        h.finalize().into()
    }

    /// Attestation quote binding this worker's keys, for KME registration
    pub fn attestation_quote(&self, nonce: &str) -> AttestationQuote {
        generate_quote(&self.attester, nonce, self.report_data())
    }

    /// Drop responses nobody retrieved within the retention window
    pub fn evict_expired_responses(&self) -> usize {
        match self.responses.lock() {
            Ok(mut store) => store.evict_expired(),
            Err(_) => 0,
        }
    }

    pub fn pending_responses(&self) -> usize {
        self.responses.lock().map(|s| s.len()).unwrap_or(0)
    }
}

fn terminated(index: usize) -> WorkOrderError {
    WorkOrderError::EnclaveFault {
        index,
        reason: "enclave context terminated".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_order::request::WorkOrderResponse;
    use crate::work_order::signature::verify_response;
    use crate::work_order::workload::Workload;

    struct Faulty;

    impl Workload for Faulty {
        fn id(&self) -> &str {
            "faulty"
        }
        fn process(&self, _input: &[u8]) -> Result<Vec<u8>, WorkloadError> {
            Err(WorkloadError::Integrity("sealed state corrupted".into()))
        }
    }

    fn handler(pool_size: usize) -> WorkOrderHandler {
        let mut workloads = WorkloadRegistry::with_builtins();
        workloads.register(Arc::new(Faulty));
        let config = HandlerConfig {
            pool_size,
            ..Default::default()
        };
        WorkOrderHandler::new(&config, workloads, RegistrationGate::open()).unwrap()
    }

    fn request(id: &str, workload: &str, data: &[u8]) -> Vec<u8> {
        WorkOrderRequest::new(id, workload, data.to_vec()).to_bytes()
    }

    #[tokio::test]
    async fn test_handle_then_get_response() {
        let handler = handler(2);
        let (id, size) = handler.handle(&request("wo-1", "echo", b"hi"), 1).await.unwrap();
        assert_eq!(handler.pending_responses(), 1);

        let encoded = handler.get_response(id, size, 1).await.unwrap();
        let response = WorkOrderResponse::decode(&encoded).unwrap();
        assert_eq!(response.work_order_id, "wo-1");
        assert_eq!(response.enclave_index, 1);
        assert_eq!(response.out_data, b"RESULT: hi");
        assert!(verify_response(&response, &handler.verifying_key(1).unwrap()).is_ok());
        assert!(verify_response(&response, &handler.verifying_key(0).unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_get_response_exactly_once() {
        let handler = handler(1);
        let (id, size) = handler.handle(&request("wo-1", "echo", b"a"), 0).await.unwrap();
        handler.get_response(id, size, 0).await.unwrap();
        assert!(matches!(
            handler.get_response(id, size, 0).await,
            Err(WorkOrderError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_identifiers_unique_per_enclave() {
        let handler = handler(1);
        let mut ids = Vec::new();
        for n in 0..5 {
            let (id, _) = handler
                .handle(&request(&format!("wo-{}", n), "echo", b"x"), 0)
                .await
                .unwrap();
            ids.push(id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test]
    async fn test_error_classification() {
        let handler = handler(1);
        assert!(matches!(
            handler.handle(b"{broken", 0).await,
            Err(WorkOrderError::MalformedRequest(_))
        ));
        assert!(matches!(
            handler.handle(&request("wo-1", "nope", b"x"), 0).await,
            Err(WorkOrderError::MalformedRequest(_))
        ));
        assert!(matches!(
            handler.handle(&request("wo-2", "sha256", b""), 0).await,
            Err(WorkOrderError::ExecutionFault(_))
        ));
        // Logic errors leave the context healthy
        assert!(handler.handle(&request("wo-3", "sha256", b"ok"), 0).await.is_ok());
        assert_eq!(
            handler.handle(&request("wo-4", "echo", b"x"), 9).await,
            Err(WorkOrderError::InvalidIndex(9))
        );
    }

    #[tokio::test]
    async fn test_integrity_fault_terminates_context() {
        let handler = handler(2);
        assert!(matches!(
            handler.handle(&request("wo-1", "faulty", b"x"), 0).await,
            Err(WorkOrderError::EnclaveFault { index: 0, .. })
        ));
        // The context is gone; the other one is unaffected
        assert!(matches!(
            handler.handle(&request("wo-2", "echo", b"x"), 0).await,
            Err(WorkOrderError::EnclaveFault { index: 0, .. })
        ));
        assert!(handler.handle(&request("wo-3", "echo", b"x"), 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_rejects_dispatch_before_serving() {
        let (_tx, rx) = tokio::sync::watch::channel(crate::bootstrap::WorkerPhase::MeasurementPublished);
        let handler = WorkOrderHandler::new(
            &HandlerConfig {
                pool_size: 1,
                ..Default::default()
            },
            WorkloadRegistry::with_builtins(),
            RegistrationGate::new(rx),
        )
        .unwrap();
        assert!(matches!(
            handler.handle(&request("wo-1", "echo", b"x"), 0).await,
            Err(WorkOrderError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_status_counts_signed_responses() {
        let handler = handler(2);
        for n in 0..3 {
            handler
                .handle(&request(&format!("wo-{}", n), "echo", b"x"), 0)
                .await
                .unwrap();
        }
        let status = handler.status(0).await.unwrap();
        assert_eq!(status.signatures_issued, 3);
        assert_eq!(status.enclave_id, handler.enclave_id(0).unwrap());
        assert!(status.is_healthy);
        assert_eq!(handler.status(1).await.unwrap().signatures_issued, 0);

        handler.handle(&request("wo-f", "faulty", b"x"), 1).await.unwrap_err();
        assert!(matches!(
            handler.status(1).await,
            Err(WorkOrderError::EnclaveFault { index: 1, .. })
        ));
    }

    #[test]
    fn test_quote_binds_all_verifying_keys() {
        let handler = handler(3);
        let quote = handler.attestation_quote("nonce-1");
        assert_eq!(quote.measurement, *handler.measurement());
        assert_eq!(quote.report_data, handler.report_data());
        assert!(crate::tee::verify_quote(&quote, &Default::default()).is_trusted());
    }
}
