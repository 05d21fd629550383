//! Response hashing and signatures
//!
//! The enclave hashes its output, then signs the digest of
//! `workOrderId || workloadId || resultHash` with its per-slot key.
//! The untrusted side re-derives both hashes before trusting a response.

use super::request::{WorkOrderRequest, WorkOrderResponse};
use crate::tee::TeeEnclave;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    #[error("result hash does not match output data")]
    HashMismatch,
    #[error("signature is not a valid encoding: {0}")]
    Encoding(String),
    #[error("signature does not verify against the enclave key")]
    Invalid,
}

/// Hex SHA-256 of a workload output
pub fn compute_result_hash(out_data: &[u8]) -> String {
    hex::encode(Sha256::digest(out_data))
}

/// Digest that the enclave signs for a response.
///
/// Each field is length-prefixed so no two field splits hash alike.
pub fn signing_message(work_order_id: &str, workload_id: &str, result_hash: &str) -> [u8; 32] {
    let mut h = Sha256::new();
    for field in [work_order_id, workload_id, result_hash] {
        h.update((field.len() as u64).to_le_bytes());
        h.update(field.as_bytes());
    }
    h.finalize().into()
}

/// Build a signed response inside the enclave
pub(crate) fn sign_response(
    enclave: &mut TeeEnclave,
    request: &WorkOrderRequest,
    enclave_index: usize,
    out_data: Vec<u8>,
) -> WorkOrderResponse {
    let result_hash = compute_result_hash(&out_data);
    let message = signing_message(&request.work_order_id, &request.workload_id, &result_hash);
    let signature = enclave.sign(&message);

    WorkOrderResponse {
        work_order_id: request.work_order_id.clone(),
        workload_id: request.workload_id.clone(),
        enclave_index,
        out_data,
        result_hash,
        signature: STANDARD.encode(signature.to_bytes()),
    }
}

/// Check a response's hash and signature against the producing enclave's key
pub fn verify_response(
    response: &WorkOrderResponse,
    key: &VerifyingKey,
) -> Result<(), VerificationError> {
    if compute_result_hash(&response.out_data) != response.result_hash {
        return Err(VerificationError::HashMismatch);
    }

    let raw = STANDARD
        .decode(response.signature.as_bytes())
        .map_err(|e| VerificationError::Encoding(e.to_string()))?;
    let raw: [u8; 64] = raw
        .try_into()
        .map_err(|b: Vec<u8>| VerificationError::Encoding(format!("{} bytes", b.len())))?;
    let signature = Signature::from_bytes(&raw);

    let message = signing_message(
        &response.work_order_id,
        &response.workload_id,
        &response.result_hash,
    );
    key.verify(&message, &signature)
        .map_err(|_| VerificationError::Invalid)
}
