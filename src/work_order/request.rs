//! Wire forms of work-order requests and responses
//!
//! Both travel as JSON with base-64 payload fields, so an encoded response
//! can be handed to any text transport unchanged.

use super::{base64_bytes, WorkOrderError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// A work order as submitted by a requester. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrderRequest {
    /// Caller-assigned identifier
    pub work_order_id: String,
    /// Target workload selector
    pub workload_id: String,
    /// Opaque input payload
    #[serde(with = "base64_bytes")]
    pub in_data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_nonce: Option<String>,
}

impl WorkOrderRequest {
    pub fn new(
        work_order_id: impl Into<String>,
        workload_id: impl Into<String>,
        in_data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            work_order_id: work_order_id.into(),
            workload_id: workload_id.into(),
            in_data: in_data.into(),
            requester_nonce: None,
        }
    }

    /// Serialize for transport across the trust boundary
    pub fn to_bytes(&self) -> Vec<u8> {
        // Only strings and byte vectors: serialization cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Decode and validate a serialized request
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WorkOrderError> {
        let request: Self = serde_json::from_slice(bytes)
            .map_err(|e| WorkOrderError::MalformedRequest(e.to_string()))?;
        if request.work_order_id.trim().is_empty() {
            return Err(WorkOrderError::MalformedRequest(
                "workOrderId must not be empty".into(),
            ));
        }
        if request.workload_id.trim().is_empty() {
            return Err(WorkOrderError::MalformedRequest(
                "workloadId must not be empty".into(),
            ));
        }
        Ok(request)
    }
}

/// Result of a work order, signed inside the enclave that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkOrderResponse {
    pub work_order_id: String,
    pub workload_id: String,
    pub enclave_index: usize,
    #[serde(with = "base64_bytes")]
    pub out_data: Vec<u8>,
    /// Hex SHA-256 over the output
    pub result_hash: String,
    /// Base-64 Ed25519 signature, see `signature::signing_message`
    pub signature: String,
}

impl WorkOrderResponse {
    /// Base-64 of the JSON form, as returned by `get_response`
    pub fn encode(&self) -> String {
        STANDARD.encode(serde_json::to_vec(self).unwrap_or_default())
    }

    pub fn decode(encoded: &str) -> Result<Self, WorkOrderError> {
        let json = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| WorkOrderError::MalformedRequest(format!("response not base-64: {}", e)))?;
        serde_json::from_slice(&json)
            .map_err(|e| WorkOrderError::MalformedRequest(format!("response not JSON: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let req = WorkOrderRequest::new("wo-1", "echo", b"hello".to_vec());
        let json = String::from_utf8(req.to_bytes()).unwrap();
        assert!(json.contains("\"workOrderId\":\"wo-1\""));
        assert!(json.contains("\"inData\":\"aGVsbG8=\""));
        assert!(!json.contains("requesterNonce"));
        assert_eq!(WorkOrderRequest::from_bytes(json.as_bytes()).unwrap(), req);
    }

    #[test]
    fn test_malformed_requests() {
        let cases: [&[u8]; 4] = [
            b"not json",
            br#"{"workOrderId":"a","workloadId":"echo","inData":"***"}"#,
            br#"{"workOrderId":"","workloadId":"echo","inData":""}"#,
            br#"{"workOrderId":"a","workloadId":" ","inData":""}"#,
        ];
        for case in cases {
            assert!(matches!(
                WorkOrderRequest::from_bytes(case),
                Err(WorkOrderError::MalformedRequest(_))
            ));
        }
    }

    #[test]
    fn test_response_encode_is_base64_safe() {
        let resp = WorkOrderResponse {
            work_order_id: "wo-9".into(),
            workload_id: "sha256".into(),
            enclave_index: 2,
            out_data: vec![0, 255, 10, 13],
            result_hash: "00".into(),
            signature: "AA==".into(),
        };
        let encoded = resp.encode();
        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='));
        assert_eq!(WorkOrderResponse::decode(&encoded).unwrap(), resp);
        assert!(WorkOrderResponse::decode("%%%").is_err());
    }
}
