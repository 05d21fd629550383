//! TEE Enclave — identity of a trusted execution context
//!
//! Every enclave slot in the ready pool is backed by one `TeeEnclave`:
//! - Backend detection (Intel SGX / ARM TrustZone / Simulated)
//! - Build measurement (MRENCLAVE / MRSIGNER) shared by all slots of one build
//! - A per-slot Ed25519 signing key used to sign work-order responses
//!
//! The signing key never leaves the enclave; the untrusted side only ever
//! sees the verifying key.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Supported TEE backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TeeBackend {
    /// Intel SGX enclave
    IntelSgx,
    /// ARM TrustZone
    ArmTrustZone,
    /// Software-simulated (always available, NOT hardware-secured)
    Simulated,
}

impl TeeBackend {
    pub fn name(&self) -> &str {
        match self {
            TeeBackend::IntelSgx => "Intel SGX",
            TeeBackend::ArmTrustZone => "ARM TrustZone",
            TeeBackend::Simulated => "Simulated (software)",
        }
    }
}

/// TEE enclave security level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityLevel {
    /// Hardware-backed (SGX/TrustZone available and verified)
    Hardware,
    /// Software simulation (no hardware TEE, development only)
    Software,
}

/// Status of a running enclave context, as reported across the boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnclaveStatus {
    pub enclave_id: String,
    pub backend: TeeBackend,
    pub security_level: SecurityLevel,
    pub created_at: DateTime<Utc>,
    pub signatures_issued: u64,
    pub is_healthy: bool,
}

/// Measurement of enclave identity, used for remote attestation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnclaveMeasurement {
    /// MRENCLAVE: hash of enclave code + data at build time
    #[serde(with = "hex32")]
    pub mrenclave: [u8; 32],
    /// MRSIGNER: hash of the signing key
    #[serde(with = "hex32")]
    pub mrsigner: [u8; 32],
    /// Product ID
    pub product_id: u16,
    /// Security version number
    pub isv_svn: u16,
}

impl EnclaveMeasurement {
    /// Compute a measurement for an enclave build (simulated via SHA256)
    pub fn compute(code_identity: &str, signer_key: &str, product_id: u16, svn: u16) -> Self {
        let mrenclave = {
            let mut h = Sha256::new();
            h.update(code_identity.as_bytes());
            h.update(b"mrenclave-v1");
            h.finalize().into()
        };
        let mrsigner = {
            let mut h = Sha256::new();
            h.update(signer_key.as_bytes());
            h.update(b"mrsigner-v1");
            h.finalize().into()
        };
        Self {
            mrenclave,
            mrsigner,
            product_id,
            isv_svn: svn,
        }
    }

    pub fn mrenclave_hex(&self) -> String {
        hex::encode(self.mrenclave)
    }

    pub fn mrsigner_hex(&self) -> String {
        hex::encode(self.mrsigner)
    }
}

/// Parse a 64-character hex MRENCLAVE as supplied by an operator.
pub fn parse_mrenclave(value: &str) -> Result<[u8; 32], TeeError> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| TeeError::InvalidMeasurement(format!("not hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| TeeError::InvalidMeasurement(format!("expected 32 bytes, got {}", b.len())))
}

/// A TEE enclave instance: identity, measurement and response signing key
pub struct TeeEnclave {
    /// Unique identifier
    pub id: String,
    /// Which backend is in use
    pub backend: TeeBackend,
    /// Enclave measurement
    pub measurement: EnclaveMeasurement,
    /// Response signing key, generated inside the enclave at startup
    signing_key: SigningKey,
    /// Creation timestamp
    created_at: DateTime<Utc>,
    /// Security level
    security_level: SecurityLevel,
    signatures_issued: u64,
}

impl TeeEnclave {
    /// Create and initialize a new TEE enclave for the given build
    pub fn new(backend: TeeBackend, measurement: EnclaveMeasurement) -> Result<Self, TeeError> {
        let security_level = match backend {
            TeeBackend::IntelSgx => {
                if Self::detect_sgx() {
                    SecurityLevel::Hardware
                } else {
                    log::warn!("Intel SGX not available, falling back to simulated enclave");
                    SecurityLevel::Software
                }
            }
            TeeBackend::ArmTrustZone => {
                if Self::detect_trustzone() {
                    SecurityLevel::Hardware
                } else {
                    log::warn!("ARM TrustZone not available, falling back to simulated enclave");
                    SecurityLevel::Software
                }
            }
            TeeBackend::Simulated => SecurityLevel::Software,
        };

        let id = uuid::Uuid::new_v4().to_string();
        let signing_key = SigningKey::generate(&mut OsRng);

        log::info!(
            "TEE enclave initialized: backend={}, security={:?}, id={}, mrenclave={}",
            backend.name(),
            security_level,
            &id[..8],
            &measurement.mrenclave_hex()[..16]
        );

        Ok(Self {
            id,
            backend,
            measurement,
            signing_key,
            created_at: Utc::now(),
            security_level,
            signatures_issued: 0,
        })
    }

    /// Sign a message with the enclave's response key
    pub fn sign(&mut self, message: &[u8]) -> Signature {
        self.signatures_issued += 1;
        self.signing_key.sign(message)
    }

    /// Public half of the response signing key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Get enclave status
    pub fn status(&self) -> EnclaveStatus {
        EnclaveStatus {
            enclave_id: self.id.clone(),
            backend: self.backend,
            security_level: self.security_level,
            created_at: self.created_at,
            signatures_issued: self.signatures_issued,
            is_healthy: true,
        }
    }

    /// Get the enclave measurement for remote attestation
    pub fn get_measurement(&self) -> &EnclaveMeasurement {
        &self.measurement
    }

    /// Get the security level
    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    fn detect_sgx() -> bool {
        // Real detection would also check CPUID leaf 0x12 and the driver version
        #[cfg(target_arch = "x86_64")]
        {
            std::path::Path::new("/dev/sgx_enclave").exists()
                || std::path::Path::new("/dev/isgx").exists()
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            false
        }
    }

    fn detect_trustzone() -> bool {
        #[cfg(target_arch = "aarch64")]
        {
            std::path::Path::new("/dev/tee0").exists()
                || std::path::Path::new("/dev/opteearmtz00").exists()
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            false
        }
    }
}

/// TEE-related errors
#[derive(Debug, thiserror::Error)]
pub enum TeeError {
    #[error("Invalid measurement: {0}")]
    InvalidMeasurement(String),

    #[error("Failed to start enclave context: {0}")]
    Startup(String),
}

/// Serde helper: fixed 32-byte arrays as lowercase hex strings
pub(crate) mod hex32 {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(d)?;
        super::parse_mrenclave(&text).map_err(D::Error::custom)
    }
}
