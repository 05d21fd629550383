//! Remote Attestation — gate worker registration on enclave identity
//!
//! The Workload-Processing Enclave produces a quote over its measurement,
//! a registration nonce and `report_data` (a digest of its response
//! verifying keys). The Key-Management Enclave checks the quote against an
//! `AttestationPolicy` before it accepts the worker into its trusted set.
//!
//! The quote "signature" is a simulated binding hash: it protects against
//! accidental corruption in the shared slot, not against a malicious host.

use super::enclave::{hex32, EnclaveMeasurement, SecurityLevel, TeeBackend, TeeEnclave};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An attestation quote produced by an enclave
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationQuote {
    /// The enclave measurement
    pub measurement: EnclaveMeasurement,
    /// Nonce chosen by the publisher for this registration round
    pub nonce: String,
    /// Application data bound into the quote
    #[serde(with = "hex32")]
    pub report_data: [u8; 32],
    /// Quote signature (hash binding measurement + nonce + report data)
    pub signature: String,
    /// TEE backend used
    pub backend: TeeBackend,
    /// Security level of the enclave
    pub security_level: SecurityLevel,
    /// Timestamp of quote generation
    pub timestamp: DateTime<Utc>,
    pub enclave_id: String,
}

/// Policy for accepting or rejecting attestation quotes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationPolicy {
    /// Trusted MRENCLAVE values, hex (empty = accept any)
    pub trusted_enclaves: Vec<String>,
    /// Trusted MRSIGNER values, hex (empty = accept any)
    pub trusted_signers: Vec<String>,
    /// Minimum security version number
    pub min_svn: u16,
    /// Whether to accept software-simulated enclaves
    pub allow_simulated: bool,
    /// Maximum age of quote in seconds
    pub max_quote_age_secs: i64,
    /// Minimum security level required
    pub min_security_level: SecurityLevel,
}

impl Default for AttestationPolicy {
    fn default() -> Self {
        Self {
            trusted_enclaves: Vec::new(),
            trusted_signers: Vec::new(),
            min_svn: 0,
            allow_simulated: true, // permissive default for development
            max_quote_age_secs: 3600,
            min_security_level: SecurityLevel::Software,
        }
    }
}

impl AttestationPolicy {
    /// Strict policy: require hardware TEE, known signer
    pub fn strict(trusted_signers: Vec<String>) -> Self {
        Self {
            trusted_enclaves: Vec::new(),
            trusted_signers,
            min_svn: 1,
            allow_simulated: false,
            max_quote_age_secs: 300,
            min_security_level: SecurityLevel::Hardware,
        }
    }
}

/// Result of verifying an attestation quote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttestationVerdict {
    /// Quote is valid and trusted
    Trusted {
        enclave_id: String,
        security_level: SecurityLevel,
    },
    /// Quote is valid but from an untrusted enclave
    Untrusted { reason: String },
    /// Quote is invalid or corrupted
    Invalid { reason: String },
    /// Quote has expired
    Expired,
}

impl AttestationVerdict {
    pub fn is_trusted(&self) -> bool {
        matches!(self, AttestationVerdict::Trusted { .. })
    }

    /// Human-readable reason for a non-trusted verdict
    pub fn reason(&self) -> String {
        match self {
            AttestationVerdict::Trusted { .. } => "trusted".to_string(),
            AttestationVerdict::Untrusted { reason } | AttestationVerdict::Invalid { reason } => {
                reason.clone()
            }
            AttestationVerdict::Expired => "quote expired".to_string(),
        }
    }
}

fn quote_binding(
    measurement: &EnclaveMeasurement,
    nonce: &str,
    report_data: &[u8; 32],
    enclave_id: &str,
) -> String {
    let mut h = Sha256::new();
    h.update(measurement.mrenclave);
    h.update(measurement.mrsigner);
    h.update(measurement.isv_svn.to_le_bytes());
    h.update(nonce.as_bytes());
    h.update(report_data);
    h.update(enclave_id.as_bytes());
    h.update(b"enclave-dispatch-quote-v1");
    hex::encode(h.finalize())
}

/// Generate an attestation quote from an enclave
pub fn generate_quote(enclave: &TeeEnclave, nonce: &str, report_data: [u8; 32]) -> AttestationQuote {
    let measurement = *enclave.get_measurement();
    let signature = quote_binding(&measurement, nonce, &report_data, &enclave.id);

    AttestationQuote {
        measurement,
        nonce: nonce.to_string(),
        report_data,
        signature,
        backend: enclave.backend,
        security_level: enclave.security_level(),
        timestamp: Utc::now(),
        enclave_id: enclave.id.clone(),
    }
}

/// Verify an attestation quote against a policy
pub fn verify_quote(quote: &AttestationQuote, policy: &AttestationPolicy) -> AttestationVerdict {
    // 1. Check quote freshness
    let age = (Utc::now() - quote.timestamp).num_seconds();
    if age > policy.max_quote_age_secs {
        return AttestationVerdict::Expired;
    }

    // 2. Verify signature integrity
    let expected_sig = quote_binding(
        &quote.measurement,
        &quote.nonce,
        &quote.report_data,
        &quote.enclave_id,
    );
    if quote.signature != expected_sig {
        return AttestationVerdict::Invalid {
            reason: "Quote signature mismatch".into(),
        };
    }

    // 3. Check simulated enclave policy
    if !policy.allow_simulated && quote.security_level == SecurityLevel::Software {
        return AttestationVerdict::Untrusted {
            reason: "Software-simulated enclave not allowed by policy".into(),
        };
    }

    // 4. Check security level
    let level_ok = match policy.min_security_level {
        SecurityLevel::Hardware => quote.security_level == SecurityLevel::Hardware,
        SecurityLevel::Software => true,
    };
    if !level_ok {
        return AttestationVerdict::Untrusted {
            reason: format!(
                "Security level {:?} below minimum {:?}",
                quote.security_level, policy.min_security_level
            ),
        };
    }

    // 5. Check SVN
    if quote.measurement.isv_svn < policy.min_svn {
        return AttestationVerdict::Untrusted {
            reason: format!(
                "SVN {} below minimum {}",
                quote.measurement.isv_svn, policy.min_svn
            ),
        };
    }

    // 6. Check trusted enclaves (if list is non-empty)
    if !policy.trusted_enclaves.is_empty()
        && !policy
            .trusted_enclaves
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&quote.measurement.mrenclave_hex()))
    {
        return AttestationVerdict::Untrusted {
            reason: "MRENCLAVE not in trusted list".into(),
        };
    }

    // 7. Check trusted signers (if list is non-empty)
    if !policy.trusted_signers.is_empty()
        && !policy
            .trusted_signers
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&quote.measurement.mrsigner_hex()))
    {
        return AttestationVerdict::Untrusted {
            reason: "MRSIGNER not in trusted list".into(),
        };
    }

    AttestationVerdict::Trusted {
        enclave_id: quote.enclave_id.clone(),
        security_level: quote.security_level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enclave() -> TeeEnclave {
        let m = EnclaveMeasurement::compute("wpe-build-1", "signer-a", 1, 1);
        TeeEnclave::new(TeeBackend::Simulated, m).unwrap()
    }

    #[test]
    fn test_generate_and_verify_quote() {
        let enclave = enclave();
        let quote = generate_quote(&enclave, "test-nonce-123", [7u8; 32]);

        assert_eq!(quote.nonce, "test-nonce-123");
        assert_eq!(quote.backend, TeeBackend::Simulated);
        assert!(!quote.signature.is_empty());

        let verdict = verify_quote(&quote, &AttestationPolicy::default());
        assert!(verdict.is_trusted());
    }

    #[test]
    fn test_strict_policy_rejects_simulated() {
        let quote = generate_quote(&enclave(), "nonce", [0u8; 32]);
        let verdict = verify_quote(&quote, &AttestationPolicy::strict(vec![]));
        assert!(!verdict.is_trusted());
    }

    #[test]
    fn test_expired_quote() {
        let mut quote = generate_quote(&enclave(), "nonce", [0u8; 32]);
        quote.timestamp = Utc::now() - chrono::Duration::hours(2);

        let verdict = verify_quote(&quote, &AttestationPolicy::default()); // max 3600s
        assert!(matches!(verdict, AttestationVerdict::Expired));
    }

    #[test]
    fn test_tampered_report_data() {
        let mut quote = generate_quote(&enclave(), "nonce", [1u8; 32]);
        quote.report_data = [2u8; 32];

        let verdict = verify_quote(&quote, &AttestationPolicy::default());
        assert!(matches!(verdict, AttestationVerdict::Invalid { .. }));
    }

    #[test]
    fn test_trusted_enclave_list() {
        let enclave = enclave();
        let quote = generate_quote(&enclave, "nonce", [0u8; 32]);

        let mut policy = AttestationPolicy::default();
        policy.trusted_enclaves = vec![quote.measurement.mrenclave_hex().to_uppercase()];
        assert!(verify_quote(&quote, &policy).is_trusted());

        policy.trusted_enclaves = vec![hex::encode([9u8; 32])];
        let verdict = verify_quote(&quote, &policy);
        assert_eq!(verdict.reason(), "MRENCLAVE not in trusted list");
    }

    #[test]
    fn test_svn_check() {
        let quote = generate_quote(&enclave(), "nonce", [0u8; 32]);

        let mut policy = AttestationPolicy::default();
        policy.min_svn = 99; // higher than enclave's SVN of 1

        assert!(!verify_quote(&quote, &policy).is_trusted());
    }
}
