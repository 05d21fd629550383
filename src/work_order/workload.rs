//! Workloads — what an enclave actually computes
//!
//! Workload semantics are outside this crate; the registry only maps a
//! `workload_id` to an implementation. `echo` and `sha256` are provided for
//! smoke tests and the demo binary.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkloadError {
    /// The workload rejected its input or failed its own logic
    #[error("{0}")]
    Logic(String),
    /// Trusted state can no longer be relied on
    #[error("integrity violation: {0}")]
    Integrity(String),
}

/// A computation executed inside an enclave
pub trait Workload: Send + Sync {
    fn id(&self) -> &str;
    fn process(&self, input: &[u8]) -> Result<Vec<u8>, WorkloadError>;
}

/// Returns `RESULT: <input>`
pub struct EchoWorkload;

impl Workload for EchoWorkload {
    fn id(&self) -> &str {
        "echo"
    }

    fn process(&self, input: &[u8]) -> Result<Vec<u8>, WorkloadError> {
        let mut out = b"RESULT: ".to_vec();
        out.extend_from_slice(input);
        Ok(out)
    }
}

/// Returns the hex SHA-256 of the input. Empty input is rejected.
pub struct Sha256Workload;

impl Workload for Sha256Workload {
    fn id(&self) -> &str {
        "sha256"
    }

    fn process(&self, input: &[u8]) -> Result<Vec<u8>, WorkloadError> {
        if input.is_empty() {
            return Err(WorkloadError::Logic("nothing to hash".into()));
        }
        Ok(hex::encode(Sha256::digest(input)).into_bytes())
    }
}

#[derive(Clone, Default)]
pub struct WorkloadRegistry {
    workloads: HashMap<String, Arc<dyn Workload>>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `echo` and `sha256`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(EchoWorkload));
        registry.register(Arc::new(Sha256Workload));
        registry
    }

    /// Register a workload, replacing any previous one with the same id
    pub fn register(&mut self, workload: Arc<dyn Workload>) {
        self.workloads.insert(workload.id().to_string(), workload);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Workload>> {
        self.workloads.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workloads.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        let registry = WorkloadRegistry::with_builtins();
        assert_eq!(registry.ids(), vec!["echo", "sha256"]);

        let echo = registry.get("echo").unwrap();
        assert_eq!(echo.process(b"hi").unwrap(), b"RESULT: hi");

        let sha = registry.get("sha256").unwrap();
        assert_eq!(
            sha.process(b"abc").unwrap(),
            b"ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(matches!(sha.process(b""), Err(WorkloadError::Logic(_))));
        assert!(registry.get("missing").is_none());
    }
}
