//! Process configuration loaded from `enclave-dispatch.toml`.
//!
//! Every field has a default, so a missing file or a partial file is fine.
//! `ENCLAVE_DISPATCH_KME_ADDRESS` and `ENCLAVE_DISPATCH_MRENCLAVE_OVERRIDE`
//! take precedence over the file.

use crate::manager::{DispatchSettings, RetryPolicy};
use crate::tee::{parse_mrenclave, AttestationPolicy, TeeBackend};
use crate::work_order::handler::DEFAULT_ENCLAVE_BUILD;
use crate::work_order::HandlerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "enclave-dispatch.toml";
pub const ENV_KME_ADDRESS: &str = "ENCLAVE_DISPATCH_KME_ADDRESS";
pub const ENV_MRENCLAVE_OVERRIDE: &str = "ENCLAVE_DISPATCH_MRENCLAVE_OVERRIDE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which half of the split this process plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Dispatch without a KME; the gate is open from the start
    Standalone,
    Kme,
    Wpe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_role")]
    pub role: Role,

    /// Identity of the KME whose acknowledgements a worker accepts
    #[serde(default = "default_kme_address")]
    pub kme_address: String,

    /// Shared volume holding the bootstrap slots
    #[serde(default = "default_persistence_dir")]
    pub persistence_dir: PathBuf,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Dispatch loops running in parallel
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Redispatches allowed after enclave faults
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,

    /// 0 fails fast with PoolExhausted
    #[serde(default)]
    pub checkout_wait_ms: u64,

    #[serde(default = "default_response_retention_secs")]
    pub response_retention_secs: u64,

    #[serde(default = "default_max_pending_responses")]
    pub max_pending_responses: usize,

    /// 0 disables the latency guard
    #[serde(default = "default_max_latency_secs")]
    pub max_latency_secs: u64,

    #[serde(default = "default_measurement_poll_ms")]
    pub measurement_poll_ms: u64,

    /// 0 waits indefinitely
    #[serde(default = "default_bootstrap_timeout_secs")]
    pub bootstrap_timeout_secs: u64,

    /// Hex MRENCLAVE the KME trusts regardless of what is published
    #[serde(default)]
    pub mrenclave_override: Option<String>,

    #[serde(default = "default_backend")]
    pub backend: TeeBackend,

    #[serde(default = "default_enclave_build")]
    pub enclave_build: String,

    #[serde(default = "default_isv_svn")]
    pub isv_svn: u16,

    #[serde(default)]
    pub attestation: AttestationPolicy,
}

fn default_role() -> Role {
    Role::Standalone
}

fn default_kme_address() -> String {
    "kme-local".to_string()
}

fn default_persistence_dir() -> PathBuf {
    PathBuf::from("enclave-dispatch-state")
}

fn default_pool_size() -> usize {
    4
}

fn default_worker_count() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    20
}

fn default_backoff_cap_ms() -> u64 {
    1000
}

fn default_idle_wait_ms() -> u64 {
    50
}

fn default_response_retention_secs() -> u64 {
    300
}

fn default_max_pending_responses() -> usize {
    1024
}

fn default_max_latency_secs() -> u64 {
    300
}

fn default_measurement_poll_ms() -> u64 {
    200
}

fn default_bootstrap_timeout_secs() -> u64 {
    600
}

fn default_backend() -> TeeBackend {
    TeeBackend::Simulated
}

fn default_enclave_build() -> String {
    DEFAULT_ENCLAVE_BUILD.to_string()
}

fn default_isv_svn() -> u16 {
    1
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
            kme_address: default_kme_address(),
            persistence_dir: default_persistence_dir(),
            pool_size: default_pool_size(),
            worker_count: default_worker_count(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            idle_wait_ms: default_idle_wait_ms(),
            checkout_wait_ms: 0,
            response_retention_secs: default_response_retention_secs(),
            max_pending_responses: default_max_pending_responses(),
            max_latency_secs: default_max_latency_secs(),
            measurement_poll_ms: default_measurement_poll_ms(),
            bootstrap_timeout_secs: default_bootstrap_timeout_secs(),
            mrenclave_override: None,
            backend: default_backend(),
            enclave_build: default_enclave_build(),
            isv_svn: default_isv_svn(),
            attestation: AttestationPolicy::default(),
        }
    }
}

impl DispatchConfig {
    /// Load `enclave-dispatch.toml` from the working directory, falling
    /// back to defaults if it does not exist
    pub fn load() -> Result<Self, ConfigError> {
        let path = Path::new(CONFIG_FILE);
        let mut config = if path.exists() {
            Self::parse_file(path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load an explicitly named file; it must exist
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::parse_file(path.as_ref())?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&contents)?)
    }

    /// Environment values win over the file; empty values are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(address) = lookup(ENV_KME_ADDRESS).filter(|v| !v.is_empty()) {
            self.kme_address = address;
        }
        if let Some(mrenclave) = lookup(ENV_MRENCLAVE_OVERRIDE).filter(|v| !v.is_empty()) {
            self.mrenclave_override = Some(mrenclave);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1".into()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        if self.measurement_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "measurement_poll_ms must be positive".into(),
            ));
        }
        if self.response_retention_secs == 0 {
            return Err(ConfigError::Invalid(
                "response_retention_secs must be positive".into(),
            ));
        }
        if self.max_pending_responses < self.pool_size {
            return Err(ConfigError::Invalid(format!(
                "max_pending_responses ({}) must be at least pool_size ({})",
                self.max_pending_responses, self.pool_size
            )));
        }
        self.override_mrenclave()?;
        Ok(())
    }

    /// Parsed operator override, if any
    pub fn override_mrenclave(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        self.mrenclave_override
            .as_deref()
            .map(parse_mrenclave)
            .transpose()
            .map_err(|e| ConfigError::Invalid(format!("mrenclave_override: {}", e)))
    }

    pub fn handler_config(&self) -> HandlerConfig {
        HandlerConfig {
            pool_size: self.pool_size,
            backend: self.backend,
            enclave_build: self.enclave_build.clone(),
            isv_svn: self.isv_svn,
            response_retention: Duration::from_secs(self.response_retention_secs),
            max_pending_responses: self.max_pending_responses,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.base_delay_ms),
            backoff_cap: Duration::from_millis(self.backoff_cap_ms),
        }
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            retry: self.retry_policy(),
            idle_wait: Duration::from_millis(self.idle_wait_ms),
            checkout_wait: Duration::from_millis(self.checkout_wait_ms),
            max_latency: (self.max_latency_secs > 0)
                .then(|| Duration::from_secs(self.max_latency_secs)),
        }
    }

    pub fn measurement_poll(&self) -> Duration {
        Duration::from_millis(self.measurement_poll_ms)
    }

    pub fn bootstrap_timeout(&self) -> Option<Duration> {
        (self.bootstrap_timeout_secs > 0).then(|| Duration::from_secs(self.bootstrap_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = DispatchConfig::default();
        assert_eq!(config.role, Role::Standalone);
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.max_retries, 3);
        assert!(config.mrenclave_override.is_none());
        assert!(config.validate().is_ok());
        assert_eq!(
            config.dispatch_settings().max_latency,
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_deserialize_partial_toml() {
        let toml_str = r#"
            role = "wpe"
            pool_size = 8
            max_latency_secs = 0

            [attestation]
            allow_simulated = false
        "#;
        let config: DispatchConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.role, Role::Wpe);
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.worker_count, 2);
        assert!(config.dispatch_settings().max_latency.is_none());
        assert!(!config.attestation.allow_simulated);
        assert_eq!(config.attestation.max_quote_age_secs, 3600);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config: DispatchConfig = toml::from_str(r#"kme_address = "from-file""#).unwrap();
        let mrenclave = "ab".repeat(32);
        let env = |key: &str| match key {
            ENV_KME_ADDRESS => Some("from-env".to_string()),
            ENV_MRENCLAVE_OVERRIDE => Some(mrenclave.clone()),
            _ => None,
        };
        config.apply_overrides(env);
        assert_eq!(config.kme_address, "from-env");
        assert_eq!(config.override_mrenclave().unwrap(), Some([0xab; 32]));
    }

    #[test]
    fn test_empty_env_value_ignored() {
        let mut config = DispatchConfig::default();
        config.apply_overrides(|_| Some(String::new()));
        assert_eq!(config.kme_address, "kme-local");
        assert!(config.mrenclave_override.is_none());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = DispatchConfig {
            pool_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.pool_size = 2;
        config.mrenclave_override = Some("not-hex".into());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.mrenclave_override = None;
        assert!(config.validate().is_ok());

        // Every busy context must be able to park one response
        config.pool_size = 4;
        config.max_pending_responses = 1;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.max_pending_responses = 4;
        assert!(config.validate().is_ok());

        config.response_retention_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "role = \"kme\"\nmeasurement_poll_ms = 25\n").unwrap();
        let config = DispatchConfig::load_from(&path).unwrap();
        assert_eq!(config.role, Role::Kme);
        assert_eq!(config.measurement_poll(), Duration::from_millis(25));

        assert!(matches!(
            DispatchConfig::load_from(dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
