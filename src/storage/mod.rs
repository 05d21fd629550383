//! Durable single-value slots for the KME/WPE hand-off
//!
//! A slot holds exactly one value at a time (it is not a queue). Each slot
//! has one writer and one reader: the measurement slot is written by the
//! Workload-Processing Enclave and read by the Key-Management Enclave, the
//! acknowledgement slot the other way round.
//!
//! `FileSlot` persists a checksummed JSON envelope and replaces it with an
//! atomic rename, so a reader never observes a torn write.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("slot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("slot encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("slot {path} failed integrity check")]
    Corrupted { path: String },
}

/// Single-writer / single-reader durable slot
pub trait DurableSlot: Send + Sync {
    /// Current value, or `None` if nothing has been written
    fn read(&self) -> Result<Option<Vec<u8>>, SlotError>;
    /// Replace the current value
    fn write(&self, value: &[u8]) -> Result<(), SlotError>;
    /// Where the slot lives, for logs
    fn describe(&self) -> String;
}

#[derive(Debug, Serialize, Deserialize)]
struct SlotEnvelope {
    checksum: String,
    written_at: DateTime<Utc>,
    body: String,
}

/// Slot backed by a file on the shared persistence volume
pub struct FileSlot {
    path: PathBuf,
}

impl FileSlot {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Slot named `name` under `dir`
    pub fn in_dir(dir: impl AsRef<Path>, name: &str) -> Self {
        Self::new(dir.as_ref().join(format!("{}.slot.json", name)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DurableSlot for FileSlot {
    fn read(&self) -> Result<Option<Vec<u8>>, SlotError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: SlotEnvelope = serde_json::from_str(&data)?;
        let checksum = hex::encode(Sha256::digest(envelope.body.as_bytes()));
        if checksum != envelope.checksum {
            warn!("Slot {} checksum mismatch", self.path.display());
            return Err(SlotError::Corrupted {
                path: self.path.display().to_string(),
            });
        }
        Ok(Some(envelope.body.into_bytes()))
    }

    fn write(&self, value: &[u8]) -> Result<(), SlotError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = String::from_utf8_lossy(value).into_owned();
        let envelope = SlotEnvelope {
            checksum: hex::encode(Sha256::digest(body.as_bytes())),
            written_at: Utc::now(),
            body,
        };
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&envelope)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("Wrote slot {}", self.path.display());
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-process slot for tests and single-host demos
#[derive(Default)]
pub struct MemorySlot {
    value: Mutex<Option<Vec<u8>>>,
    name: String,
}

impl MemorySlot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            value: Mutex::new(None),
            name: name.into(),
        }
    }
}

impl DurableSlot for MemorySlot {
    fn read(&self) -> Result<Option<Vec<u8>>, SlotError> {
        Ok(self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    fn write(&self, value: &[u8]) -> Result<(), SlotError> {
        *self
            .value
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(value.to_vec());
        Ok(())
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.name)
    }
}
