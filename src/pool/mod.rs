//! Ready Enclave Pool — fixed-capacity arena of enclave slots
//!
//! Slots are created once at startup and addressed by a stable index.
//! All slot mutation goes through one lock, so two concurrent `checkout()`
//! calls can never observe the same slot as idle.

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Lifecycle state of a single enclave slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotState {
    Idle,
    Busy,
    /// Permanently quarantined; the index is never handed out again
    Unavailable,
}

/// A slot as seen from outside the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyEnclave {
    pub index: usize,
    pub state: SlotState,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("no idle enclave available ({live} live of {capacity})")]
    PoolExhausted { live: usize, capacity: usize },

    #[error("invalid enclave index {index}: {reason}")]
    InvalidIndex { index: usize, reason: &'static str },
}

struct Slots {
    states: Vec<SlotState>,
    /// Next index to try, so idle slots are handed out round-robin
    cursor: usize,
}

pub struct ReadyEnclavePool {
    slots: Mutex<Slots>,
    released: Notify,
}

impl ReadyEnclavePool {
    /// Create a pool of `size` idle slots, indexed `0..size`
    pub fn new(size: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                states: vec![SlotState::Idle; size],
                cursor: 0,
            }),
            released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        // A panic while holding the lock cannot leave a slot half-updated:
        // every critical section is a single state assignment.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check out an idle enclave and mark it busy
    pub fn checkout(&self) -> Result<usize, PoolError> {
        let mut slots = self.lock();
        let capacity = slots.states.len();
        for offset in 0..capacity {
            let index = (slots.cursor + offset) % capacity;
            if slots.states[index] == SlotState::Idle {
                slots.states[index] = SlotState::Busy;
                slots.cursor = (index + 1) % capacity;
                debug!("Checked out enclave {}", index);
                return Ok(index);
            }
        }
        let live = slots
            .states
            .iter()
            .filter(|s| **s != SlotState::Unavailable)
            .count();
        if live == 0 && capacity > 0 {
            error!("Every enclave in the pool is quarantined");
        }
        Err(PoolError::PoolExhausted { live, capacity })
    }

    /// Check out an enclave, waiting up to `timeout` for one to be checked in
    pub async fn checkout_wait(&self, timeout: Duration) -> Result<usize, PoolError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before scanning so a checkin between the scan
            // and the await is not missed.
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.checkout() {
                Ok(index) => return Ok(index),
                Err(PoolError::PoolExhausted { live: 0, capacity }) => {
                    return Err(PoolError::PoolExhausted { live: 0, capacity })
                }
                Err(e) => {
                    if tokio::time::timeout_at(deadline, released).await.is_err() {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Return a busy enclave to the idle set
    pub fn checkin(&self, index: usize) -> Result<(), PoolError> {
        {
            let mut slots = self.lock();
            match slots.states.get(index).copied() {
                None => {
                    return Err(PoolError::InvalidIndex {
                        index,
                        reason: "out of range",
                    })
                }
                Some(SlotState::Idle) => {
                    return Err(PoolError::InvalidIndex {
                        index,
                        reason: "already idle",
                    })
                }
                Some(SlotState::Unavailable) => {
                    return Err(PoolError::InvalidIndex {
                        index,
                        reason: "quarantined",
                    })
                }
                Some(SlotState::Busy) => slots.states[index] = SlotState::Idle,
            }
        }
        debug!("Checked in enclave {}", index);
        self.released.notify_one();
        Ok(())
    }

    /// Permanently remove an enclave from service
    pub fn mark_unavailable(&self, index: usize) -> Result<(), PoolError> {
        let mut slots = self.lock();
        let state = slots.states.get_mut(index).ok_or(PoolError::InvalidIndex {
            index,
            reason: "out of range",
        })?;
        if *state != SlotState::Unavailable {
            *state = SlotState::Unavailable;
            warn!("Enclave {} quarantined and removed from the pool", index);
        }
        let live = slots
            .states
            .iter()
            .filter(|s| **s != SlotState::Unavailable)
            .count();
        drop(slots);
        if live == 0 {
            // Wake bounded waiters so they fail fast instead of timing out
            self.released.notify_waiters();
        }
        Ok(())
    }

    pub fn state(&self, index: usize) -> Option<SlotState> {
        self.lock().states.get(index).copied()
    }

    pub fn capacity(&self) -> usize {
        self.lock().states.len()
    }

    pub fn idle_count(&self) -> usize {
        self.count(SlotState::Idle)
    }

    pub fn busy_count(&self) -> usize {
        self.count(SlotState::Busy)
    }

    /// Slots that are not quarantined
    pub fn live_count(&self) -> usize {
        self.capacity() - self.count(SlotState::Unavailable)
    }

    fn count(&self, state: SlotState) -> usize {
        self.lock().states.iter().filter(|s| **s == state).count()
    }

    pub fn snapshot(&self) -> Vec<ReadyEnclave> {
        self.lock()
            .states
            .iter()
            .enumerate()
            .map(|(index, state)| ReadyEnclave {
                index,
                state: *state,
            })
            .collect()
    }
}
