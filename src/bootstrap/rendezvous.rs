//! One-shot rendezvous over a durable slot
//!
//! `watch_until` polls a slot at a fixed interval until it holds a value
//! accepted by a predicate. It never spins: each empty poll sleeps for the
//! interval, and a progress line is logged so long waits stay visible.

use super::BootstrapError;
use crate::storage::DurableSlot;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

/// Log a "still waiting" line every this many empty polls
const PROGRESS_EVERY: u32 = 50;

/// Read and decode the slot once
pub fn read_slot<T: DeserializeOwned>(slot: &dyn DurableSlot) -> Result<Option<T>, BootstrapError> {
    match slot.read()? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Poll `slot` until it holds a `T` for which `accept` is true.
///
/// `timeout: None` waits indefinitely. Values that fail to decode are
/// logged and treated as absent, since the writer may replace them.
pub async fn watch_until<T, F>(
    slot: &dyn DurableSlot,
    poll_interval: Duration,
    timeout: Option<Duration>,
    mut accept: F,
) -> Result<T, BootstrapError>
where
    T: DeserializeOwned,
    F: FnMut(&T) -> bool,
{
    let started = Instant::now();
    let mut polls: u32 = 0;
    loop {
        match read_slot::<T>(slot) {
            Ok(Some(value)) if accept(&value) => {
                debug!("Slot {} ready after {} polls", slot.describe(), polls);
                return Ok(value);
            }
            Ok(_) => {}
            Err(BootstrapError::Slot(e)) => {
                warn!("Slot {} unreadable: {}", slot.describe(), e);
            }
            Err(BootstrapError::Json(e)) => {
                warn!("Slot {} holds an undecodable value: {}", slot.describe(), e);
            }
            Err(e) => return Err(e),
        }

        let waited = started.elapsed();
        if let Some(limit) = timeout {
            if waited >= limit {
                return Err(BootstrapError::Timeout {
                    slot: slot.describe(),
                    waited,
                });
            }
        }

        polls += 1;
        if polls % PROGRESS_EVERY == 0 {
            info!(
                "Still waiting on slot {} ({:.1}s elapsed)",
                slot.describe(),
                waited.as_secs_f64()
            );
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySlot;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_times_out_on_empty_slot() {
        let slot = MemorySlot::new("empty");
        let result = watch_until::<u32, _>(
            &slot,
            Duration::from_millis(5),
            Some(Duration::from_millis(30)),
            |_| true,
        )
        .await;
        assert!(matches!(result, Err(BootstrapError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_returns_when_value_appears() {
        let slot = Arc::new(MemorySlot::new("late"));
        let writer = slot.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.write(b"41").unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.write(b"42").unwrap();
        });

        let value: u32 = watch_until(
            slot.as_ref(),
            Duration::from_millis(5),
            Some(Duration::from_secs(5)),
            |v: &u32| *v == 42,
        )
        .await
        .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_garbage_is_treated_as_absent() {
        let slot = MemorySlot::new("garbage");
        slot.write(b"not json").unwrap();
        let result = watch_until::<u32, _>(
            &slot,
            Duration::from_millis(5),
            Some(Duration::from_millis(20)),
            |_| true,
        )
        .await;
        assert!(matches!(result, Err(BootstrapError::Timeout { .. })));
    }
}
