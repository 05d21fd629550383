//! Response store — serialized results parked until retrieval
//!
//! Records are keyed by `(identifier, enclave_index)` and removed on the
//! first successful `take`. Abandoned records are bounded two ways: a
//! retention timeout, and a hard cap that evicts the oldest record first.
//! The cap never evicts the newest record of another enclave index, since
//! that context may still be waiting for its caller to collect it; when
//! only such records remain the store runs over the cap instead.

use super::WorkOrderError;
use log::{debug, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// One pending response
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub identifier: u32,
    pub size: usize,
    pub payload: Vec<u8>,
    stored_at: Instant,
    seq: u64,
}

#[derive(Debug)]
pub struct ResponseStore {
    records: HashMap<(u32, usize), ResponseRecord>,
    retention: Duration,
    max_records: usize,
    next_seq: u64,
    evicted_total: u64,
}

impl ResponseStore {
    pub fn new(retention: Duration, max_records: usize) -> Self {
        Self {
            records: HashMap::new(),
            retention,
            max_records: max_records.max(1),
            next_seq: 0,
            evicted_total: 0,
        }
    }

    /// Store a payload and return its size
    pub fn insert(&mut self, identifier: u32, enclave_index: usize, payload: Vec<u8>) -> usize {
        self.insert_at(identifier, enclave_index, payload, Instant::now())
    }

    fn insert_at(
        &mut self,
        identifier: u32,
        enclave_index: usize,
        payload: Vec<u8>,
        now: Instant,
    ) -> usize {
        self.evict_expired_at(now);
        while self.records.len() >= self.max_records {
            match self.oldest_evictable(enclave_index) {
                Some(key) => {
                    self.records.remove(&key);
                    self.evicted_total += 1;
                    warn!(
                        "Response store full, evicted response {} of enclave {}",
                        key.0, key.1
                    );
                }
                None => {
                    debug!(
                        "Response store over cap ({} records), all awaiting collection",
                        self.records.len()
                    );
                    break;
                }
            }
        }

        let size = payload.len();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.insert(
            (identifier, enclave_index),
            ResponseRecord {
                identifier,
                size,
                payload,
                stored_at: now,
                seq,
            },
        );
        size
    }

    /// Oldest record the cap may drop when storing for `inserting_index`.
    ///
    /// Everything already held for `inserting_index` is superseded by the
    /// incoming record; any other index keeps its newest record.
    fn oldest_evictable(&self, inserting_index: usize) -> Option<(u32, usize)> {
        let mut newest: HashMap<usize, u64> = HashMap::new();
        for ((_, index), record) in &self.records {
            let seq = newest.entry(*index).or_insert(record.seq);
            *seq = (*seq).max(record.seq);
        }
        self.records
            .iter()
            .filter(|((_, index), record)| {
                *index == inserting_index || newest.get(index) != Some(&record.seq)
            })
            .min_by_key(|(_, r)| (r.stored_at, r.seq))
            .map(|(k, _)| *k)
    }

    /// Retrieve and remove a response. A second call for the same key fails.
    pub fn take(
        &mut self,
        identifier: u32,
        size: usize,
        enclave_index: usize,
    ) -> Result<Vec<u8>, WorkOrderError> {
        let key = (identifier, enclave_index);
        match self.records.get(&key) {
            Some(record) if record.size == size => {}
            _ => {
                return Err(WorkOrderError::NotFound {
                    identifier,
                    size,
                    index: enclave_index,
                })
            }
        }
        let record = self.records.remove(&key).ok_or(WorkOrderError::NotFound {
            identifier,
            size,
            index: enclave_index,
        })?;
        Ok(record.payload)
    }

    /// Drop records older than the retention timeout; returns how many
    pub fn evict_expired(&mut self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    fn evict_expired_at(&mut self, now: Instant) -> usize {
        let retention = self.retention;
        let before = self.records.len();
        self.records
            .retain(|_, r| now.saturating_duration_since(r.stored_at) <= retention);
        let evicted = before - self.records.len();
        if evicted > 0 {
            self.evicted_total += evicted as u64;
            debug!("Evicted {} unclaimed responses past retention", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ResponseStore {
        ResponseStore::new(Duration::from_secs(60), 16)
    }

    #[test]
    fn test_take_is_exactly_once() {
        let mut store = store();
        let size = store.insert(1, 0, b"payload".to_vec());
        assert_eq!(size, 7);

        assert_eq!(store.take(1, size, 0).unwrap(), b"payload");
        assert!(matches!(
            store.take(1, size, 0),
            Err(WorkOrderError::NotFound { identifier: 1, .. })
        ));
    }

    #[test]
    fn test_key_includes_enclave_index() {
        let mut store = store();
        store.insert(1, 0, b"zero".to_vec());
        store.insert(1, 1, b"one".to_vec());
        assert_eq!(store.len(), 2);
        assert_eq!(store.take(1, 3, 1).unwrap(), b"one");
        assert_eq!(store.take(1, 4, 0).unwrap(), b"zero");
        assert!(store.is_empty());
    }

    #[test]
    fn test_size_mismatch_is_not_found_and_keeps_record() {
        let mut store = store();
        store.insert(5, 0, b"abc".to_vec());
        assert!(store.take(5, 99, 0).is_err());
        assert_eq!(store.take(5, 3, 0).unwrap(), b"abc");
    }

    #[test]
    fn test_retention_evicts_abandoned_responses() {
        let mut store = ResponseStore::new(Duration::from_millis(100), 16);
        let t0 = Instant::now();
        store.insert_at(1, 0, b"old".to_vec(), t0);
        store.insert_at(2, 0, b"new".to_vec(), t0 + Duration::from_millis(80));

        assert_eq!(store.evict_expired_at(t0 + Duration::from_millis(150)), 1);
        assert!(store.take(1, 3, 0).is_err());
        assert_eq!(store.take(2, 3, 0).unwrap(), b"new");
        assert_eq!(store.evicted_total(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut store = ResponseStore::new(Duration::from_secs(60), 2);
        let t0 = Instant::now();
        store.insert_at(1, 0, b"a".to_vec(), t0);
        store.insert_at(2, 0, b"b".to_vec(), t0 + Duration::from_millis(1));
        store.insert_at(3, 0, b"c".to_vec(), t0 + Duration::from_millis(2));

        assert_eq!(store.len(), 2);
        assert!(store.take(1, 1, 0).is_err());
        assert!(store.take(2, 1, 0).is_ok());
        assert!(store.take(3, 1, 0).is_ok());
    }

    #[test]
    fn test_capacity_keeps_latest_response_per_enclave() {
        let mut store = ResponseStore::new(Duration::from_secs(60), 1);
        let t0 = Instant::now();
        for index in 0..4 {
            store.insert_at(10 + index as u32, index, b"x".to_vec(), t0);
        }
        // Each context's response is still waiting for its caller
        assert_eq!(store.len(), 4);
        assert_eq!(store.evicted_total(), 0);

        // A context's next response supersedes its previous one
        store.insert_at(20, 2, b"y".to_vec(), t0 + Duration::from_millis(1));
        assert_eq!(store.len(), 4);
        assert!(store.take(12, 1, 2).is_err());
        assert_eq!(store.take(20, 1, 2).unwrap(), b"y");
        for index in [0usize, 1, 3] {
            assert!(store.take(10 + index as u32, 1, index).is_ok());
        }
        assert!(store.is_empty());
    }

    #[test]
    fn test_capacity_drops_stale_response_before_live_ones() {
        let mut store = ResponseStore::new(Duration::from_secs(60), 3);
        let t0 = Instant::now();
        store.insert_at(1, 0, b"stale".to_vec(), t0);
        store.insert_at(2, 0, b"live0".to_vec(), t0 + Duration::from_millis(1));
        store.insert_at(3, 1, b"live1".to_vec(), t0 + Duration::from_millis(2));
        store.insert_at(4, 2, b"live2".to_vec(), t0 + Duration::from_millis(3));

        assert_eq!(store.len(), 3);
        assert!(store.take(1, 5, 0).is_err());
        assert!(store.take(2, 5, 0).is_ok());
        assert!(store.take(3, 5, 1).is_ok());
        assert!(store.take(4, 5, 2).is_ok());
    }
}
