// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{container::SegmentId, hash::KeyHash, time::TimeoutTimer, HashSet};
use std::sync::{Condvar, Mutex};

/// Mutual exclusion per (segment, key hash)
///
/// Updates that share a key hash are serialized, updates on disjoint hashes
/// run concurrently. All hashes of one update are taken at once (or not at
/// all), so two updates can never hold parts of each other's hash sets.
#[derive(Default)]
pub struct HashLocks {
    held: Mutex<HashSet<(SegmentId, KeyHash)>>,
    released: Condvar,
}

impl HashLocks {
    /// Blocks until all `hashes` of the segment are free, then takes them.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Timeout`] if the hashes did not become free in time.
    pub fn lock(
        &self,
        segment_id: SegmentId,
        hashes: &[KeyHash],
        timer: &TimeoutTimer,
    ) -> crate::Result<HashLockGuard<'_>> {
        let mut held = self.held.lock().expect("lock is poisoned");

        loop {
            let is_free = hashes
                .iter()
                .all(|hash| !held.contains(&(segment_id, *hash)));

            if is_free {
                held.extend(hashes.iter().map(|hash| (segment_id, *hash)));

                return Ok(HashLockGuard {
                    locks: self,
                    segment_id,
                    hashes: hashes.to_vec(),
                });
            }

            let remaining = timer.try_remaining()?;

            held = self
                .released
                .wait_timeout(held, remaining)
                .expect("lock is poisoned")
                .0;
        }
    }

    #[cfg(test)]
    fn held_count(&self) -> usize {
        self.held.lock().expect("lock is poisoned").len()
    }
}

/// Releases its hashes when dropped
pub struct HashLockGuard<'a> {
    locks: &'a HashLocks,
    segment_id: SegmentId,
    hashes: Vec<KeyHash>,
}

impl Drop for HashLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().expect("lock is poisoned");

        for hash in &self.hashes {
            held.remove(&(self.segment_id, *hash));
        }

        drop(held);
        self.locks.released.notify_all();
    }
}
