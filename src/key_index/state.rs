// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    attributes::{AttributeId, AttributeUpdate},
    cache::BucketCache,
    container::SegmentId,
    hash::KeyHash,
    time::TimeoutTimer,
    HashMap,
};
use crossbeam_skiplist::SkipMap;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex, MutexGuard,
    },
};

struct WatermarkInner {
    offset: u64,

    /// Batches that finished indexing but are not contiguous with `offset` yet,
    /// start -> end
    completed: BTreeMap<u64, u64>,

    closed: bool,
}

/// Highest segment offset whose effects are reflected in the persisted bucket
/// metadata
///
/// Only ever moves forward. Readers block on it until it reaches the offset
/// they need.
pub struct Watermark {
    inner: Mutex<WatermarkInner>,
    changed: Condvar,
}

impl Watermark {
    fn new(offset: u64) -> Self {
        Self {
            inner: Mutex::new(WatermarkInner {
                offset,
                completed: BTreeMap::new(),
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Returns the current watermark.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.inner.lock().expect("lock is poisoned").offset
    }

    /// Raises the watermark to at least `offset`.
    ///
    /// Returns `true` if the watermark moved.
    pub fn raise(&self, offset: u64) -> bool {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        if offset <= inner.offset {
            return false;
        }

        inner.offset = offset;
        Self::merge_completed(&mut inner);

        drop(inner);
        self.changed.notify_all();

        true
    }

    /// Marks the range `start..end` as indexed.
    ///
    /// The watermark only advances once every range below it has completed.
    /// Returns the new watermark if it moved.
    pub fn complete(&self, start: u64, end: u64) -> Option<u64> {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        if end <= inner.offset {
            return None;
        }

        let before = inner.offset;

        inner
            .completed
            .entry(start)
            .and_modify(|current| *current = (*current).max(end))
            .or_insert(end);
        Self::merge_completed(&mut inner);

        let after = inner.offset;
        drop(inner);

        if after > before {
            self.changed.notify_all();
            Some(after)
        } else {
            None
        }
    }

    /// Folds every completed range that starts at or below the watermark into it.
    fn merge_completed(inner: &mut WatermarkInner) {
        while let Some(entry) = inner.completed.first_entry() {
            if *entry.key() > inner.offset {
                break;
            }

            let end = entry.remove();
            inner.offset = inner.offset.max(end);
        }
    }

    /// Blocks until the watermark reaches `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Timeout`] if the time budget runs out first, or
    /// [`crate::Error::Closed`] if the index is closed while waiting.
    pub fn wait_for(&self, offset: u64, timer: &TimeoutTimer) -> crate::Result<()> {
        let mut inner = self.inner.lock().expect("lock is poisoned");

        loop {
            if inner.closed {
                return Err(crate::Error::Closed);
            }

            if inner.offset >= offset {
                return Ok(());
            }

            let remaining = timer.try_remaining()?;

            log::trace!(
                "Waiting for index watermark {} to reach {offset}",
                inner.offset
            );

            inner = self
                .changed
                .wait_timeout(inner, remaining)
                .expect("lock is poisoned")
                .0;
        }
    }

    /// Fails all current and future waiters.
    pub fn close(&self) {
        self.inner.lock().expect("lock is poisoned").closed = true;
        self.changed.notify_all();
    }
}

/// Links of one batch that are not (yet) reflected in segment attributes
pub struct Tail {
    /// Latest bucket head per key hash
    pub heads: HashMap<KeyHash, u64>,

    /// Bumped whenever heads change, so a reader can tell whether the
    /// attributes it just read may already be outdated
    pub generation: u64,
}

/// New bucket links produced by one update
#[derive(Debug, Default, Eq, PartialEq)]
pub struct BucketLinks {
    /// New bucket head per key hash
    pub heads: Vec<(KeyHash, u64)>,

    /// Entry offset -> previous head of its bucket
    pub backpointers: Vec<(u64, Option<u64>)>,
}

impl BucketLinks {
    /// Attribute updates that persist these links.
    ///
    /// Heads only ever move forward, so they may be applied in any order
    /// relative to links of other batches.
    pub fn attribute_updates(&self) -> impl Iterator<Item = AttributeUpdate> + '_ {
        self.heads
            .iter()
            .map(|(hash, head)| {
                AttributeUpdate::replace_if_greater(AttributeId::bucket(*hash), *head)
            })
            .chain(self.backpointers.iter().filter_map(|(entry, previous)| {
                previous.map(|previous| {
                    AttributeUpdate::replace(AttributeId::backpointer(*entry), previous)
                })
            }))
    }
}

/// Links of an appended batch that still have to be persisted
#[derive(Debug)]
pub struct PendingLinks {
    pub links: BucketLinks,

    /// Segment offset the batch was appended at
    pub offset: u64,

    /// Serialized length of the batch
    pub length: u64,
}

/// In-memory index state of a single segment
pub struct SegmentKeyState {
    segment_id: SegmentId,

    /// Persisted index progress
    pub watermark: Watermark,

    tail: Mutex<Tail>,

    /// Backpointers of entries in the tail
    backpointers: SkipMap<u64, Option<u64>>,

    /// Batches whose links failed to persist, retried by the next update
    pending: Mutex<Vec<PendingLinks>>,

    /// Segment length when this state was created, which readers need the
    /// watermark to reach before the tail can be trusted
    ///
    /// `u64::MAX` until recovery has run.
    recovery_offset: AtomicU64,

    recovery: Mutex<()>,
}

impl SegmentKeyState {
    pub fn new(segment_id: SegmentId) -> Self {
        Self {
            segment_id,
            watermark: Watermark::new(0),
            tail: Mutex::new(Tail {
                heads: HashMap::default(),
                generation: 0,
            }),
            backpointers: SkipMap::new(),
            pending: Mutex::default(),
            recovery_offset: AtomicU64::new(u64::MAX),
            recovery: Mutex::new(()),
        }
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn lock_tail(&self) -> MutexGuard<'_, Tail> {
        self.tail.lock().expect("lock is poisoned")
    }

    /// Serializes recovery of this state.
    pub fn lock_recovery(&self) -> MutexGuard<'_, ()> {
        self.recovery.lock().expect("lock is poisoned")
    }

    pub fn recovery_offset(&self) -> Option<u64> {
        match self.recovery_offset.load(Ordering::Acquire) {
            u64::MAX => None,
            offset => Some(offset),
        }
    }

    pub fn set_recovered(&self, offset: u64) {
        self.recovery_offset.store(offset, Ordering::Release);
    }

    /// Looks up the backpointer of an entry that is still in the tail.
    ///
    /// Returns `None` if the entry is not in the tail; `Some(None)` if it is,
    /// and it has no predecessor.
    pub fn tail_backpointer(&self, offset: u64) -> Option<Option<u64>> {
        self.backpointers.get(&offset).map(|entry| *entry.value())
    }

    pub fn tail_len(&self) -> (usize, usize) {
        (self.lock_tail().heads.len(), self.backpointers.len())
    }

    /// Takes all batches whose links still have to be persisted.
    pub fn take_pending(&self) -> Vec<PendingLinks> {
        std::mem::take(&mut *self.pending.lock().expect("lock is poisoned"))
    }

    /// Keeps batches whose links failed to persist, so they can be retried.
    pub fn defer_pending(&self, batches: Vec<PendingLinks>) {
        self.pending
            .lock()
            .expect("lock is poisoned")
            .extend(batches);
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().expect("lock is poisoned").len()
    }

    /// Adds freshly committed links to the tail.
    ///
    /// Cached heads of the affected hashes are dropped, and any concurrent
    /// reader is prevented from caching what it read before this point.
    pub fn record(&self, links: &BucketLinks, cache: &BucketCache) {
        for (offset, previous) in &links.backpointers {
            self.backpointers.insert(*offset, *previous);
        }

        let mut tail = self.lock_tail();

        for (hash, head) in &links.heads {
            tail.heads.insert(*hash, *head);
            cache.remove(self.segment_id, *hash);
        }

        tail.generation += 1;
    }

    /// Removes links from the tail once they are persisted, caching the
    /// persisted heads.
    pub fn persisted(&self, links: &BucketLinks, cache: &BucketCache) {
        let mut tail = self.lock_tail();

        for (hash, head) in &links.heads {
            if tail.heads.get(hash) == Some(head) {
                tail.heads.remove(hash);
                cache.insert(self.segment_id, *hash, *head);
            }
        }

        drop(tail);

        for (offset, _) in &links.backpointers {
            self.backpointers.remove(offset);
        }
    }

    /// Drops all tail links below `offset`, which the indexer has persisted.
    ///
    /// Returns the number of heads dropped.
    pub fn prune(&self, offset: u64) -> usize {
        let mut tail = self.lock_tail();

        let before = tail.heads.len();
        tail.heads.retain(|_, head| *head >= offset);
        let pruned = before - tail.heads.len();

        tail.generation += 1;
        drop(tail);

        while let Some(entry) = self.backpointers.front() {
            if *entry.key() >= offset {
                break;
            }
            entry.remove();
        }

        pruned
    }
}
