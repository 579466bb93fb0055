// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Bucket index of table segments
//!
//! Every key hash maps to a bucket: a chain of entries, linked newest to
//! oldest through backpointers. The index keeps the head of each bucket and
//! the backpointer of each entry in segment attributes.
//!
//! Links of updates that are not persisted yet are tracked in memory (the
//! "tail"), so a reader always sees every update issued through this index,
//! no matter how far the persisted metadata lags behind.

mod hash_lock;
mod state;

use hash_lock::HashLocks;
use state::{BucketLinks, PendingLinks, SegmentKeyState};

use crate::{
    attributes::{AttributeId, AttributeUpdate, TABLE_INDEX_OFFSET},
    batch::TableKeyBatch,
    cache::BucketCache,
    config::IndexingMode,
    container::{DirectSegmentAccess, SegmentId},
    hash::{KeyHash, KeyHasher},
    serializer::EntrySerializer,
    time::TimeoutTimer,
    HashMap,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

/// Head offsets of buckets; `None` if the bucket does not exist
pub type BucketOffsets = HashMap<KeyHash, Option<u64>>;

/// Authoritative mapping from key hash to bucket head offset, for all
/// segments of a container
pub struct ContainerKeyIndex {
    hasher: KeyHasher,
    serializer: EntrySerializer,
    mode: IndexingMode,
    max_bucket_chain_length: usize,

    cache: BucketCache,
    locks: HashLocks,
    segments: RwLock<HashMap<SegmentId, Arc<SegmentKeyState>>>,

    closed: AtomicBool,
}

impl ContainerKeyIndex {
    /// Creates an empty key index.
    #[must_use]
    pub fn new(
        hasher: KeyHasher,
        serializer: EntrySerializer,
        mode: IndexingMode,
        cache_capacity: u64,
        max_bucket_chain_length: usize,
    ) -> Self {
        Self {
            hasher,
            serializer,
            mode,
            max_bucket_chain_length,
            cache: BucketCache::with_capacity(cache_capacity),
            locks: HashLocks::default(),
            segments: RwLock::default(),
            closed: AtomicBool::default(),
        }
    }

    /// Returns the bucket head cache.
    #[must_use]
    pub fn cache(&self) -> &BucketCache {
        &self.cache
    }

    /// Returns the indexing mode.
    #[must_use]
    pub fn mode(&self) -> IndexingMode {
        self.mode
    }

    fn check_closed(&self) -> crate::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(crate::Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Closes the index, failing all waiting and future operations.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let states = std::mem::take(&mut *self.segments.write().expect("lock is poisoned"));

        for state in states.values() {
            state.watermark.close();
        }

        self.cache.clear();

        log::debug!("Closed key index, dropped state of {} segments", states.len());
    }

    /// Returns the index watermark of a segment, if the index is tracking it.
    #[doc(hidden)]
    #[must_use]
    pub fn watermark(&self, segment_id: SegmentId) -> Option<u64> {
        self.get_state(segment_id).map(|state| state.watermark.get())
    }

    /// Returns the number of (heads, backpointers) held in memory for a segment.
    #[doc(hidden)]
    #[must_use]
    pub fn tail_len(&self, segment_id: SegmentId) -> Option<(usize, usize)> {
        self.get_state(segment_id).map(|state| state.tail_len())
    }

    fn get_state(&self, segment_id: SegmentId) -> Option<Arc<SegmentKeyState>> {
        self.segments
            .read()
            .expect("lock is poisoned")
            .get(&segment_id)
            .cloned()
    }

    /// Returns the state of a segment, recovering it on first access.
    ///
    /// Blocks until the state reflects every entry that was appended to the
    /// segment before it was first accessed.
    fn state_for(
        &self,
        segment: &dyn DirectSegmentAccess,
        timer: &TimeoutTimer,
    ) -> crate::Result<Arc<SegmentKeyState>> {
        self.check_closed()?;

        let segment_id = segment.id();

        let state = match self.get_state(segment_id) {
            Some(state) => state,
            None => self
                .segments
                .write()
                .expect("lock is poisoned")
                .entry(segment_id)
                .or_insert_with(|| Arc::new(SegmentKeyState::new(segment_id)))
                .clone(),
        };

        let target = match state.recovery_offset() {
            Some(offset) => offset,
            None => self.recover(segment, &state, timer)?,
        };

        state.watermark.wait_for(target, timer)?;

        Ok(state)
    }

    fn recover(
        &self,
        segment: &dyn DirectSegmentAccess,
        state: &SegmentKeyState,
        timer: &TimeoutTimer,
    ) -> crate::Result<u64> {
        let _lock = state.lock_recovery();

        if let Some(offset) = state.recovery_offset() {
            return Ok(offset);
        }

        let persisted = segment
            .get_attributes(&[TABLE_INDEX_OFFSET], timer.try_remaining()?)?
            .get(&TABLE_INDEX_OFFSET)
            .copied()
            .unwrap_or_default();

        let length = segment.info().length;

        state.watermark.raise(persisted);

        if length > persisted {
            match self.mode {
                IndexingMode::Inline => {
                    log::debug!(
                        "Segment {} has unindexed data in {persisted}..{length}, indexing it",
                        state.segment_id(),
                    );

                    self.index_range(segment, persisted, length, timer)?;
                    state.watermark.raise(length);
                }
                IndexingMode::Deferred => {
                    log::debug!(
                        "Segment {} has unindexed data in {persisted}..{length}, waiting for indexer",
                        state.segment_id(),
                    );
                }
            }
        }

        state.set_recovered(length);

        Ok(length)
    }

    /// Indexes all entries in `start..end` that are missing from the persisted
    /// bucket metadata.
    fn index_range(
        &self,
        segment: &dyn DirectSegmentAccess,
        start: u64,
        end: u64,
        timer: &TimeoutTimer,
    ) -> crate::Result<()> {
        #[allow(clippy::cast_possible_truncation)]
        let data = segment.read(start, (end - start) as usize, timer.try_remaining()?)?;

        let mut entries = vec![];

        for item in self.serializer.scan(data) {
            let (position, entry) = item?;
            entries.push((start + position as u64, self.hasher.hash(&entry.key)?));
        }

        let mut batch_hashes = vec![];
        let mut seen = crate::HashSet::default();
        for (_, hash) in &entries {
            if seen.insert(*hash) {
                batch_hashes.push(*hash);
            }
        }

        let ids = batch_hashes
            .iter()
            .copied()
            .map(AttributeId::bucket)
            .collect::<Vec<_>>();
        let persisted_heads = segment.get_attributes(&ids, timer.try_remaining()?)?;

        let mut heads = BucketOffsets::default();
        for hash in &batch_hashes {
            let head = persisted_heads.get(&AttributeId::bucket(*hash)).copied();

            // Links of this range may have been persisted partially already
            let head = self.rewind(segment, head, start, timer)?;
            heads.insert(*hash, head);
        }

        let mut updates = vec![];

        for (offset, hash) in &entries {
            let previous = heads.insert(*hash, Some(*offset)).flatten();

            if let Some(previous) = previous {
                updates.push(AttributeUpdate::replace(
                    AttributeId::backpointer(*offset),
                    previous,
                ));
            }
        }

        for (hash, head) in &heads {
            if let Some(head) = head {
                updates.push(AttributeUpdate::replace_if_greater(
                    AttributeId::bucket(*hash),
                    *head,
                ));
            }
        }

        updates.push(AttributeUpdate::replace_if_greater(TABLE_INDEX_OFFSET, end));

        segment.update_attributes(&updates, timer.try_remaining()?)?;

        for hash in &batch_hashes {
            self.cache.remove(segment.id(), *hash);
        }

        log::debug!(
            "Indexed {} entries ({} buckets) of segment {} in {start}..{end}",
            entries.len(),
            batch_hashes.len(),
            segment.id(),
        );

        Ok(())
    }

    /// Follows persisted backpointers from `head` to the newest entry before `before`.
    fn rewind(
        &self,
        segment: &dyn DirectSegmentAccess,
        mut head: Option<u64>,
        before: u64,
        timer: &TimeoutTimer,
    ) -> crate::Result<Option<u64>> {
        let mut hops = 0;

        while let Some(offset) = head {
            if offset < before {
                break;
            }

            let id = AttributeId::backpointer(offset);
            let previous = segment
                .get_attributes(&[id], timer.try_remaining()?)?
                .get(&id)
                .copied();

            hops += 1;

            if previous.is_some_and(|previous| previous >= offset)
                || hops > self.max_bucket_chain_length
            {
                return Err(crate::Error::CorruptedBucket { offset, hops });
            }

            head = previous;
        }

        Ok(head)
    }

    /// Resolves the current bucket head offset of each hash.
    ///
    /// Includes every update that was issued through this index, whether or
    /// not it has been persisted yet.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the index is closed, the time budget runs out, or
    /// the segment cannot be accessed.
    pub fn get_bucket_offsets(
        &self,
        segment: &dyn DirectSegmentAccess,
        hashes: &[KeyHash],
        timer: &TimeoutTimer,
    ) -> crate::Result<BucketOffsets> {
        self.check_closed()?;

        let state = self.state_for(segment, timer)?;
        self.bucket_offsets(segment, &state, hashes, timer)
    }

    fn bucket_offsets(
        &self,
        segment: &dyn DirectSegmentAccess,
        state: &SegmentKeyState,
        hashes: &[KeyHash],
        timer: &TimeoutTimer,
    ) -> crate::Result<BucketOffsets> {
        let segment_id = segment.id();

        let mut result = BucketOffsets::default();
        let mut missing = vec![];

        let generation = {
            let tail = state.lock_tail();

            for hash in hashes {
                if let Some(offset) = tail.heads.get(hash) {
                    result.insert(*hash, Some(*offset));
                } else if let Some(offset) = self.cache.get(segment_id, *hash) {
                    result.insert(*hash, Some(offset));
                } else {
                    missing.push(*hash);
                }
            }

            tail.generation
        };

        if missing.is_empty() {
            return Ok(result);
        }

        let ids = missing
            .iter()
            .copied()
            .map(AttributeId::bucket)
            .collect::<Vec<_>>();
        let values = segment.get_attributes(&ids, timer.try_remaining()?)?;

        let tail = state.lock_tail();

        // NOTE: If the tail changed while reading, what we read may already be outdated
        let is_current = tail.generation == generation;

        for hash in missing {
            let persisted = values.get(&AttributeId::bucket(hash)).copied();

            let offset = if is_current {
                if let Some(offset) = persisted {
                    self.cache.insert(segment_id, hash, offset);
                }
                persisted
            } else {
                tail.heads.get(&hash).copied().or(persisted)
            };

            result.insert(hash, offset);
        }

        Ok(result)
    }

    /// Runs `commit` (the append of the batch), and links the appended entries
    /// into their buckets.
    ///
    /// Returns the offset at which the batch was appended.
    ///
    /// Updates that share a key hash with this batch are blocked until the
    /// batch is linked.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the index is closed, the time budget runs out,
    /// `commit` fails, or the segment metadata cannot be updated. Once `commit`
    /// has succeeded, the appended data stays durable regardless.
    pub fn update<F>(
        &self,
        segment: &dyn DirectSegmentAccess,
        batch: &TableKeyBatch,
        commit: F,
        timer: &TimeoutTimer,
    ) -> crate::Result<u64>
    where
        F: FnOnce(&TimeoutTimer) -> crate::Result<u64>,
    {
        self.check_closed()?;

        let hashes = batch.hashes();
        let _guard = self.locks.lock(segment.id(), &hashes, timer)?;

        let state = self.state_for(segment, timer)?;

        // NOTE: Previous heads must be read before appending; a concurrent reader
        // could otherwise never find entries linked in between
        let current = self.bucket_offsets(segment, &state, &hashes, timer)?;

        let offset = commit(timer)?;

        let links = link_batch(batch, offset, &current);
        state.record(&links, &self.cache);

        log::trace!(
            "Committed {:?} batch of {} entries to segment {} at offset {offset}",
            batch.kind(),
            batch.len(),
            segment.id(),
        );

        if self.mode == IndexingMode::Inline {
            let batch = PendingLinks {
                links,
                offset,
                length: batch.length() as u64,
            };
            self.persist(segment, &state, batch, timer)?;
        }

        Ok(offset)
    }

    /// Persists the links of a batch, together with the links of earlier
    /// batches that failed to persist.
    ///
    /// On failure, all of them stay in memory and are retried by the next
    /// update of the segment.
    fn persist(
        &self,
        segment: &dyn DirectSegmentAccess,
        state: &SegmentKeyState,
        batch: PendingLinks,
        timer: &TimeoutTimer,
    ) -> crate::Result<()> {
        let mut batches = state.take_pending();

        if !batches.is_empty() {
            log::debug!(
                "Retrying to persist bucket links of {} batches of segment {}",
                batches.len(),
                segment.id(),
            );
        }

        let offset = batch.offset;
        batches.push(batch);

        let updates = batches
            .iter()
            .flat_map(|batch| batch.links.attribute_updates())
            .collect::<Vec<_>>();

        let result = timer
            .try_remaining()
            .and_then(|remaining| segment.update_attributes(&updates, remaining));

        if let Err(e) = result {
            log::warn!(
                "Failed to persist bucket links of segment {} at offset {offset}, keeping them in memory: {e:?}",
                segment.id(),
            );
            state.defer_pending(batches);
            return Err(e);
        }

        let mut moved = None;

        for batch in &batches {
            state.persisted(&batch.links, &self.cache);

            moved = state
                .watermark
                .complete(batch.offset, batch.offset + batch.length)
                .or(moved);
        }

        if let Some(watermark) = moved {
            let result = timer.try_remaining().and_then(|remaining| {
                segment.update_attributes(
                    &[AttributeUpdate::replace_if_greater(TABLE_INDEX_OFFSET, watermark)],
                    remaining,
                )
            });

            // NOTE: A lagging index offset only means more work for recovery
            if let Err(e) = result {
                log::warn!(
                    "Failed to persist index offset {watermark} of segment {}: {e:?}",
                    segment.id(),
                );
            } else {
                log::trace!("Segment {} indexed up to {watermark}", segment.id());
            }
        }

        Ok(())
    }

    /// Called by the indexer after it persisted all bucket links below
    /// `last_indexed_offset`.
    ///
    /// `None` means the segment is no longer of interest to the indexer. Its
    /// in-memory state is dropped and rebuilt from segment metadata on next
    /// access.
    pub fn notify_index_offset_changed(
        &self,
        segment_id: SegmentId,
        last_indexed_offset: Option<u64>,
    ) {
        match last_indexed_offset {
            Some(offset) => {
                if let Some(state) = self.get_state(segment_id) {
                    state.watermark.raise(offset);
                    let pruned = state.prune(offset);

                    log::trace!(
                        "Segment {segment_id} indexed up to {offset}, dropped {pruned} in-memory bucket heads"
                    );
                }
            }
            None => {
                let removed = self
                    .segments
                    .write()
                    .expect("lock is poisoned")
                    .remove(&segment_id);

                if removed.is_some() {
                    log::debug!("Dropped in-memory index state of segment {segment_id}");
                }
            }
        }
    }

    /// Returns the offset of the entry that precedes the entry at `offset`
    /// in its bucket.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the index is closed, the time budget runs out, or
    /// the segment cannot be accessed.
    pub fn get_backpointer_offset(
        &self,
        segment: &dyn DirectSegmentAccess,
        offset: u64,
        timer: &TimeoutTimer,
    ) -> crate::Result<Option<u64>> {
        self.check_closed()?;

        let state = self.state_for(segment, timer)?;

        if let Some(previous) = state.tail_backpointer(offset) {
            return Ok(previous);
        }

        let id = AttributeId::backpointer(offset);

        Ok(segment
            .get_attributes(&[id], timer.try_remaining()?)?
            .get(&id)
            .copied())
    }
}

/// Links the entries of a batch appended at `batch_offset` to the current
/// bucket heads.
///
/// Entries of the same bucket within one batch are chained in batch order,
/// so the last one becomes the new head.
fn link_batch(batch: &TableKeyBatch, batch_offset: u64, current: &BucketOffsets) -> BucketLinks {
    let mut heads = current.clone();
    let mut links = BucketLinks::default();

    for item in batch.items() {
        let offset = batch_offset + item.offset as u64;
        let previous = heads.insert(item.hash, Some(offset)).flatten();
        links.backpointers.push((offset, previous));
    }

    links.heads = batch
        .hashes()
        .into_iter()
        .filter_map(|hash| heads.get(&hash).copied().flatten().map(|head| (hash, head)))
        .collect();

    links
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        attributes::initial_table_attributes,
        container::{MemorySegmentContainer, SegmentContainer},
        entry::TableEntry,
    };
    use std::time::Duration;
    use test_log::test;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn timer() -> TimeoutTimer {
        TimeoutTimer::new(TIMEOUT)
    }

    fn index(mode: IndexingMode) -> ContainerKeyIndex {
        ContainerKeyIndex::new(
            KeyHasher::sha256(),
            EntrySerializer,
            mode,
            1_000,
            1_000,
        )
    }

    fn batch_of(hasher: &KeyHasher, entries: &[TableEntry]) -> crate::Result<TableKeyBatch> {
        let mut batch = TableKeyBatch::update();
        for entry in entries {
            batch.add(
                entry.key.key.clone(),
                hasher.hash(&entry.key.key)?,
                EntrySerializer.update_length(entry),
            );
        }
        Ok(batch)
    }

    fn put(
        index: &ContainerKeyIndex,
        segment: &dyn DirectSegmentAccess,
        entries: &[TableEntry],
    ) -> crate::Result<u64> {
        let batch = batch_of(&KeyHasher::sha256(), entries)?;
        let data = EntrySerializer.serialize_update(entries);

        index.update(
            segment,
            &batch,
            |timer| segment.append(&data, None, timer.try_remaining()?),
            &timer(),
        )
    }

    fn segment(container: &MemorySegmentContainer) -> crate::Result<Arc<dyn DirectSegmentAccess>> {
        if container.segment("table").is_none() {
            container.create_segment("table", &initial_table_attributes(), TIMEOUT)?;
        }
        container.for_segment("table", TIMEOUT)
    }

    #[test]
    fn link_batch_chains_repeated_hashes() {
        let a = KeyHash::new(1, 1);
        let b = KeyHash::new(2, 2);

        let mut batch = TableKeyBatch::update();
        batch.add("a".into(), a, 10);
        batch.add("b".into(), b, 10);
        batch.add("a".into(), a, 10);

        let mut current = BucketOffsets::default();
        current.insert(a, Some(5));
        current.insert(b, None);

        let links = link_batch(&batch, 100, &current);

        assert_eq!(links.heads, [(a, 120), (b, 110)]);
        assert_eq!(
            links.backpointers,
            [(100, Some(5)), (110, None), (120, Some(100))]
        );
    }

    #[test]
    fn key_index_inline_update() -> crate::Result<()> {
        let container = MemorySegmentContainer::new(0);
        let segment = segment(&container)?;
        let index = index(IndexingMode::Inline);

        let hash = KeyHasher::sha256().hash(b"a")?;

        let first = put(&index, &*segment, &[TableEntry::new("a", "1")])?;
        let second = put(&index, &*segment, &[TableEntry::new("a", "2")])?;
        assert!(second > first);

        let offsets = index.get_bucket_offsets(&*segment, &[hash], &timer())?;
        assert_eq!(offsets.get(&hash), Some(&Some(second)));

        assert_eq!(
            index.get_backpointer_offset(&*segment, second, &timer())?,
            Some(first)
        );
        assert_eq!(index.get_backpointer_offset(&*segment, first, &timer())?, None);

        // Everything is persisted
        assert_eq!(index.tail_len(segment.id()), Some((0, 0)));
        assert_eq!(index.watermark(segment.id()), Some(segment.info().length));

        let attributes = container.segment("table").unwrap().attributes();
        assert_eq!(attributes.get(&AttributeId::bucket(hash)), Some(&second));
        assert_eq!(
            attributes.get(&AttributeId::backpointer(second)),
            Some(&first)
        );
        assert_eq!(
            attributes.get(&TABLE_INDEX_OFFSET),
            Some(&segment.info().length)
        );

        Ok(())
    }

    #[test]
    fn key_index_inline_retries_failed_persist() -> crate::Result<()> {
        let container = MemorySegmentContainer::new(0);
        let segment = segment(&container)?;
        let index = index(IndexingMode::Inline);

        put(&index, &*segment, &[TableEntry::new("warmup", "0")])?;
        let indexed = segment.info().length;

        let hash = KeyHasher::sha256().hash(b"a")?;
        let entries = [TableEntry::new("a", "1")];
        let batch = batch_of(&KeyHasher::sha256(), &entries)?;
        let data = EntrySerializer.serialize_update(&entries);

        // The append succeeds, the time budget runs out right after
        let result = index.update(
            &*segment,
            &batch,
            |_| {
                let offset = segment.append(&data, None, TIMEOUT)?;
                std::thread::sleep(Duration::from_millis(300));
                Ok(offset)
            },
            &TimeoutTimer::new(Duration::from_millis(100)),
        );
        assert!(matches!(result, Err(crate::Error::Timeout)));

        let failed = indexed;
        let state = index.get_state(segment.id()).unwrap();
        assert_eq!(state.pending_len(), 1);
        assert_eq!(index.watermark(segment.id()), Some(indexed));
        assert_eq!(index.tail_len(segment.id()), Some((1, 1)));

        // Still visible through the tail
        let offsets = index.get_bucket_offsets(&*segment, &[hash], &timer())?;
        assert_eq!(offsets.get(&hash), Some(&Some(failed)));

        for i in 0..20 {
            put(&index, &*segment, &[TableEntry::new(format!("k{i}"), "v")])?;
        }

        let length = segment.info().length;
        assert_eq!(state.pending_len(), 0);
        assert_eq!(index.tail_len(segment.id()), Some((0, 0)));
        assert_eq!(index.watermark(segment.id()), Some(length));

        let attributes = container.segment("table").unwrap().attributes();
        assert_eq!(attributes.get(&AttributeId::bucket(hash)), Some(&failed));
        assert_eq!(attributes.get(&TABLE_INDEX_OFFSET), Some(&length));

        Ok(())
    }

    #[test]
    fn key_index_cache_avoids_attribute_reads() -> crate::Result<()> {
        let container = MemorySegmentContainer::new(0);
        let segment = segment(&container)?;
        let memory_segment = container.segment("table").unwrap();
        let index = index(IndexingMode::Inline);

        put(&index, &*segment, &[TableEntry::new("a", "1")])?;
        let hash = KeyHasher::sha256().hash(b"a")?;

        let reads = memory_segment.attribute_read_count();
        for _ in 0..10 {
            index.get_bucket_offsets(&*segment, &[hash], &timer())?;
        }
        assert_eq!(memory_segment.attribute_read_count(), reads);

        Ok(())
    }

    #[test]
    fn key_index_deferred_tail() -> crate::Result<()> {
        let container = MemorySegmentContainer::new(0);
        let segment = segment(&container)?;
        let index = index(IndexingMode::Deferred);

        let hash = KeyHasher::sha256().hash(b"a")?;

        let first = put(&index, &*segment, &[TableEntry::new("a", "1")])?;
        let second = put(&index, &*segment, &[TableEntry::new("a", "2")])?;

        // Nothing persisted, but the tail knows
        let attributes = container.segment("table").unwrap().attributes();
        assert_eq!(attributes.get(&AttributeId::bucket(hash)), None);

        let offsets = index.get_bucket_offsets(&*segment, &[hash], &timer())?;
        assert_eq!(offsets.get(&hash), Some(&Some(second)));
        assert_eq!(
            index.get_backpointer_offset(&*segment, second, &timer())?,
            Some(first)
        );
        assert_eq!(index.tail_len(segment.id()), Some((1, 2)));

        // Simulate the indexer
        segment.update_attributes(
            &[
                AttributeUpdate::replace_if_greater(AttributeId::bucket(hash), second),
                AttributeUpdate::replace(AttributeId::backpointer(second), first),
                AttributeUpdate::replace_if_greater(TABLE_INDEX_OFFSET, segment.info().length),
            ],
            TIMEOUT,
        )?;
        index.notify_index_offset_changed(segment.id(), Some(segment.info().length));

        assert_eq!(index.tail_len(segment.id()), Some((0, 0)));
        assert_eq!(index.watermark(segment.id()), Some(segment.info().length));

        let offsets = index.get_bucket_offsets(&*segment, &[hash], &timer())?;
        assert_eq!(offsets.get(&hash), Some(&Some(second)));
        assert_eq!(
            index.get_backpointer_offset(&*segment, second, &timer())?,
            Some(first)
        );

        Ok(())
    }

    #[test]
    fn key_index_deferred_waits_for_indexer() -> crate::Result<()> {
        let container = MemorySegmentContainer::new(0);
        let segment = segment(&container)?;

        // Data appended by someone else, never indexed
        segment.append(
            &EntrySerializer.serialize_update(&[TableEntry::new("a", "1")]),
            None,
            TIMEOUT,
        )?;

        let index = index(IndexingMode::Deferred);
        let hash = KeyHasher::sha256().hash(b"a")?;

        let result = index.get_bucket_offsets(
            &*segment,
            &[hash],
            &TimeoutTimer::new(Duration::from_millis(20)),
        );
        assert!(matches!(result, Err(crate::Error::Timeout)));

        segment.update_attributes(
            &[
                AttributeUpdate::replace(AttributeId::bucket(hash), 0),
                AttributeUpdate::replace(TABLE_INDEX_OFFSET, segment.info().length),
            ],
            TIMEOUT,
        )?;
        index.notify_index_offset_changed(segment.id(), Some(segment.info().length));

        let offsets = index.get_bucket_offsets(&*segment, &[hash], &timer())?;
        assert_eq!(offsets.get(&hash), Some(&Some(0)));

        Ok(())
    }

    #[test]
    fn key_index_inline_recovery() -> crate::Result<()> {
        let container = MemorySegmentContainer::new(0);
        let segment = segment(&container)?;

        let a = KeyHasher::sha256().hash(b"a")?;
        let b = KeyHasher::sha256().hash(b"b")?;

        let first = {
            let index = index(IndexingMode::Inline);
            put(&index, &*segment, &[TableEntry::new("a", "1")])?
        };

        // Appended, but never indexed (e.g. crash before persisting)
        let second = segment.append(
            &EntrySerializer.serialize_update(&[
                TableEntry::new("a", "2"),
                TableEntry::new("b", "3"),
            ]),
            None,
            TIMEOUT,
        )?;

        let index = index(IndexingMode::Inline);
        let offsets = index.get_bucket_offsets(&*segment, &[a, b], &timer())?;

        let b_offset =
            second + EntrySerializer.update_length(&TableEntry::new("a", "2")) as u64;
        assert_eq!(offsets.get(&a), Some(&Some(second)));
        assert_eq!(offsets.get(&b), Some(&Some(b_offset)));
        assert_eq!(
            index.get_backpointer_offset(&*segment, second, &timer())?,
            Some(first)
        );
        assert_eq!(
            index.get_backpointer_offset(&*segment, b_offset, &timer())?,
            None
        );

        let attributes = container.segment("table").unwrap().attributes();
        assert_eq!(
            attributes.get(&TABLE_INDEX_OFFSET),
            Some(&segment.info().length)
        );

        Ok(())
    }

    #[test]
    fn key_index_recovery_after_partial_persist() -> crate::Result<()> {
        let container = MemorySegmentContainer::new(0);
        let segment = segment(&container)?;
        let a = KeyHasher::sha256().hash(b"a")?;

        let first = put(
            &index(IndexingMode::Inline),
            &*segment,
            &[TableEntry::new("a", "1")],
        )?;
        let persisted = segment.info().length;

        // Links persisted, index offset not
        let second = put(
            &index(IndexingMode::Inline),
            &*segment,
            &[TableEntry::new("a", "2")],
        )?;
        segment.update_attributes(
            &[AttributeUpdate::replace(TABLE_INDEX_OFFSET, persisted)],
            TIMEOUT,
        )?;

        let index = index(IndexingMode::Inline);
        let offsets = index.get_bucket_offsets(&*segment, &[a], &timer())?;
        assert_eq!(offsets.get(&a), Some(&Some(second)));
        assert_eq!(
            index.get_backpointer_offset(&*segment, second, &timer())?,
            Some(first)
        );

        Ok(())
    }

    #[test]
    fn key_index_sentinel_drops_state() -> crate::Result<()> {
        let container = MemorySegmentContainer::new(0);
        let segment = segment(&container)?;
        let index = index(IndexingMode::Inline);

        put(&index, &*segment, &[TableEntry::new("a", "1")])?;
        assert!(index.watermark(segment.id()).is_some());

        index.notify_index_offset_changed(segment.id(), None);
        assert!(index.watermark(segment.id()).is_none());

        let hash = KeyHasher::sha256().hash(b"a")?;
        let offsets = index.get_bucket_offsets(&*segment, &[hash], &timer())?;
        assert_eq!(offsets.get(&hash), Some(&Some(0)));

        Ok(())
    }

    #[test]
    fn key_index_closed() -> crate::Result<()> {
        let container = MemorySegmentContainer::new(0);
        let segment = segment(&container)?;
        let index = index(IndexingMode::Inline);

        put(&index, &*segment, &[TableEntry::new("a", "1")])?;
        assert!(!index.cache().is_empty());

        index.close();
        index.close();
        assert!(index.cache().is_empty());

        let length = segment.info().length;

        assert!(matches!(
            index.get_bucket_offsets(&*segment, &[KeyHash::new(1, 1)], &timer()),
            Err(crate::Error::Closed)
        ));
        assert!(matches!(
            put(&index, &*segment, &[TableEntry::new("a", "1")]),
            Err(crate::Error::Closed)
        ));
        assert_eq!(segment.info().length, length);

        Ok(())
    }
}
