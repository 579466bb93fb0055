// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{container::SegmentId, hash::KeyHash};
use quick_cache::{sync::Cache as QuickCache, UnitWeighter};

#[derive(Eq, std::hash::Hash, PartialEq)]
struct CacheKey(SegmentId, KeyHash);

/// Cache of bucket head offsets that are known to be persisted in segment
/// attributes
///
/// Only durable values go in here: heads of updates that have not been
/// indexed yet are tracked by the key index itself.
pub struct BucketCache {
    // NOTE: rustc_hash performed best: https://fjall-rs.github.io/post/fjall-2-1
    /// Concurrent cache implementation
    data: QuickCache<CacheKey, u64, UnitWeighter, rustc_hash::FxBuildHasher>,

    /// Capacity in entries
    capacity: u64,
}

impl BucketCache {
    /// Creates a new bucket cache that holds up to `capacity` bucket heads.
    ///
    /// A capacity of 0 disables caching.
    #[must_use]
    pub fn with_capacity(capacity: u64) -> Self {
        use quick_cache::sync::DefaultLifecycle;

        #[allow(clippy::cast_possible_truncation)]
        let estimated_items = capacity.clamp(1, 100_000) as usize;

        #[allow(clippy::default_trait_access)]
        let quick_cache = QuickCache::with(
            estimated_items,
            capacity.max(1),
            UnitWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Self {
            data: quick_cache,
            capacity,
        }
    }

    /// Returns the cache capacity in entries.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the number of cached bucket heads.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if there are no cached bucket heads.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub(crate) fn get(&self, segment_id: SegmentId, hash: KeyHash) -> Option<u64> {
        self.data.get(&CacheKey(segment_id, hash))
    }

    pub(crate) fn insert(&self, segment_id: SegmentId, hash: KeyHash, offset: u64) {
        if self.capacity > 0 {
            self.data.insert(CacheKey(segment_id, hash), offset);
        }
    }

    pub(crate) fn remove(&self, segment_id: SegmentId, hash: KeyHash) {
        self.data.remove(&CacheKey(segment_id, hash));
    }

    /// Drops all cached bucket heads.
    pub fn clear(&self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn bucket_cache_insert_remove() {
        let cache = BucketCache::with_capacity(100);
        let hash = KeyHash::new(1, 2);

        assert_eq!(cache.get(0, hash), None);

        cache.insert(0, hash, 55);
        assert_eq!(cache.get(0, hash), Some(55));
        assert_eq!(cache.get(1, hash), None);

        cache.insert(0, hash, 77);
        assert_eq!(cache.get(0, hash), Some(77));
        assert_eq!(cache.len(), 1);

        cache.remove(0, hash);
        assert_eq!(cache.get(0, hash), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn bucket_cache_disabled() {
        let cache = BucketCache::with_capacity(0);
        cache.insert(0, KeyHash::new(1, 2), 55);
        assert_eq!(cache.get(0, KeyHash::new(1, 2)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn bucket_cache_bounded() {
        let cache = BucketCache::with_capacity(10);

        for idx in 0..1_000 {
            cache.insert(0, KeyHash::new(idx, idx), idx);
        }

        assert!(cache.len() <= 10);
    }
}
