// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    container::SegmentContainer, hash::KeyHasher, serializer::MAX_SERIALIZATION_LENGTH,
    TableExtension,
};
use std::sync::Arc;

/// Who persists the bucket links of new entries
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum IndexingMode {
    /// Every update persists its own links before returning
    #[default]
    Inline,

    /// Links are kept in memory until an external indexer persists them
    /// and reports its progress through a [`crate::TableWriterConnector`]
    Deferred,
}

/// Table extension configuration builder
pub struct Config {
    /// Segment container the tables live in
    #[doc(hidden)]
    pub container: Arc<dyn SegmentContainer>,

    /// Key hash function
    pub hasher: KeyHasher,

    /// Maximum number of cached bucket heads
    pub cache_capacity: u64,

    /// Maximum serialized length of a single put or remove call
    pub max_batch_size: usize,

    /// Maximum number of hops a bucket walk may take before the bucket is
    /// considered corrupted
    pub max_bucket_chain_length: usize,

    /// Who persists bucket links
    pub indexing_mode: IndexingMode,
}

impl Config {
    /// Initializes a new config for tables in the given container.
    pub fn new(container: Arc<dyn SegmentContainer>) -> Self {
        Self {
            container,
            hasher: KeyHasher::default(),
            cache_capacity: 1_000_000,
            max_batch_size: 32 * MAX_SERIALIZATION_LENGTH,
            max_bucket_chain_length: 1_048_576,
            indexing_mode: IndexingMode::Inline,
        }
    }

    /// Sets the key hash function.
    ///
    /// Defaults to the first 16 bytes of SHA-256.
    ///
    /// Changing the hash function of existing tables makes their data unreachable.
    #[must_use]
    pub fn hasher(mut self, hasher: KeyHasher) -> Self {
        self.hasher = hasher;
        self
    }

    /// Sets the number of bucket heads to cache.
    ///
    /// 0 disables caching.
    ///
    /// Defaults to 1 million.
    #[must_use]
    pub fn cache_capacity(mut self, n: u64) -> Self {
        self.cache_capacity = n;
        self
    }

    /// Sets the maximum serialized length of a single put or remove call.
    ///
    /// Defaults to 32 MiB.
    ///
    /// # Panics
    ///
    /// Panics if the size is smaller than a single maximum-sized entry.
    #[must_use]
    pub fn max_batch_size(mut self, bytes: usize) -> Self {
        assert!(bytes >= MAX_SERIALIZATION_LENGTH);

        self.max_batch_size = bytes;
        self
    }

    /// Sets the maximum bucket chain length.
    ///
    /// A bucket walk that takes more hops fails with
    /// [`crate::Error::CorruptedBucket`].
    ///
    /// Defaults to 1048576.
    ///
    /// # Panics
    ///
    /// Panics if the length is 0.
    #[must_use]
    pub fn max_bucket_chain_length(mut self, n: usize) -> Self {
        assert!(n > 0);

        self.max_bucket_chain_length = n;
        self
    }

    /// Sets the indexing mode.
    ///
    /// Defaults to [`IndexingMode::Inline`].
    #[must_use]
    pub fn indexing_mode(mut self, mode: IndexingMode) -> Self {
        self.indexing_mode = mode;
        self
    }

    /// Opens a table extension using the config.
    #[must_use]
    pub fn open(self) -> TableExtension {
        TableExtension::new(self)
    }
}
