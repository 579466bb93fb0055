// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{hash::KeyHash, HashSet, UserKey};

/// Whether a batch holds updates or removals
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BatchKind {
    /// Key-value updates
    Update,

    /// Key removals (tombstones)
    Removal,
}

/// A single key in a [`TableKeyBatch`]
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatchItem {
    /// Raw key
    pub key: UserKey,

    /// Hash of the raw key
    pub hash: KeyHash,

    /// Offset of the item's record, relative to the start of the batch
    pub offset: usize,
}

/// Keys of one put or remove call, in order, together with their hashes and
/// the position of their records inside the serialized batch
///
/// Once the batch has been appended at some segment offset `o`, the entry for
/// item `i` lives at `o + items[i].offset`.
#[derive(Clone, Debug)]
pub struct TableKeyBatch {
    kind: BatchKind,
    items: Vec<BatchItem>,
    length: usize,
}

impl TableKeyBatch {
    /// Creates an empty update batch.
    #[must_use]
    pub fn update() -> Self {
        Self::new(BatchKind::Update)
    }

    /// Creates an empty removal batch.
    #[must_use]
    pub fn removal() -> Self {
        Self::new(BatchKind::Removal)
    }

    fn new(kind: BatchKind) -> Self {
        Self {
            kind,
            items: Vec::new(),
            length: 0,
        }
    }

    /// Appends a key whose record will be `length` bytes long.
    pub fn add(&mut self, key: UserKey, hash: KeyHash, length: usize) {
        self.items.push(BatchItem {
            key,
            hash,
            offset: self.length,
        });
        self.length += length;
    }

    /// Returns the batch kind.
    #[must_use]
    pub fn kind(&self) -> BatchKind {
        self.kind
    }

    /// Returns the items, in insertion order.
    #[must_use]
    pub fn items(&self) -> &[BatchItem] {
        &self.items
    }

    /// Returns the total serialized length of the batch.
    #[must_use]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Returns the number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` if there are no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the distinct key hashes in the batch, in first-seen order.
    #[must_use]
    pub fn hashes(&self) -> Vec<KeyHash> {
        let mut seen = HashSet::default();

        self.items
            .iter()
            .map(|item| item.hash)
            .filter(|hash| seen.insert(*hash))
            .collect()
    }
}
