// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    container::DirectSegmentAccess,
    entry::{TableEntry, TableKey, Version},
    serializer::{EntrySerializer, HEADER_LENGTH},
    time::TimeoutTimer,
    Slice, UserKey, UserValue,
};
use std::marker::PhantomData;

/// What a [`TableBucketReader`] produces for a matching entry
pub trait ReadMode {
    /// Result of a successful lookup
    type Output;

    /// Whether values need to be read (and checksummed) as well.
    const READ_VALUE: bool;

    /// Builds the output of an entry found at `version`.
    fn output(key: UserKey, value: Option<UserValue>, version: Version) -> Self::Output;
}

/// Only compares and returns keys
pub struct KeyRead;

impl ReadMode for KeyRead {
    type Output = TableKey;

    const READ_VALUE: bool = false;

    fn output(key: UserKey, _: Option<UserValue>, version: Version) -> Self::Output {
        TableKey::versioned(key, version)
    }
}

/// Returns whole entries
pub struct EntryRead;

impl ReadMode for EntryRead {
    type Output = TableEntry;

    const READ_VALUE: bool = true;

    fn output(key: UserKey, value: Option<UserValue>, version: Version) -> Self::Output {
        TableEntry::versioned(key, value.unwrap_or_else(Slice::empty), version)
    }
}

/// Walks a bucket from its head, newest to oldest, looking for a key
///
/// Entries of a bucket share a key hash, but not necessarily a key. The
/// walk stops at the first entry whose key matches (a tombstone counts as
/// absence), or at the end of the chain.
pub struct TableBucketReader<'a, M: ReadMode, F> {
    segment: &'a dyn DirectSegmentAccess,
    serializer: EntrySerializer,
    max_hops: usize,

    /// Resolves the backpointer of the entry at the given offset
    get_backpointer: F,

    _mode: PhantomData<M>,
}

impl<'a, F> TableBucketReader<'a, KeyRead, F>
where
    F: Fn(u64, &TimeoutTimer) -> crate::Result<Option<u64>>,
{
    /// Creates a reader that looks up keys only.
    pub fn key(
        segment: &'a dyn DirectSegmentAccess,
        serializer: EntrySerializer,
        max_hops: usize,
        get_backpointer: F,
    ) -> Self {
        Self::new(segment, serializer, max_hops, get_backpointer)
    }
}

impl<'a, F> TableBucketReader<'a, EntryRead, F>
where
    F: Fn(u64, &TimeoutTimer) -> crate::Result<Option<u64>>,
{
    /// Creates a reader that looks up whole entries.
    pub fn entry(
        segment: &'a dyn DirectSegmentAccess,
        serializer: EntrySerializer,
        max_hops: usize,
        get_backpointer: F,
    ) -> Self {
        Self::new(segment, serializer, max_hops, get_backpointer)
    }
}

impl<'a, M, F> TableBucketReader<'a, M, F>
where
    M: ReadMode,
    F: Fn(u64, &TimeoutTimer) -> crate::Result<Option<u64>>,
{
    /// Creates a reader in any read mode.
    pub fn new(
        segment: &'a dyn DirectSegmentAccess,
        serializer: EntrySerializer,
        max_hops: usize,
        get_backpointer: F,
    ) -> Self {
        Self {
            segment,
            serializer,
            max_hops,
            get_backpointer,
            _mode: PhantomData,
        }
    }

    /// Looks for `key` in the bucket whose head is at `bucket_offset`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an entry cannot be read, the time budget runs
    /// out, or the chain is inconsistent.
    pub fn find(
        &self,
        key: &[u8],
        bucket_offset: u64,
        timer: &TimeoutTimer,
    ) -> crate::Result<Option<M::Output>> {
        let mut offset = bucket_offset;
        let mut hops = 0;

        loop {
            if let Some(found) = self.read_at(key, offset, timer)? {
                return Ok(found);
            }

            hops += 1;

            if hops > self.max_hops {
                log::error!(
                    "Bucket chain at offset {bucket_offset} exceeds {} hops",
                    self.max_hops
                );
                return Err(crate::Error::CorruptedBucket { offset, hops });
            }

            match (self.get_backpointer)(offset, timer)? {
                Some(previous) if previous < offset => offset = previous,
                Some(previous) => {
                    log::error!(
                        "Backpointer of entry at {offset} points forward to {previous}, bucket is corrupted"
                    );
                    return Err(crate::Error::CorruptedBucket { offset, hops });
                }
                None => return Ok(None),
            }
        }
    }

    /// Reads the entry at `offset`.
    ///
    /// Returns `None` if its key does not match, `Some(None)` if it is a
    /// tombstone for `key`.
    #[allow(clippy::option_option)]
    fn read_at(
        &self,
        key: &[u8],
        offset: u64,
        timer: &TimeoutTimer,
    ) -> crate::Result<Option<Option<M::Output>>> {
        let header = self
            .segment
            .read(offset, HEADER_LENGTH, timer.try_remaining()?)?;
        let header = self.serializer.read_header(&header)?;

        if header.key_length as usize != key.len() {
            return Ok(None);
        }

        let length = if M::READ_VALUE {
            header.total_length()
        } else {
            header.value_offset()
        };

        let record = self.segment.read(offset, length, timer.try_remaining()?)?;
        let stored_key = record.slice(header.key_offset()..header.value_offset());

        if stored_key != key {
            return Ok(None);
        }

        if header.is_deletion() {
            return Ok(Some(None));
        }

        let value = if M::READ_VALUE {
            self.serializer.read_entry(&record)?.value
        } else {
            None
        };

        Ok(Some(Some(M::output(stored_key, value, offset))))
    }
}
