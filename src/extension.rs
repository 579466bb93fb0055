// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    attributes::{initial_table_attributes, TABLE_INDEX_OFFSET},
    batch::TableKeyBatch,
    bucket_reader::{EntryRead, KeyRead, ReadMode, TableBucketReader},
    container::{DirectSegmentAccess, SegmentContainer, SegmentInfo},
    entry::{TableEntry, TableKey, Version},
    hash::{KeyHash, KeyHasher},
    key_index::ContainerKeyIndex,
    serializer::EntrySerializer,
    time::TimeoutTimer,
    Config, HashSet,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// Shared state of a [`TableExtension`]
#[doc(hidden)]
#[allow(clippy::module_name_repetitions)]
pub struct TableExtensionInner {
    container: Arc<dyn SegmentContainer>,
    hasher: KeyHasher,
    serializer: EntrySerializer,
    key_index: Arc<ContainerKeyIndex>,
    max_batch_size: usize,
    max_bucket_chain_length: usize,
    closed: AtomicBool,
}

/// Key-value tables on top of the segments of a container
///
/// Every table is a single segment. Entries are appended to the segment, and
/// looked up through a hash index that lives in the segment's attributes.
///
/// The extension is cheap to clone and can be shared between threads.
#[derive(Clone)]
pub struct TableExtension(#[doc(hidden)] pub Arc<TableExtensionInner>);

impl std::ops::Deref for TableExtension {
    type Target = TableExtensionInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TableExtension {
    pub(crate) fn new(config: Config) -> Self {
        let serializer = EntrySerializer;

        let key_index = ContainerKeyIndex::new(
            config.hasher.clone(),
            serializer,
            config.indexing_mode,
            config.cache_capacity,
            config.max_bucket_chain_length,
        );

        Self(Arc::new(TableExtensionInner {
            container: config.container,
            hasher: config.hasher,
            serializer,
            key_index: Arc::new(key_index),
            max_batch_size: config.max_batch_size,
            max_bucket_chain_length: config.max_bucket_chain_length,
            closed: AtomicBool::default(),
        }))
    }

    fn check_closed(&self) -> crate::Result<()> {
        if self.is_closed() {
            Err(crate::Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Returns `true` if the extension has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the key index.
    #[doc(hidden)]
    #[must_use]
    pub fn key_index(&self) -> &ContainerKeyIndex {
        &self.key_index
    }

    /// Prepares the extension for use.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the extension is closed.
    pub fn initialize(&self) -> crate::Result<()> {
        self.check_closed()?;

        log::debug!(
            "Initialized table extension for container {} ({:?} indexing, bucket cache of {} entries)",
            self.container.id(),
            self.key_index.mode(),
            self.key_index.cache().capacity(),
        );

        Ok(())
    }

    /// Closes the extension.
    ///
    /// All further operations fail with [`crate::Error::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.key_index.close();

        log::debug!("Closed table extension for container {}", self.container.id());
    }

    /// Creates a new, empty table segment.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the extension is closed, the segment already
    /// exists, or the container fails.
    pub fn create_segment(&self, segment_name: &str, timeout: Duration) -> crate::Result<()> {
        self.check_closed()?;

        self.container
            .create_segment(segment_name, &initial_table_attributes(), timeout)?;

        log::debug!("Created table segment {segment_name:?}");

        Ok(())
    }

    /// Deletes a table segment with all of its entries.
    ///
    /// Deleting only if the table is empty is not supported.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the extension is closed, the segment does not
    /// exist, or the container fails.
    pub fn delete_segment(
        &self,
        segment_name: &str,
        must_be_empty: bool,
        timeout: Duration,
    ) -> crate::Result<()> {
        if must_be_empty {
            return Err(crate::Error::Unsupported("delete_segment(must_be_empty)"));
        }

        self.check_closed()?;

        let timer = TimeoutTimer::new(timeout);
        let segment_id = self
            .container
            .for_segment(segment_name, timer.try_remaining()?)?
            .id();

        self.container
            .delete_segment(segment_name, timer.try_remaining()?)?;
        self.key_index.notify_index_offset_changed(segment_id, None);

        log::debug!("Deleted table segment {segment_name:?}");

        Ok(())
    }

    /// Not supported for table segments.
    ///
    /// # Errors
    ///
    /// Always returns `Err`.
    pub fn merge_segments(
        &self,
        _target_segment_name: &str,
        _source_segment_name: &str,
        _timeout: Duration,
    ) -> crate::Result<()> {
        self.check_closed()?;
        Err(crate::Error::Unsupported("merge_segments"))
    }

    /// Not supported for table segments.
    ///
    /// # Errors
    ///
    /// Always returns `Err`.
    pub fn seal_segment(&self, _segment_name: &str, _timeout: Duration) -> crate::Result<()> {
        self.check_closed()?;
        Err(crate::Error::Unsupported("seal_segment"))
    }

    /// Inserts or overwrites entries.
    ///
    /// All entries are appended together, in order; if the same key appears
    /// more than once, the last occurrence wins.
    ///
    /// Returns the version of each entry, in input order.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the extension is closed, the batch is too large,
    /// the time budget runs out, or the container fails.
    pub fn put(
        &self,
        segment_name: &str,
        entries: &[TableEntry],
        timeout: Duration,
    ) -> crate::Result<Vec<Version>> {
        self.check_closed()?;

        let timer = TimeoutTimer::new(timeout);
        let segment = self
            .container
            .for_segment(segment_name, timer.try_remaining()?)?;

        if entries.is_empty() {
            return Ok(vec![]);
        }

        let batch = self.build_update_batch(entries)?;

        let offset = self.key_index.update(
            &*segment,
            &batch,
            |timer| {
                let data = self.serializer.serialize_update(entries);
                debug_assert_eq!(data.len(), batch.length());
                segment.append(&data, None, timer.try_remaining()?)
            },
            &timer,
        )?;

        Ok(batch
            .items()
            .iter()
            .map(|item| offset + item.offset as u64)
            .collect())
    }

    /// Removes keys.
    ///
    /// Removing a key that does not exist is not an error.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the extension is closed, the batch is too large,
    /// the time budget runs out, or the container fails.
    pub fn remove(
        &self,
        segment_name: &str,
        keys: &[TableKey],
        timeout: Duration,
    ) -> crate::Result<()> {
        self.check_closed()?;

        let timer = TimeoutTimer::new(timeout);
        let segment = self
            .container
            .for_segment(segment_name, timer.try_remaining()?)?;

        if keys.is_empty() {
            return Ok(());
        }

        let batch = self.build_removal_batch(keys)?;

        self.key_index.update(
            &*segment,
            &batch,
            |timer| {
                let data = self.serializer.serialize_removal(keys);
                debug_assert_eq!(data.len(), batch.length());
                segment.append(&data, None, timer.try_remaining()?)
            },
            &timer,
        )?;

        Ok(())
    }

    /// Looks up the latest entry of each key.
    ///
    /// Results are in input order; `None` for keys that do not exist.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the extension is closed, the time budget runs
    /// out, or the container fails.
    pub fn get<K: AsRef<[u8]>>(
        &self,
        segment_name: &str,
        keys: &[K],
        timeout: Duration,
    ) -> crate::Result<Vec<Option<TableEntry>>> {
        self.lookup::<K, EntryRead>(segment_name, keys, timeout)
    }

    /// Looks up which keys exist, and at which version.
    ///
    /// Results are in input order; `None` for keys that do not exist.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the extension is closed, the time budget runs
    /// out, or the container fails.
    pub fn get_keys<K: AsRef<[u8]>>(
        &self,
        segment_name: &str,
        keys: &[K],
        timeout: Duration,
    ) -> crate::Result<Vec<Option<TableKey>>> {
        self.lookup::<K, KeyRead>(segment_name, keys, timeout)
    }

    fn lookup<K: AsRef<[u8]>, M: ReadMode>(
        &self,
        segment_name: &str,
        keys: &[K],
        timeout: Duration,
    ) -> crate::Result<Vec<Option<M::Output>>> {
        self.check_closed()?;

        if keys.is_empty() {
            return Ok(vec![]);
        }

        let timer = TimeoutTimer::new(timeout);

        let hashes = keys
            .iter()
            .map(|key| self.hasher.hash(key.as_ref()))
            .collect::<crate::Result<Vec<_>>>()?;

        let segment = self
            .container
            .for_segment(segment_name, timer.try_remaining()?)?;

        let offsets = self
            .key_index
            .get_bucket_offsets(&*segment, &distinct(&hashes), &timer)?;

        let reader = TableBucketReader::<M, _>::new(
            &*segment,
            self.serializer,
            self.max_bucket_chain_length,
            |offset: u64, timer: &TimeoutTimer| {
                self.key_index
                    .get_backpointer_offset(&*segment, offset, timer)
            },
        );

        keys.iter()
            .zip(&hashes)
            .map(|(key, hash)| match offsets.get(hash).copied().flatten() {
                Some(bucket_offset) => reader.find(key.as_ref(), bucket_offset, &timer),
                None => Ok(None),
            })
            .collect()
    }

    /// Not supported for table segments.
    ///
    /// # Errors
    ///
    /// Always returns `Err`.
    pub fn key_iterator(
        &self,
        _segment_name: &str,
        _timeout: Duration,
    ) -> crate::Result<Box<dyn Iterator<Item = crate::Result<TableKey>> + '_>> {
        self.check_closed()?;
        Err(crate::Error::Unsupported("key_iterator"))
    }

    /// Not supported for table segments.
    ///
    /// # Errors
    ///
    /// Always returns `Err`.
    pub fn entry_iterator(
        &self,
        _segment_name: &str,
        _timeout: Duration,
    ) -> crate::Result<Box<dyn Iterator<Item = crate::Result<TableEntry>> + '_>> {
        self.check_closed()?;
        Err(crate::Error::Unsupported("entry_iterator"))
    }

    /// Creates the hook through which an external indexer keeps the index of
    /// a table segment up to date.
    ///
    /// Returns `None` if the segment is not a table segment.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the extension is closed, the segment does not
    /// exist, or the container fails.
    pub fn create_writer_connector(
        &self,
        segment_name: &str,
        timeout: Duration,
    ) -> crate::Result<Option<TableWriterConnector>> {
        self.check_closed()?;

        let timer = TimeoutTimer::new(timeout);
        let segment = self
            .container
            .for_segment(segment_name, timer.try_remaining()?)?;

        let attributes = segment.get_attributes(&[TABLE_INDEX_OFFSET], timer.try_remaining()?)?;

        if !attributes.contains_key(&TABLE_INDEX_OFFSET) {
            return Ok(None);
        }

        Ok(Some(TableWriterConnector {
            info: segment.info(),
            container: self.container.clone(),
            hasher: self.hasher.clone(),
            serializer: self.serializer,
            key_index: self.key_index.clone(),
            closed: AtomicBool::default(),
        }))
    }

    fn build_update_batch(&self, entries: &[TableEntry]) -> crate::Result<TableKeyBatch> {
        let mut batch = TableKeyBatch::update();

        for entry in entries {
            self.serializer.check_update(entry)?;

            let length = self.serializer.update_length(entry);
            self.check_batch_size(batch.length() + length)?;

            batch.add(entry.key.key.clone(), self.hasher.hash(&entry.key.key)?, length);
        }

        Ok(batch)
    }

    fn build_removal_batch(&self, keys: &[TableKey]) -> crate::Result<TableKeyBatch> {
        let mut batch = TableKeyBatch::removal();

        for key in keys {
            self.serializer.check_removal(key)?;

            let length = self.serializer.removal_length(key);
            self.check_batch_size(batch.length() + length)?;

            batch.add(key.key.clone(), self.hasher.hash(&key.key)?, length);
        }

        Ok(batch)
    }

    fn check_batch_size(&self, length: usize) -> crate::Result<()> {
        if length > self.max_batch_size {
            Err(crate::Error::BatchTooLarge {
                length,
                max: self.max_batch_size,
            })
        } else {
            Ok(())
        }
    }
}

fn distinct(hashes: &[KeyHash]) -> Vec<KeyHash> {
    let mut seen = HashSet::default();
    hashes.iter().copied().filter(|hash| seen.insert(*hash)).collect()
}

/// Hook for an external indexer of a single table segment
///
/// The indexer scans entries appended to the segment, persists their bucket
/// links in segment attributes, and then reports its progress through
/// [`TableWriterConnector::notify_index_offset_changed`].
pub struct TableWriterConnector {
    info: SegmentInfo,
    container: Arc<dyn SegmentContainer>,
    hasher: KeyHasher,
    serializer: EntrySerializer,
    key_index: Arc<ContainerKeyIndex>,
    closed: AtomicBool,
}

impl TableWriterConnector {
    /// Returns information about the segment, as of connector creation.
    #[must_use]
    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    /// Returns the serializer used for entries of the segment.
    #[must_use]
    pub fn serializer(&self) -> EntrySerializer {
        self.serializer
    }

    /// Returns the hasher used for keys of the segment.
    #[must_use]
    pub fn key_hasher(&self) -> &KeyHasher {
        &self.hasher
    }

    /// Resolves the segment.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the segment no longer exists.
    pub fn segment(&self, timeout: Duration) -> crate::Result<Arc<dyn DirectSegmentAccess>> {
        self.container.for_segment(&self.info.name, timeout)
    }

    /// Reports that all bucket links below `last_indexed_offset` have been
    /// persisted, including the segment's index offset attribute.
    pub fn notify_index_offset_changed(&self, last_indexed_offset: u64) {
        self.key_index
            .notify_index_offset_changed(self.info.id, Some(last_indexed_offset));
    }

    /// Detaches the indexer from the segment.
    ///
    /// The in-memory index state of the segment is dropped.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.key_index.notify_index_offset_changed(self.info.id, None);
        }
    }
}
