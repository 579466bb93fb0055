#![allow(dead_code)]

use segment_table::{
    attributes::{AttributeId, AttributeUpdate, TABLE_INDEX_OFFSET},
    container::DirectSegmentAccess,
    Config, IndexingMode, KeyHash, MemorySegmentContainer, Slice, TableExtension,
    TableWriterConnector,
};
use std::{collections::HashMap, sync::Arc, time::Duration};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn open(mode: IndexingMode) -> (Arc<MemorySegmentContainer>, TableExtension) {
    let container = Arc::new(MemorySegmentContainer::new(0));
    let tables = Config::new(container.clone()).indexing_mode(mode).open();
    (container, tables)
}

/// Looks up keys, returning only values.
pub fn values(
    tables: &TableExtension,
    segment_name: &str,
    keys: &[&str],
) -> segment_table::Result<Vec<Option<Slice>>> {
    Ok(tables
        .get(segment_name, keys, TIMEOUT)?
        .into_iter()
        .map(|entry| entry.map(|entry| entry.value))
        .collect())
}

pub fn some(value: &str) -> Option<Slice> {
    Some(value.into())
}

/// Minimal external indexer: persists bucket links of everything appended
/// since the last persisted index offset
pub struct TestIndexer {
    connector: TableWriterConnector,
}

impl TestIndexer {
    pub fn new(tables: &TableExtension, segment_name: &str) -> segment_table::Result<Self> {
        let connector = tables
            .create_writer_connector(segment_name, TIMEOUT)?
            .expect("should be a table segment");

        Ok(Self { connector })
    }

    pub fn connector(&self) -> &TableWriterConnector {
        &self.connector
    }

    /// Indexes all unindexed entries, returning the new index offset.
    pub fn run(&self) -> segment_table::Result<u64> {
        let segment = self.connector.segment(TIMEOUT)?;

        let start = segment
            .get_attributes(&[TABLE_INDEX_OFFSET], TIMEOUT)?
            .get(&TABLE_INDEX_OFFSET)
            .copied()
            .unwrap_or_default();
        let end = segment.info().length;

        if end <= start {
            return Ok(start);
        }

        let data = segment.read(start, (end - start) as usize, TIMEOUT)?;
        let serializer = self.connector.serializer();
        let hasher = self.connector.key_hasher();

        let mut heads: HashMap<KeyHash, Option<u64>> = HashMap::new();
        let mut updates = vec![];

        for item in serializer.scan(data) {
            let (position, entry) = item?;
            let offset = start + position as u64;
            let hash = hasher.hash(&entry.key)?;

            let previous = match heads.get(&hash) {
                Some(head) => *head,
                None => head_of(&*segment, hash)?,
            };

            if let Some(previous) = previous {
                updates.push(AttributeUpdate::replace(
                    AttributeId::backpointer(offset),
                    previous,
                ));
            }

            heads.insert(hash, Some(offset));
        }

        for (hash, head) in heads {
            if let Some(head) = head {
                updates.push(AttributeUpdate::replace_if_greater(
                    AttributeId::bucket(hash),
                    head,
                ));
            }
        }

        updates.push(AttributeUpdate::replace_if_greater(TABLE_INDEX_OFFSET, end));

        segment.update_attributes(&updates, TIMEOUT)?;
        self.connector.notify_index_offset_changed(end);

        Ok(end)
    }
}

fn head_of(segment: &dyn DirectSegmentAccess, hash: KeyHash) -> segment_table::Result<Option<u64>> {
    let id = AttributeId::bucket(hash);
    Ok(segment.get_attributes(&[id], TIMEOUT)?.get(&id).copied())
}
