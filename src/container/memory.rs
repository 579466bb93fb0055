// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{DirectSegmentAccess, SegmentContainer, SegmentId, SegmentInfo};
use crate::{
    attributes::{AttributeId, AttributeUpdate},
    HashMap, Slice,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

/// In-memory segment
///
/// Appends and attribute updates are atomic and totally ordered.
pub struct MemorySegment {
    id: SegmentId,
    name: String,
    data: RwLock<Vec<u8>>,
    attributes: RwLock<HashMap<AttributeId, u64>>,
    deleted: AtomicBool,

    attribute_reads: AtomicU64,
}

impl MemorySegment {
    fn new(id: SegmentId, name: &str) -> Self {
        Self {
            id,
            name: name.into(),
            data: RwLock::default(),
            attributes: RwLock::default(),
            deleted: AtomicBool::default(),
            attribute_reads: AtomicU64::default(),
        }
    }

    fn check_exists(&self) -> crate::Result<()> {
        if self.deleted.load(Ordering::Acquire) {
            Err(crate::Error::SegmentNotFound(self.name.clone()))
        } else {
            Ok(())
        }
    }

    fn apply(attributes: &mut HashMap<AttributeId, u64>, updates: &[AttributeUpdate]) {
        for update in updates {
            let value = update.apply(attributes.get(&update.id).copied());
            attributes.insert(update.id, value);
        }
    }

    /// Returns the number of attribute lookups served so far.
    #[doc(hidden)]
    #[must_use]
    pub fn attribute_read_count(&self) -> u64 {
        self.attribute_reads.load(Ordering::Relaxed)
    }

    /// Returns a copy of all attributes.
    #[doc(hidden)]
    #[must_use]
    pub fn attributes(&self) -> HashMap<AttributeId, u64> {
        self.attributes.read().expect("lock is poisoned").clone()
    }
}

impl DirectSegmentAccess for MemorySegment {
    fn id(&self) -> SegmentId {
        self.id
    }

    fn info(&self) -> SegmentInfo {
        SegmentInfo {
            id: self.id,
            name: self.name.clone(),
            length: self.data.read().expect("lock is poisoned").len() as u64,
        }
    }

    fn append(
        &self,
        data: &[u8],
        attribute_updates: Option<&[AttributeUpdate]>,
        _timeout: Duration,
    ) -> crate::Result<u64> {
        let mut lock = self.data.write().expect("lock is poisoned");
        self.check_exists()?;

        let offset = lock.len() as u64;
        lock.extend_from_slice(data);

        if let Some(updates) = attribute_updates {
            let mut attributes = self.attributes.write().expect("lock is poisoned");
            Self::apply(&mut attributes, updates);
        }

        log::trace!(
            "Appended {} bytes to segment {:?} at offset {offset}",
            data.len(),
            self.name,
        );

        Ok(offset)
    }

    fn read(&self, offset: u64, length: usize, _timeout: Duration) -> crate::Result<Slice> {
        self.check_exists()?;

        let lock = self.data.read().expect("lock is poisoned");

        let bytes = usize::try_from(offset)
            .ok()
            .and_then(|start| lock.get(start..start.checked_add(length)?));

        bytes.map(Slice::new).ok_or_else(|| {
            crate::Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "read of {length} bytes at offset {offset} is out of bounds (segment length {})",
                    lock.len()
                ),
            ))
        })
    }

    fn get_attributes(
        &self,
        ids: &[AttributeId],
        _timeout: Duration,
    ) -> crate::Result<HashMap<AttributeId, u64>> {
        self.check_exists()?;
        self.attribute_reads.fetch_add(1, Ordering::Relaxed);

        let attributes = self.attributes.read().expect("lock is poisoned");

        Ok(ids
            .iter()
            .filter_map(|id| attributes.get(id).map(|value| (*id, *value)))
            .collect())
    }

    fn update_attributes(
        &self,
        updates: &[AttributeUpdate],
        _timeout: Duration,
    ) -> crate::Result<()> {
        self.check_exists()?;

        let mut attributes = self.attributes.write().expect("lock is poisoned");
        Self::apply(&mut attributes, updates);

        Ok(())
    }
}

/// Segment container that keeps all segments in memory
///
/// Useful for embedding and testing; nothing is persisted.
#[derive(Default)]
pub struct MemorySegmentContainer {
    id: u64,
    segments: RwLock<HashMap<String, Arc<MemorySegment>>>,
    segment_id_counter: AtomicU64,
}

impl MemorySegmentContainer {
    /// Creates an empty container.
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Returns the segment with the given name, if it exists.
    #[must_use]
    pub fn segment(&self, name: &str) -> Option<Arc<MemorySegment>> {
        self.segments
            .read()
            .expect("lock is poisoned")
            .get(name)
            .cloned()
    }
}

impl SegmentContainer for MemorySegmentContainer {
    fn id(&self) -> u64 {
        self.id
    }

    fn create_segment(
        &self,
        name: &str,
        attributes: &[AttributeUpdate],
        _timeout: Duration,
    ) -> crate::Result<()> {
        let mut segments = self.segments.write().expect("lock is poisoned");

        if segments.contains_key(name) {
            return Err(crate::Error::SegmentExists(name.into()));
        }

        let id = self.segment_id_counter.fetch_add(1, Ordering::Relaxed);
        let segment = MemorySegment::new(id, name);
        MemorySegment::apply(
            &mut segment.attributes.write().expect("lock is poisoned"),
            attributes,
        );

        segments.insert(name.into(), Arc::new(segment));

        Ok(())
    }

    fn delete_segment(&self, name: &str, _timeout: Duration) -> crate::Result<()> {
        let segment = self
            .segments
            .write()
            .expect("lock is poisoned")
            .remove(name)
            .ok_or_else(|| crate::Error::SegmentNotFound(name.into()))?;

        segment.deleted.store(true, Ordering::Release);

        Ok(())
    }

    fn for_segment(
        &self,
        name: &str,
        _timeout: Duration,
    ) -> crate::Result<Arc<dyn DirectSegmentAccess>> {
        self.segment(name)
            .map(|segment| segment as Arc<dyn DirectSegmentAccess>)
            .ok_or_else(|| crate::Error::SegmentNotFound(name.into()))
    }
}
