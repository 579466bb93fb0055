// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Interface to the storage engine that owns the segments
//!
//! Table segments are plain append-only segments: the table layer only ever
//! appends records, reads byte ranges back, and keeps its index in segment
//! attributes.

mod memory;

pub use memory::{MemorySegment, MemorySegmentContainer};

use crate::{
    attributes::{AttributeId, AttributeUpdate},
    HashMap, Slice,
};
use std::{sync::Arc, time::Duration};

/// Container-unique segment ID
pub type SegmentId = u64;

/// Point-in-time information about a segment
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SegmentInfo {
    /// Segment ID
    pub id: SegmentId,

    /// Segment name
    pub name: String,

    /// Number of bytes appended so far, i.e. the offset of the next append
    pub length: u64,
}

/// Direct access to a single segment
pub trait DirectSegmentAccess: Send + Sync {
    /// Returns the segment ID.
    fn id(&self) -> SegmentId;

    /// Returns current information about the segment.
    fn info(&self) -> SegmentInfo;

    /// Appends `data` atomically, returning the offset it was written at.
    ///
    /// Attribute updates, if any, are applied together with the append.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the segment no longer exists, or an IO error occurs.
    fn append(
        &self,
        data: &[u8],
        attribute_updates: Option<&[AttributeUpdate]>,
        timeout: Duration,
    ) -> crate::Result<u64>;

    /// Reads exactly `length` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the range is out of bounds, or an IO error occurs.
    fn read(&self, offset: u64, length: usize, timeout: Duration) -> crate::Result<Slice>;

    /// Looks up attribute values. Attributes without a value are omitted.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the segment no longer exists, or an IO error occurs.
    fn get_attributes(
        &self,
        ids: &[AttributeId],
        timeout: Duration,
    ) -> crate::Result<HashMap<AttributeId, u64>>;

    /// Applies all attribute updates atomically.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the segment no longer exists, or an IO error occurs.
    fn update_attributes(&self, updates: &[AttributeUpdate], timeout: Duration)
        -> crate::Result<()>;
}

/// Creates, deletes and hands out segments
pub trait SegmentContainer: Send + Sync {
    /// Returns the container ID.
    fn id(&self) -> u64;

    /// Creates a new segment with the given initial attributes.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the segment already exists, or an IO error occurs.
    fn create_segment(
        &self,
        name: &str,
        attributes: &[AttributeUpdate],
        timeout: Duration,
    ) -> crate::Result<()>;

    /// Deletes a segment, including its attributes.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the segment does not exist, or an IO error occurs.
    fn delete_segment(&self, name: &str, timeout: Duration) -> crate::Result<()>;

    /// Resolves a segment by name.
    ///
    /// # Errors
    ///
    /// Will return `Err` if the segment does not exist.
    fn for_segment(
        &self,
        name: &str,
        timeout: Duration,
    ) -> crate::Result<Arc<dyn DirectSegmentAccess>>;
}
