// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Segment attribute namespace used by table segments
//!
//! Attributes are 128-bit identifiers mapped to 64-bit values, stored by the
//! segment container next to the segment data. A table segment uses them for:
//!
//! - bucket head pointers: the attribute id is the [`KeyHash`] itself
//! - backpointers: `(BACKPOINTER_PREFIX, entry offset)`
//! - core bookkeeping, e.g. the last indexed offset: `(CORE_ATTRIBUTE_PREFIX, n)`
//!
//! Key hashes never carry one of the two reserved high words, so the three
//! ranges cannot overlap.

use crate::hash::KeyHash;

/// High word of core (internal bookkeeping) attributes
pub const CORE_ATTRIBUTE_PREFIX: u64 = 0x8000_0000_0000_0000;

/// High word of backpointer attributes
pub const BACKPOINTER_PREFIX: u64 = 0x7FFF_FFFF_FFFF_FFFF;

/// Offset up to which bucket and backpointer attributes are known to be up to date
///
/// Its presence marks a segment as a table segment.
pub const TABLE_INDEX_OFFSET: AttributeId = AttributeId::new(CORE_ATTRIBUTE_PREFIX, 0x1_0000);

/// 128-bit attribute identifier
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct AttributeId(u128);

impl AttributeId {
    /// Builds an attribute id from its high and low words.
    #[must_use]
    pub const fn new(msb: u64, lsb: u64) -> Self {
        Self(((msb as u128) << 64) | lsb as u128)
    }

    /// Returns the high word.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn msb(self) -> u64 {
        (self.0 >> 64) as u64
    }

    /// Returns the low word.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn lsb(self) -> u64 {
        self.0 as u64
    }

    /// Attribute holding the bucket head pointer of the given key hash.
    #[must_use]
    pub fn bucket(hash: KeyHash) -> Self {
        Self::new(hash.msb(), hash.lsb())
    }

    /// Attribute holding the backpointer of the entry at `offset`.
    #[must_use]
    pub const fn backpointer(offset: u64) -> Self {
        Self::new(BACKPOINTER_PREFIX, offset)
    }

    /// Returns `true` if this id lies in the core attribute range.
    #[must_use]
    pub const fn is_core(self) -> bool {
        self.msb() == CORE_ATTRIBUTE_PREFIX
    }

    /// Returns `true` if this id lies in the backpointer range.
    #[must_use]
    pub const fn is_backpointer(self) -> bool {
        self.msb() == BACKPOINTER_PREFIX
    }
}

/// How an attribute value is applied
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AttributeUpdateType {
    /// Overwrites any existing value
    Replace,

    /// Only applies if there is no value yet, or the new value is greater
    ReplaceIfGreater,
}

/// A single attribute mutation
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AttributeUpdate {
    /// Attribute to change
    pub id: AttributeId,

    /// How to apply the value
    pub update_type: AttributeUpdateType,

    /// New value
    pub value: u64,
}

impl AttributeUpdate {
    /// Unconditionally sets `id` to `value`.
    #[must_use]
    pub fn replace(id: AttributeId, value: u64) -> Self {
        Self {
            id,
            update_type: AttributeUpdateType::Replace,
            value,
        }
    }

    /// Sets `id` to `value` unless it already holds a greater or equal value.
    #[must_use]
    pub fn replace_if_greater(id: AttributeId, value: u64) -> Self {
        Self {
            id,
            update_type: AttributeUpdateType::ReplaceIfGreater,
            value,
        }
    }

    /// Applies this update on top of the current value, returning the resulting value.
    #[must_use]
    pub fn apply(&self, current: Option<u64>) -> u64 {
        match (self.update_type, current) {
            (AttributeUpdateType::ReplaceIfGreater, Some(current)) => current.max(self.value),
            _ => self.value,
        }
    }
}

/// Attributes every new table segment is created with.
#[must_use]
pub fn initial_table_attributes() -> Vec<AttributeUpdate> {
    vec![AttributeUpdate::replace(TABLE_INDEX_OFFSET, 0)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn attribute_id_words() {
        let id = AttributeId::new(0xDEAD_BEEF, 42);
        assert_eq!(id.msb(), 0xDEAD_BEEF);
        assert_eq!(id.lsb(), 42);
    }

    #[test]
    fn attribute_namespaces_disjoint() {
        assert!(TABLE_INDEX_OFFSET.is_core());
        assert!(!TABLE_INDEX_OFFSET.is_backpointer());

        let bp = AttributeId::backpointer(1_234);
        assert!(bp.is_backpointer());
        assert!(!bp.is_core());
        assert_eq!(bp.lsb(), 1_234);
    }

    #[test]
    fn attribute_update_if_greater() {
        let update = AttributeUpdate::replace_if_greater(TABLE_INDEX_OFFSET, 10);
        assert_eq!(update.apply(None), 10);
        assert_eq!(update.apply(Some(5)), 10);
        assert_eq!(update.apply(Some(15)), 15);

        let update = AttributeUpdate::replace(TABLE_INDEX_OFFSET, 10);
        assert_eq!(update.apply(Some(15)), 10);
    }
}
