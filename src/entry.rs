// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{UserKey, UserValue};

/// Key version - the segment offset at which an entry for the key was appended
pub type Version = u64;

/// A raw key, optionally tagged with the version it was read at
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableKey {
    /// Raw key bytes
    pub key: UserKey,

    /// Offset of the entry this key was read from, if known
    pub version: Option<Version>,
}

impl TableKey {
    /// Creates an unversioned key.
    pub fn new<K: Into<UserKey>>(key: K) -> Self {
        Self {
            key: key.into(),
            version: None,
        }
    }

    /// Creates a key that was found at the given version.
    pub fn versioned<K: Into<UserKey>>(key: K, version: Version) -> Self {
        Self {
            key: key.into(),
            version: Some(version),
        }
    }
}

/// A key-value pair stored in a table segment
#[derive(Clone, Eq, PartialEq)]
pub struct TableEntry {
    /// Key (and version, for entries that were read back)
    pub key: TableKey,

    /// User-defined value - an arbitrary byte array
    pub value: UserValue,
}

impl TableEntry {
    /// Creates a new, unversioned entry.
    pub fn new<K: Into<UserKey>, V: Into<UserValue>>(key: K, value: V) -> Self {
        Self {
            key: TableKey::new(key),
            value: value.into(),
        }
    }

    /// Creates an entry that was found at the given version.
    pub fn versioned<K: Into<UserKey>, V: Into<UserValue>>(
        key: K,
        value: V,
        version: Version,
    ) -> Self {
        Self {
            key: TableKey::versioned(key, version),
            value: value.into(),
        }
    }
}

impl std::fmt::Debug for TableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}@{:?} => {}",
            self.key.key,
            self.key.version,
            if self.value.len() >= 64 {
                format!("[ ... {} bytes ]", self.value.len())
            } else {
                format!("{:?}", self.value)
            }
        )
    }
}
