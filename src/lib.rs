// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Hash-indexed key-value tables on top of append-only segments.
//!
//! ##### About
//!
//! This crate exports a [`TableExtension`] that turns segments of a segment
//! container (an append-only, byte-addressable log with a small amount of
//! per-segment attribute storage) into key-value tables supporting `put`,
//! `remove` and `get`.
//!
//! Nothing is ever rewritten: every put or remove call appends one contiguous
//! batch of self-describing records. Keys are hashed into 128-bit
//! [`KeyHash`]es; each hash owns a bucket, a chain of entries linked newest
//! to oldest through backpointers. The head of each bucket and the
//! backpointer of each entry are kept in segment attributes, so a lookup
//! reads the bucket head, then walks the chain until it finds the key.
//!
//! Bucket links can be persisted by every update itself
//! ([`IndexingMode::Inline`]), or by an external indexer that reports its
//! progress through a [`TableWriterConnector`] ([`IndexingMode::Deferred`]).
//! Either way, a get that follows a put observes it.
//!
//! Keys are limited to 8 KiB, records to 1 MiB.
//!
//! # Example usage
//!
//! ```
//! use segment_table::{Config, MemorySegmentContainer, TableEntry, TableKey};
//! use std::{sync::Arc, time::Duration};
//!
//! let timeout = Duration::from_secs(5);
//!
//! let container = Arc::new(MemorySegmentContainer::new(0));
//! let tables = Config::new(container).open();
//!
//! tables.create_segment("my_table", timeout)?;
//!
//! tables.put(
//!     "my_table",
//!     &[TableEntry::new("a", "1"), TableEntry::new("b", "2")],
//!     timeout,
//! )?;
//!
//! let entries = tables.get("my_table", &["a", "b", "c"], timeout)?;
//! assert_eq!(entries[0].as_ref().map(|e| e.value.clone()), Some("1".into()));
//! assert!(entries[2].is_none());
//!
//! tables.remove("my_table", &[TableKey::new("a")], timeout)?;
//! assert!(tables.get("my_table", &["a"], timeout)?[0].is_none());
//! #
//! # Ok::<(), segment_table::Error>(())
//! ```

#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]
#![warn(clippy::redundant_feature_names)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

#[doc(hidden)]
pub type HashMap<K, V> = std::collections::HashMap<K, V, rustc_hash::FxBuildHasher>;

pub(crate) type HashSet<K> = std::collections::HashSet<K, rustc_hash::FxBuildHasher>;

/// Segment attribute namespace of tables
pub mod attributes;

mod batch;
mod bucket_reader;
mod cache;

#[doc(hidden)]
pub mod coding;

mod config;

/// Segment container interface
pub mod container;

mod entry;
mod error;
mod extension;
mod hash;

#[doc(hidden)]
pub mod key_index;

mod serializer;
mod slice;
mod time;
mod value_type;

/// User defined key (byte array)
pub type UserKey = Slice;

/// User defined data (byte array)
pub type UserValue = Slice;

#[doc(hidden)]
pub use {
    batch::{BatchItem, BatchKind, TableKeyBatch},
    bucket_reader::{EntryRead, KeyRead, ReadMode, TableBucketReader},
    cache::BucketCache,
    key_index::ContainerKeyIndex,
    time::TimeoutTimer,
};

pub use {
    config::{Config, IndexingMode},
    container::{MemorySegmentContainer, SegmentContainer},
    entry::{TableEntry, TableKey, Version},
    error::{Error, Result},
    extension::{TableExtension, TableWriterConnector},
    hash::{CustomHasher, HashFunction, KeyHash, KeyHasher, Sha256Hasher, HASH_SIZE_BYTES},
    serializer::{
        EntryHeader, EntryScanner, EntrySerializer, SerializedEntry, HEADER_LENGTH,
        MAX_KEY_LENGTH, MAX_SERIALIZATION_LENGTH, MAX_VALUE_LENGTH,
    },
    slice::Slice,
    value_type::ValueType,
};
