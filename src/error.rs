// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in table segments
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// The extension (or its key index) was closed
    Closed,

    /// The operation is not supported on table segments
    Unsupported(&'static str),

    /// An update or removal batch exceeds the maximum batch size
    BatchTooLarge {
        /// Serialized length of the batch
        length: usize,

        /// Configured limit
        max: usize,
    },

    /// A single key or value exceeds its maximum length
    EntryTooLarge {
        /// Offending length
        length: usize,

        /// Limit for that part of the entry
        max: usize,
    },

    /// No segment with the given name exists
    SegmentNotFound(String),

    /// A segment with the given name already exists
    SegmentExists(String),

    /// The time budget of the operation ran out
    Timeout,

    /// A hash function produced a digest of the wrong size
    HashLength {
        /// Minimum digest length
        expected: usize,

        /// Actual digest length
        got: usize,
    },

    /// Invalid checksum value (got, expected)
    ChecksumMismatch {
        /// Checksum of the data that was read
        got: u64,

        /// Checksum stored in the record header
        expected: u64,
    },

    /// A bucket chain is inconsistent (backpointer not moving backwards, or too long)
    CorruptedBucket {
        /// Offset of the entry at which the walk stopped
        offset: u64,

        /// Number of entries visited
        hops: usize,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TableError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Table result
pub type Result<T> = std::result::Result<T, Error>;
