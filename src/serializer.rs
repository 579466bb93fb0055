// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    entry::{TableEntry, TableKey},
    Slice, UserKey, UserValue, ValueType,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Current record format version
pub const CURRENT_FORMAT_VERSION: u8 = 0;

/// Length of the fixed-size record header
pub const HEADER_LENGTH: usize = std::mem::size_of::<u8>()
    + std::mem::size_of::<u8>()
    + std::mem::size_of::<u32>()
    + std::mem::size_of::<u32>()
    + std::mem::size_of::<u64>();

/// Maximum length of a raw key
pub const MAX_KEY_LENGTH: usize = 8_192;

/// Maximum length of a single serialized record
pub const MAX_SERIALIZATION_LENGTH: usize = 1_024 * 1_024;

/// Maximum length of a value
pub const MAX_VALUE_LENGTH: usize = MAX_SERIALIZATION_LENGTH - HEADER_LENGTH - MAX_KEY_LENGTH;

/// Checksum stored in record headers, covering key and value bytes
#[must_use]
pub fn record_checksum(key: &[u8], value: &[u8]) -> u64 {
    let mut hasher = xxhash_rust::xxh3::Xxh3::new();
    hasher.update(key);
    hasher.update(value);
    hasher.digest()
}

/// Fixed-size header in front of every record
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EntryHeader {
    /// Whether the record is an update or a removal
    pub value_type: ValueType,

    /// Length of the raw key
    pub key_length: u32,

    /// Length of the value (0 for tombstones)
    pub value_length: u32,

    /// Checksum of key and value
    pub checksum: u64,
}

impl EntryHeader {
    /// Returns `true` if the record is a tombstone.
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.value_type.is_tombstone()
    }

    /// Offset of the key, relative to the start of the record.
    #[must_use]
    pub fn key_offset(&self) -> usize {
        HEADER_LENGTH
    }

    /// Offset of the value, relative to the start of the record.
    #[must_use]
    pub fn value_offset(&self) -> usize {
        HEADER_LENGTH + self.key_length as usize
    }

    /// Length of the whole record, header included.
    #[must_use]
    pub fn total_length(&self) -> usize {
        self.value_offset() + self.value_length as usize
    }
}

// NOTE:
// RECORD LAYOUT
//
// [format version; 1B]
// [value type; 1B]
// [key len; 4B]
// [value len; 4B]
// [checksum; 8B]
// [...key; ?]
// [...value; ?]
impl Encode for EntryHeader {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(CURRENT_FORMAT_VERSION)?;
        writer.write_u8(self.value_type.into())?;
        writer.write_u32::<BigEndian>(self.key_length)?;
        writer.write_u32::<BigEndian>(self.value_length)?;
        writer.write_u64::<BigEndian>(self.checksum)?;
        Ok(())
    }
}

impl Decode for EntryHeader {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let version = reader.read_u8()?;
        if version != CURRENT_FORMAT_VERSION {
            return Err(DecodeError::InvalidVersion(version));
        }

        let value_type = reader.read_u8()?;
        let value_type: ValueType = value_type
            .try_into()
            .map_err(|()| DecodeError::InvalidTag(("ValueType", value_type)))?;

        let key_length = reader.read_u32::<BigEndian>()?;
        let value_length = reader.read_u32::<BigEndian>()?;
        let checksum = reader.read_u64::<BigEndian>()?;

        if key_length as usize > MAX_KEY_LENGTH {
            return Err(DecodeError::InvalidHeader("KeyLength"));
        }

        if value_type == ValueType::Tombstone && value_length > 0 {
            return Err(DecodeError::InvalidHeader("TombstoneValue"));
        }

        Ok(Self {
            value_type,
            key_length,
            value_length,
            checksum,
        })
    }
}

/// A record parsed back from its serialized form
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SerializedEntry {
    /// Record header
    pub header: EntryHeader,

    /// Raw key
    pub key: UserKey,

    /// Value, or `None` for tombstones
    pub value: Option<UserValue>,
}

impl SerializedEntry {
    /// Returns `true` if the record is a tombstone.
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.header.is_deletion()
    }
}

/// Encodes and decodes update and removal records
///
/// Records are self-describing, so a buffer of concatenated records can be
/// scanned from front to back, and a single record can be read given only
/// its offset.
#[derive(Clone, Copy, Debug, Default)]
pub struct EntrySerializer;

impl EntrySerializer {
    /// Serialized length of an update record, without serializing it.
    #[must_use]
    pub fn update_length(&self, entry: &TableEntry) -> usize {
        HEADER_LENGTH + entry.key.key.len() + entry.value.len()
    }

    /// Serialized length of a removal record, without serializing it.
    #[must_use]
    pub fn removal_length(&self, key: &TableKey) -> usize {
        HEADER_LENGTH + key.key.len()
    }

    /// Checks that an entry fits into a record.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the key or value is too long.
    pub fn check_update(&self, entry: &TableEntry) -> crate::Result<()> {
        self.check_removal(&entry.key)?;

        if entry.value.len() > MAX_VALUE_LENGTH {
            return Err(crate::Error::EntryTooLarge {
                length: entry.value.len(),
                max: MAX_VALUE_LENGTH,
            });
        }

        Ok(())
    }

    /// Checks that a key fits into a record.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the key is too long.
    pub fn check_removal(&self, key: &TableKey) -> crate::Result<()> {
        if key.key.len() > MAX_KEY_LENGTH {
            return Err(crate::Error::EntryTooLarge {
                length: key.key.len(),
                max: MAX_KEY_LENGTH,
            });
        }

        Ok(())
    }

    /// Serializes update records for all entries, in order.
    #[must_use]
    pub fn serialize_update(&self, entries: &[TableEntry]) -> Vec<u8> {
        let length = entries.iter().map(|e| self.update_length(e)).sum();
        let mut buf = Vec::with_capacity(length);

        #[expect(clippy::expect_used, reason = "writing into a Vec cannot fail")]
        self.serialize_update_into(entries, &mut buf)
            .expect("cannot fail");

        buf
    }

    /// Serializes update records for all entries into a writer.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn serialize_update_into<W: Write>(
        &self,
        entries: &[TableEntry],
        writer: &mut W,
    ) -> Result<(), EncodeError> {
        for entry in entries {
            self.write_record(writer, ValueType::Value, &entry.key.key, &entry.value)?;
        }
        Ok(())
    }

    /// Serializes removal records (tombstones) for all keys, in order.
    #[must_use]
    pub fn serialize_removal(&self, keys: &[TableKey]) -> Vec<u8> {
        let length = keys.iter().map(|k| self.removal_length(k)).sum();
        let mut buf = Vec::with_capacity(length);

        #[expect(clippy::expect_used, reason = "writing into a Vec cannot fail")]
        self.serialize_removal_into(keys, &mut buf)
            .expect("cannot fail");

        buf
    }

    /// Serializes removal records for all keys into a writer.
    ///
    /// # Errors
    ///
    /// Will return `Err` if an IO error occurs.
    pub fn serialize_removal_into<W: Write>(
        &self,
        keys: &[TableKey],
        writer: &mut W,
    ) -> Result<(), EncodeError> {
        for key in keys {
            self.write_record(writer, ValueType::Tombstone, &key.key, &[])?;
        }
        Ok(())
    }

    fn write_record<W: Write>(
        &self,
        writer: &mut W,
        value_type: ValueType,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), EncodeError> {
        // NOTE: Lengths are checked against MAX_KEY_LENGTH/MAX_VALUE_LENGTH before batching
        #[allow(clippy::cast_possible_truncation)]
        let header = EntryHeader {
            value_type,
            key_length: key.len() as u32,
            value_length: value.len() as u32,
            checksum: record_checksum(key, value),
        };

        header.encode_into(writer)?;
        writer.write_all(key)?;
        writer.write_all(value)?;
        Ok(())
    }

    /// Parses a record header from the start of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the header is truncated or malformed.
    pub fn read_header(&self, bytes: &[u8]) -> Result<EntryHeader, DecodeError> {
        EntryHeader::decode_from(&mut Cursor::new(bytes))
    }

    /// Parses the record at the start of `bytes`, verifying its checksum.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the record is truncated, malformed or corrupted.
    pub fn read_entry(&self, bytes: &Slice) -> crate::Result<SerializedEntry> {
        let header = self.read_header(bytes)?;

        if bytes.len() < header.total_length() {
            return Err(DecodeError::Truncated {
                length: bytes.len(),
                expected: header.total_length(),
            }
            .into());
        }

        let key = bytes.slice(header.key_offset()..header.value_offset());
        let value = bytes.slice(header.value_offset()..header.total_length());

        let checksum = record_checksum(&key, &value);
        if checksum != header.checksum {
            log::error!(
                "Checksum mismatch for table entry, got={checksum}, expected={}",
                header.checksum,
            );

            return Err(crate::Error::ChecksumMismatch {
                got: checksum,
                expected: header.checksum,
            });
        }

        Ok(SerializedEntry {
            header,
            key,
            value: if header.is_deletion() {
                None
            } else {
                Some(value)
            },
        })
    }

    /// Iterates over all records in a buffer of concatenated records.
    #[must_use]
    pub fn scan(&self, bytes: Slice) -> EntryScanner {
        EntryScanner {
            serializer: *self,
            buffer: bytes,
            position: 0,
            done: false,
        }
    }
}

/// Scans a buffer of concatenated records from front to back
///
/// Yields each record together with its offset inside the buffer. Stops
/// after the first malformed record.
pub struct EntryScanner {
    serializer: EntrySerializer,
    buffer: Slice,
    position: usize,
    done: bool,
}

impl Iterator for EntryScanner {
    type Item = crate::Result<(usize, SerializedEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.position >= self.buffer.len() {
            return None;
        }

        let offset = self.position;
        let record = self.buffer.slice(offset..);

        match self.serializer.read_entry(&record) {
            Ok(entry) => {
                self.position += entry.header.total_length();
                Some(Ok((offset, entry)))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
