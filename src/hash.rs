// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::attributes::{BACKPOINTER_PREFIX, CORE_ATTRIBUTE_PREFIX};
use byteorder::{BigEndian, ByteOrder};
use enum_dispatch::enum_dispatch;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Number of digest bytes that make up a [`KeyHash`]
pub const HASH_SIZE_BYTES: usize = 16;

/// 128-bit hash of a raw key
///
/// All entries sharing a key hash form one bucket. Distinct keys may share
/// a hash; readers resolve that by comparing raw keys.
#[derive(Copy, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct KeyHash(u128);

impl KeyHash {
    /// Builds a key hash from its high and low words.
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

    /// Converts the leading [`HASH_SIZE_BYTES`] of a digest into a key hash,
    /// moving the high word out of the reserved attribute ranges.
    fn from_digest(raw: &[u8]) -> crate::Result<Self> {
        let Some(raw) = raw.get(..HASH_SIZE_BYTES) else {
            return Err(crate::Error::HashLength {
                expected: HASH_SIZE_BYTES,
                got: raw.len(),
            });
        };

        let (hi, lo) = raw.split_at(8);
        let mut msb = BigEndian::read_u64(hi);
        let lsb = BigEndian::read_u64(lo);

        if msb == CORE_ATTRIBUTE_PREFIX {
            msb += 1;
        } else if msb == BACKPOINTER_PREFIX {
            msb -= 1;
        }

        Ok(Self::new(msb, lsb))
    }
}

impl std::fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyHash({:016x}-{:016x})", self.msb(), self.lsb())
    }
}

/// Produces a raw digest for a key
#[enum_dispatch]
pub trait HashFunction {
    /// Hashes the given key into a digest of at least [`HASH_SIZE_BYTES`] bytes.
    fn digest(&self, key: &[u8]) -> Vec<u8>;
}

/// SHA-256, truncated to 128 bits
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256Hasher;

impl HashFunction for Sha256Hasher {
    fn digest(&self, key: &[u8]) -> Vec<u8> {
        Sha256::digest(key).to_vec()
    }
}

type DigestFn = dyn Fn(&[u8]) -> Vec<u8> + Send + Sync;

/// User-provided hash function, mostly useful to force collisions in tests
#[derive(Clone)]
pub struct CustomHasher(Arc<DigestFn>);

impl HashFunction for CustomHasher {
    fn digest(&self, key: &[u8]) -> Vec<u8> {
        (self.0)(key)
    }
}

impl std::fmt::Debug for CustomHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CustomHasher")
    }
}

/// Maps raw keys to [`KeyHash`]es
///
/// Hashing is a pure function of the key bytes, so a hasher can be shared
/// between threads without synchronization.
#[derive(Clone, Debug)]
#[enum_dispatch(HashFunction)]
pub enum KeyHasher {
    /// SHA-256 based hasher (default)
    Sha256(Sha256Hasher),

    /// Custom hash function
    Custom(CustomHasher),
}

impl Default for KeyHasher {
    fn default() -> Self {
        Self::sha256()
    }
}

impl KeyHasher {
    /// Creates a hasher that uses SHA-256.
    #[must_use]
    pub fn sha256() -> Self {
        Self::Sha256(Sha256Hasher)
    }

    /// Creates a hasher from a custom function.
    ///
    /// The function is called once with an empty key before this returns, so
    /// a function with too short digests is rejected here instead of on first
    /// use. It must be pure.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the function yields less than [`HASH_SIZE_BYTES`] bytes.
    pub fn custom<F>(f: F) -> crate::Result<Self>
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        let digest = f(&[]);

        if digest.len() < HASH_SIZE_BYTES {
            return Err(crate::Error::HashLength {
                expected: HASH_SIZE_BYTES,
                got: digest.len(),
            });
        }

        Ok(Self::Custom(CustomHasher(Arc::new(f))))
    }

    /// Hashes a raw key.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a custom hash function yields a digest that is too short.
    pub fn hash(&self, key: &[u8]) -> crate::Result<KeyHash> {
        KeyHash::from_digest(&self.digest(key))
    }
}
