//! 32-byte hash type backed by SHA-256.
//!
//! [`H256`] is used throughout valcore for block hashes, transaction hashes,
//! state roots, and vote digests. The all-zero value [`H256::NIL`] represents
//! "no hash" and doubles as the nil vote in consensus.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Size of a hash in bytes
pub const HASH_SIZE: usize = 32;

/// A 32-byte SHA-256 hash value.
///
/// # Example
///
/// ```rust
/// use valcore_types::H256;
///
/// let hash = H256::sha256(b"hello world");
/// let parsed: H256 = hash.to_hex().parse().unwrap();
/// assert_eq!(hash, parsed);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct H256([u8; HASH_SIZE]);

impl H256 {
    /// The nil hash (all zeros) - represents "no hash" or a nil vote.
    pub const NIL: Self = Self([0u8; HASH_SIZE]);

    /// Creates a new hash from a 32-byte array.
    #[inline]
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates a hash from a slice.
    ///
    /// Returns an error if the slice length is not exactly 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != HASH_SIZE {
            return Err(Error::InvalidLength {
                expected: HASH_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Computes the SHA-256 hash of the given data.
    pub fn sha256(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let result = hasher.finalize();
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// Computes the SHA-256 hash of multiple data slices without
    /// concatenating them first.
    pub fn sha256_concat(data: &[&[u8]]) -> Self {
        let mut hasher = Sha256::new();
        for slice in data {
            hasher.update(slice);
        }
        let result = hasher.finalize();
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(&result);
        Self(bytes)
    }

    /// Returns the hash as a byte slice.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the hash as a fixed-size byte array.
    #[inline]
    pub const fn as_fixed_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Checks if this is the nil/zero hash.
    #[inline]
    pub fn is_nil(&self) -> bool {
        self == &Self::NIL
    }

    /// Creates a hash from its hex representation.
    ///
    /// The input can optionally have a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let s = s.strip_prefix("0X").unwrap_or(s);

        if s.len() != 64 {
            return Err(Error::InvalidHash(format!(
                "expected 64 hex characters, got {}",
                s.len()
            )));
        }

        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }

    /// Returns the hex representation with 0x prefix.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Creates a random hash (for testing purposes).
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; HASH_SIZE];
        rng.fill(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Debug for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H256(0x{})", hex::encode(self.0))
    }
}

impl fmt::Display for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for H256 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<[u8; HASH_SIZE]> for H256 {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl From<H256> for [u8; HASH_SIZE] {
    fn from(hash: H256) -> Self {
        hash.0
    }
}

impl AsRef<[u8]> for H256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for H256 {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for H256 {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Computes the SHA-256 hash of the given data.
///
/// Convenience wrapper around [`H256::sha256`].
#[inline]
pub fn sha256(data: &[u8]) -> H256 {
    H256::sha256(data)
}
