//! 20-byte account address type.
//!
//! Addresses identify accounts and validators. They are displayed as 40
//! lowercase hex characters with a `0x` prefix and serialize through serde
//! as that hex string.

use crate::{Error, Result, H256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Size of an address in bytes
pub const ADDRESS_SIZE: usize = 20;

/// A 20-byte account address.
///
/// # Example
///
/// ```rust
/// use valcore_types::Address;
///
/// let addr: Address = "0x742d35cc6634c0532925a3b844bc9e7595f0beb1".parse().unwrap();
/// let bytes: [u8; 20] = addr.into();
/// assert_eq!(Address::from(bytes), addr);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address([u8; ADDRESS_SIZE]);

impl Address {
    /// The zero address (0x0000000000000000000000000000000000000000)
    pub const ZERO: Self = Self([0u8; ADDRESS_SIZE]);

    /// Creates a new address from a 20-byte array.
    #[inline]
    pub const fn new(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self(bytes)
    }

    /// Creates an address from a slice.
    ///
    /// Returns an error if the slice length is not exactly 20 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != ADDRESS_SIZE {
            return Err(Error::InvalidLength {
                expected: ADDRESS_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Derives an address from a public key: the low 20 bytes of
    /// SHA-256(pubkey).
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let hash = H256::sha256(public_key);
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes.copy_from_slice(&hash.as_bytes()[12..]);
        Self(bytes)
    }

    /// Returns the address as a byte slice.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the address as a fixed-size byte array.
    #[inline]
    pub const fn as_fixed_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    /// Checks if this is the zero address.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self == &Self::ZERO
    }

    /// Creates an address from its hex representation.
    ///
    /// The input can optionally have a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let s = s.strip_prefix("0X").unwrap_or(s);

        if s.len() != 40 {
            return Err(Error::InvalidAddress(format!(
                "expected 40 hex characters, got {}",
                s.len()
            )));
        }

        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }

    /// Returns the lowercase hex representation with 0x prefix.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Creates a random address (for testing purposes).
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; ADDRESS_SIZE];
        rng.fill(&mut bytes);
        Self(bytes)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{})", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<[u8; ADDRESS_SIZE]> for Address {
    fn from(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self(bytes)
    }
}

impl From<Address> for [u8; ADDRESS_SIZE] {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
