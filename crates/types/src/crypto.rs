//! The signing seam.
//!
//! Consensus and transport never construct a signature scheme themselves;
//! they receive a [`Signer`] at construction time and consume only
//! `sign`/`verify`. Any EUF-CMA-secure scheme can be plugged in behind this
//! trait. [`KeyedSigner`] is the deterministic keyed-digest scheme used for
//! tests and local development networks; it provides no security against an
//! adversary who knows the scheme and must not be used on public networks.

use crate::{Address, H256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A detached signature as produced by a [`Signer`].
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature(Vec<u8>);

impl Signature {
    /// An empty (absent) signature.
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// Wraps raw signature bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Returns the signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the signature is absent.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(0x{})", hex::encode(&self.0))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(&self.0)))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

/// Injected signing/verification functions.
///
/// Implementations must be deterministic in `verify`: the same
/// (public key, message, signature) triple always yields the same answer.
pub trait Signer: Send + Sync {
    /// Signs a message with this signer's key.
    fn sign(&self, message: &[u8]) -> Signature;

    /// Verifies a signature against an arbitrary public key.
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &Signature) -> bool;

    /// The public key of this signer.
    fn public_key(&self) -> Vec<u8>;

    /// The address derived from this signer's public key.
    fn address(&self) -> Address {
        Address::from_public_key(&self.public_key())
    }
}

/// Deterministic keyed-digest signer for tests and local networks.
///
/// Signatures are `SHA-256(public_key || message)`, so anyone holding the
/// public key can both produce and verify them. That makes the scheme
/// useless against a real adversary but fully deterministic and
/// dependency-free, which is what the test harness and single-operator
/// devnets need.
#[derive(Clone)]
pub struct KeyedSigner {
    public_key: Vec<u8>,
}

impl KeyedSigner {
    /// Creates a signer whose public key is derived from the given seed.
    pub fn from_seed(seed: &[u8]) -> Self {
        let pk = H256::sha256_concat(&[b"valcore-dev-key:", seed]);
        Self {
            public_key: pk.as_bytes().to_vec(),
        }
    }

    fn digest(public_key: &[u8], message: &[u8]) -> Signature {
        let h = H256::sha256_concat(&[public_key, message]);
        Signature::from_bytes(h.as_bytes().to_vec())
    }
}

impl Signer for KeyedSigner {
    fn sign(&self, message: &[u8]) -> Signature {
        Self::digest(&self.public_key, message)
    }

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &Signature) -> bool {
        !signature.is_empty() && Self::digest(public_key, message) == *signature
    }

    fn public_key(&self) -> Vec<u8> {
        self.public_key.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let signer = KeyedSigner::from_seed(b"validator-1");
        let sig = signer.sign(b"message");
        assert!(signer.verify(&signer.public_key(), b"message", &sig));
        assert!(!signer.verify(&signer.public_key(), b"other", &sig));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let a = KeyedSigner::from_seed(b"a");
        let b = KeyedSigner::from_seed(b"b");
        let sig = a.sign(b"message");
        assert!(!b.verify(&b.public_key(), b"message", &sig));
    }

    #[test]
    fn test_empty_signature_rejected() {
        let signer = KeyedSigner::from_seed(b"a");
        assert!(!signer.verify(&signer.public_key(), b"message", &Signature::empty()));
    }

    #[test]
    fn test_address_stable() {
        let a1 = KeyedSigner::from_seed(b"validator-1").address();
        let a2 = KeyedSigner::from_seed(b"validator-1").address();
        assert_eq!(a1, a2);
    }
}
