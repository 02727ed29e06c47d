//! # Valcore Types
//!
//! Core type definitions for the valcore validator node.
//!
//! This crate provides the fundamental types used throughout valcore:
//! - [`Address`] - 20-byte account/validator addresses
//! - [`H256`] - 32-byte SHA-256 hashes
//! - [`Transaction`] - value-transfer transactions
//! - [`Block`] and [`BlockHeader`] - block structures
//! - [`Signer`] - the injected signing seam
//!
//! ## Example
//!
//! ```rust
//! use valcore_types::{Address, H256};
//!
//! let addr: Address = "0x742d35cc6634c0532925a3b844bc9e7595f0beb1".parse().unwrap();
//! let hash = H256::sha256(b"hello world");
//! assert_ne!(hash, H256::NIL);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod address;
pub mod block;
pub mod crypto;
pub mod hash;
pub mod transaction;

pub use address::Address;
pub use block::{Block, BlockHeader, CommitVote};
pub use crypto::{KeyedSigner, Signature, Signer};
pub use hash::H256;
pub use transaction::{transactions_root, Transaction};

/// Result type alias for valcore type operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when working with valcore types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid hex string
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Invalid length for a fixed-size type
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid address format
    #[error("invalid address format: {0}")]
    InvalidAddress(String),

    /// Invalid hash format
    #[error("invalid hash format: {0}")]
    InvalidHash(String),

}

/// Current wall-clock time as Unix milliseconds.
///
/// Block headers, votes, and wire envelopes all carry millisecond
/// timestamps produced by this helper.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
