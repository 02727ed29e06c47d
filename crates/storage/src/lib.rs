//! # Valcore Storage
//!
//! Durable, append-only ledger storage:
//!
//! - [`BlockStore`] - append-only block data file with a write-ahead log,
//!   in-memory height/hash/transaction indices, and periodic atomic index
//!   snapshots.
//! - [`StateStore`] - key-value account state with a deterministic state
//!   root and whole-snapshot atomic persistence.
//!
//! Fork resolution is consensus's job, not storage's: a height, once
//! stored, is never overwritten, and `put_block` rejects any height at or
//! below the latest.

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod block_store;
pub mod state;
pub mod wal;

pub use block_store::{BlockIndexEntry, BlockStore, BlockStoreConfig, TxLocation};
pub use state::StateStore;
pub use wal::{BlockWal, WalEntry};

use valcore_types::Address;

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors raised by the ledger store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A file was written by an unsupported format version
    #[error("unsupported format version {version} in {file}")]
    UnsupportedVersion {
        /// Version found
        version: u8,
        /// File that failed the check
        file: String,
    },

    /// On-disk data failed an integrity check
    #[error("corrupted data at offset {offset}: {message}")]
    Corrupted {
        /// Byte offset of the bad record
        offset: u64,
        /// What failed
        message: String,
    },

    /// `put_block` with a height at or below the latest stored height
    #[error("non-monotonic height {height} (latest is {latest})")]
    NonMonotonicHeight {
        /// Rejected height
        height: u64,
        /// Latest stored height
        latest: u64,
    },

    /// A block's parent hash does not match the stored predecessor
    #[error("parent hash mismatch at height {height}")]
    ParentMismatch {
        /// Height of the offending block
        height: u64,
    },

    /// Serialization or deserialization failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Account balance cannot cover a debit
    #[error("insufficient balance for {address}: have {balance}, need {required}")]
    InsufficientBalance {
        /// Debited account
        address: Address,
        /// Current balance
        balance: u128,
        /// Required amount
        required: u128,
    },

    /// Balance arithmetic overflowed
    #[error("balance overflow for {address}")]
    BalanceOverflow {
        /// Credited account
        address: Address,
    },
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}
