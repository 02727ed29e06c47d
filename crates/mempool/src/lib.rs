//! # Valcore Mempool
//!
//! Bounded pending-transaction pool. Admission is capped by total size and
//! by a per-account pending count (both reject rather than evict, a basic
//! back-pressure and anti-spam control). Proposal selection orders by
//! descending gas price with ties broken by arrival order.

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

mod pool;

pub use pool::{Mempool, MempoolConfig};

use valcore_types::{Address, H256};

/// Result alias for mempool operations.
pub type Result<T> = std::result::Result<T, MempoolError>;

/// Mempool admission errors.
#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    /// The pool is at its total-size cap
    #[error("mempool full ({max} transactions)")]
    PoolFull {
        /// Configured cap
        max: usize,
    },

    /// The sender already has the maximum pending transactions
    #[error("account {address} has {max} pending transactions")]
    AccountLimit {
        /// Sending account
        address: Address,
        /// Configured per-account cap
        max: usize,
    },

    /// The transaction is already pooled
    #[error("transaction {0} already in mempool")]
    Duplicate(H256),

    /// The transaction carries no signature
    #[error("transaction {0} is unsigned")]
    Unsigned(H256),

    /// Value plus maximum fee overflows
    #[error("transaction {0} cost overflows")]
    CostOverflow(H256),
}
