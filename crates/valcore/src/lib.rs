//! # Valcore Node
//!
//! The node orchestrator: wires the gossip transport into the consensus
//! engine and the mempool, and applies finalized blocks to the ledger
//! store. The library surface exists for integration tests and embedding;
//! the `valcore` binary is the operational entry point.

#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod node;

pub use node::{Genesis, Node, NodeHandle, NodeStatus, TxOutcome, TxStatus};
