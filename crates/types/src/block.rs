//! Block and BlockHeader types.

use crate::{Address, Signature, Transaction, H256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A block header containing block metadata and state commitments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block height (genesis is height 0)
    pub height: u64,
    /// Hash of the parent block (NIL for genesis)
    pub parent_hash: H256,
    /// Commitment to the world state after applying this block
    pub state_root: H256,
    /// Commitment to the ordered transaction list
    pub transactions_root: H256,
    /// Unix timestamp in milliseconds
    pub timestamp: u64,
    /// Address of the block proposer
    pub proposer: Address,
    /// Proposer signature over the header signing bytes
    pub signature: Signature,
}

impl BlockHeader {
    /// The bytes covered by the proposer's signature and the block hash.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(132);
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(self.parent_hash.as_bytes());
        data.extend_from_slice(self.state_root.as_bytes());
        data.extend_from_slice(self.transactions_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(self.proposer.as_bytes());
        data
    }

    /// Computes the block hash: SHA-256 over the header signing bytes.
    ///
    /// The signature is excluded so the hash is stable across signing.
    pub fn hash(&self) -> H256 {
        H256::sha256(&self.signing_bytes())
    }
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            height: 0,
            parent_hash: H256::NIL,
            state_root: H256::NIL,
            transactions_root: H256::NIL,
            timestamp: 0,
            proposer: Address::ZERO,
            signature: Signature::empty(),
        }
    }
}

/// A commit vote as embedded in a stored block.
///
/// This is the storage-side record of the commit-phase votes that finalized
/// the block; the live consensus vote type converts into it at finalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitVote {
    /// Voting validator
    pub validator: Address,
    /// Round the vote was cast in; the signature covers it, so verifiers
    /// need it to reconstruct the signed bytes
    pub round: u64,
    /// Hash the validator committed to
    pub block_hash: H256,
    /// Validator signature
    pub signature: Signature,
    /// Vote timestamp in Unix milliseconds
    pub timestamp: u64,
}

/// A complete block: header, transactions, and the commit votes that
/// finalized it. Write-once; never mutated after storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block header
    pub header: BlockHeader,
    /// Ordered transaction list
    pub transactions: Vec<Transaction>,
    /// Commit votes proving finalization
    pub commit_votes: Vec<CommitVote>,
    /// Approximate encoded size in bytes
    pub size: u64,
}

impl Block {
    /// Builds a block and fills in its `size` field.
    pub fn new(
        header: BlockHeader,
        transactions: Vec<Transaction>,
        commit_votes: Vec<CommitVote>,
    ) -> Self {
        let size = (132
            + transactions.iter().map(Transaction::size).sum::<usize>()
            + commit_votes.len() * 120) as u64;
        Self {
            header,
            transactions,
            commit_votes,
            size,
        }
    }

    /// Block height shortcut.
    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Block hash shortcut.
    pub fn hash(&self) -> H256 {
        self.header.hash()
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block(height={}, hash={}, txs={})",
            self.header.height,
            self.hash(),
            self.transactions.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_hash_ignores_signature() {
        let mut header = BlockHeader {
            height: 5,
            timestamp: 123,
            ..Default::default()
        };
        let h1 = header.hash();
        header.signature = Signature::from_bytes(vec![1, 2, 3]);
        assert_eq!(header.hash(), h1);
    }

    #[test]
    fn test_header_hash_changes_with_height() {
        let a = BlockHeader {
            height: 1,
            ..Default::default()
        };
        let b = BlockHeader {
            height: 2,
            ..Default::default()
        };
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_block_serde_round_trip() {
        let block = Block::new(
            BlockHeader {
                height: 9,
                timestamp: 42,
                ..Default::default()
            },
            vec![],
            vec![CommitVote {
                validator: Address::from([3u8; 20]),
                round: 0,
                block_hash: H256::sha256(b"x"),
                signature: Signature::empty(),
                timestamp: 42,
            }],
        );
        let json = serde_json::to_string(&block).unwrap();
        let decoded: Block = serde_json::from_str(&json).unwrap();
        assert_eq!(block, decoded);
    }
}
