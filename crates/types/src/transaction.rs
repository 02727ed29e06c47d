//! Value-transfer transaction type.

use crate::{Address, Signature, H256};
use serde::{Deserialize, Serialize};

/// A signed value-transfer transaction.
///
/// Amounts (`value`, `gas_price`) are `u128`; all fee arithmetic in the node
/// uses checked integer operations, never floating point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender address
    pub from: Address,
    /// Recipient address
    pub to: Address,
    /// Transferred amount in the smallest unit
    pub value: u128,
    /// Sender account nonce
    pub nonce: u64,
    /// Maximum gas the sender pays for
    pub gas_limit: u64,
    /// Price per unit of gas
    pub gas_price: u128,
    /// Opaque payload bytes. Always serialized: skipping empty payloads
    /// would desync bincode, which has no field names to fall back on.
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Sender signature over the signing bytes
    pub signature: Signature,
}

impl Transaction {
    /// Maximum fee this transaction can incur: `gas_limit * gas_price`.
    ///
    /// Returns `None` on overflow.
    pub fn max_fee(&self) -> Option<u128> {
        (self.gas_limit as u128).checked_mul(self.gas_price)
    }

    /// Total amount the sender must cover: `value + gas_limit * gas_price`.
    pub fn total_cost(&self) -> Option<u128> {
        self.max_fee().and_then(|fee| self.value.checked_add(fee))
    }

    /// The bytes covered by the sender's signature.
    ///
    /// Signature itself is excluded so signing and hashing are stable.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(80 + self.payload.len());
        data.extend_from_slice(self.from.as_bytes());
        data.extend_from_slice(self.to.as_bytes());
        data.extend_from_slice(&self.value.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        data.extend_from_slice(&self.gas_limit.to_le_bytes());
        data.extend_from_slice(&self.gas_price.to_le_bytes());
        data.extend_from_slice(&self.payload);
        data
    }

    /// Computes the transaction hash: SHA-256 over the signing bytes.
    pub fn hash(&self) -> H256 {
        H256::sha256(&self.signing_bytes())
    }

    /// Approximate encoded size in bytes, used for mempool accounting.
    pub fn size(&self) -> usize {
        // fixed fields + payload + signature
        80 + self.payload.len() + self.signature.as_bytes().len()
    }
}

/// Computes the transactions root for a block: SHA-256 over the ordered
/// transaction hashes. The empty list yields [`H256::NIL`].
pub fn transactions_root(txs: &[Transaction]) -> H256 {
    if txs.is_empty() {
        return H256::NIL;
    }
    let mut data = Vec::with_capacity(txs.len() * 32);
    for tx in txs {
        data.extend_from_slice(tx.hash().as_bytes());
    }
    H256::sha256(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            from: Address::from([1u8; 20]),
            to: Address::from([2u8; 20]),
            value: 1_000,
            nonce: 7,
            gas_limit: 21_000,
            gas_price: 100,
            payload: vec![],
            signature: Signature::empty(),
        }
    }

    #[test]
    fn test_hash_ignores_signature() {
        let mut tx = sample_tx();
        let h1 = tx.hash();
        tx.signature = Signature::from_bytes(vec![0xAB; 32]);
        assert_eq!(tx.hash(), h1);
    }

    #[test]
    fn test_total_cost() {
        let tx = sample_tx();
        assert_eq!(tx.total_cost(), Some(1_000 + 21_000 * 100));
    }

    #[test]
    fn test_total_cost_overflow() {
        let mut tx = sample_tx();
        tx.gas_price = u128::MAX;
        assert_eq!(tx.total_cost(), None);
    }

    #[test]
    fn test_transactions_root() {
        assert_eq!(transactions_root(&[]), H256::NIL);

        let a = sample_tx();
        let mut b = sample_tx();
        b.nonce = 8;

        let root_ab = transactions_root(&[a.clone(), b.clone()]);
        let root_ba = transactions_root(&[b, a]);
        assert_ne!(root_ab, root_ba); // order matters
    }

    #[test]
    fn test_serde_round_trip() {
        let tx = sample_tx();
        let json = serde_json::to_string(&tx).unwrap();
        let decoded: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(tx, decoded);
    }

    #[test]
    fn test_bincode_round_trip_with_empty_payload() {
        // Block records and WAL entries are bincode; an empty payload
        // must encode and decode like any other.
        let tx = sample_tx();
        assert!(tx.payload.is_empty());
        let bytes = bincode::serialize(&tx).unwrap();
        let decoded: Transaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(tx, decoded);

        let mut with_payload = sample_tx();
        with_payload.payload = vec![0xDE, 0xAD];
        let bytes = bincode::serialize(&with_payload).unwrap();
        let decoded: Transaction = bincode::deserialize(&bytes).unwrap();
        assert_eq!(with_payload, decoded);
    }
}
