//! The transaction pool.

use crate::{MempoolError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, trace};
use valcore_types::{Address, Transaction, H256};

/// Mempool limits.
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Pool-wide transaction cap
    pub max_size: usize,
    /// Pending transactions allowed per sending account
    pub max_pending_per_account: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_pending_per_account: 64,
        }
    }
}

struct PooledTx {
    tx: Transaction,
    /// Arrival order, for gas-price ties
    seq: u64,
}

#[derive(Default)]
struct Inner {
    by_hash: HashMap<H256, PooledTx>,
    pending_per_account: HashMap<Address, usize>,
    next_seq: u64,
}

/// Bounded pending-transaction pool.
pub struct Mempool {
    config: MempoolConfig,
    inner: RwLock<Inner>,
}

impl Mempool {
    /// Creates an empty pool with the given limits.
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Admits a transaction. Rejects duplicates, unsigned transactions,
    /// overflowing costs, and anything beyond the pool or per-account cap.
    pub fn insert(&self, tx: Transaction) -> Result<H256> {
        let hash = tx.hash();
        if tx.signature.is_empty() {
            return Err(MempoolError::Unsigned(hash));
        }
        if tx.total_cost().is_none() {
            return Err(MempoolError::CostOverflow(hash));
        }

        let mut inner = self.inner.write();
        if inner.by_hash.contains_key(&hash) {
            return Err(MempoolError::Duplicate(hash));
        }
        if inner.by_hash.len() >= self.config.max_size {
            return Err(MempoolError::PoolFull {
                max: self.config.max_size,
            });
        }
        let pending = inner.pending_per_account.get(&tx.from).copied().unwrap_or(0);
        if pending >= self.config.max_pending_per_account {
            return Err(MempoolError::AccountLimit {
                address: tx.from,
                max: self.config.max_pending_per_account,
            });
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        *inner.pending_per_account.entry(tx.from).or_insert(0) += 1;
        trace!(%hash, from = %tx.from, gas_price = %tx.gas_price, "transaction pooled");
        inner.by_hash.insert(hash, PooledTx { tx, seq });
        Ok(hash)
    }

    /// Selects up to `limit` transactions for a proposal: descending gas
    /// price, arrival order on ties.
    pub fn select(&self, limit: usize) -> Vec<Transaction> {
        let inner = self.inner.read();
        let mut pooled: Vec<&PooledTx> = inner.by_hash.values().collect();
        pooled.sort_by(|a, b| {
            b.tx.gas_price
                .cmp(&a.tx.gas_price)
                .then(a.seq.cmp(&b.seq))
        });
        pooled.into_iter().take(limit).map(|p| p.tx.clone()).collect()
    }

    /// Drops the given transactions, typically after block inclusion.
    pub fn remove(&self, hashes: &[H256]) {
        let mut inner = self.inner.write();
        let mut removed = 0usize;
        for hash in hashes {
            if let Some(pooled) = inner.by_hash.remove(hash) {
                removed += 1;
                if let Some(count) = inner.pending_per_account.get_mut(&pooled.tx.from) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        inner.pending_per_account.remove(&pooled.tx.from);
                    }
                }
            }
        }
        if removed > 0 {
            debug!(removed, remaining = inner.by_hash.len(), "mempool pruned");
        }
    }

    /// Whether a transaction is pooled.
    pub fn contains(&self, hash: &H256) -> bool {
        self.inner.read().by_hash.contains_key(hash)
    }

    /// Number of pooled transactions.
    pub fn len(&self) -> usize {
        self.inner.read().by_hash.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_hash.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valcore_types::Signature;

    fn tx(from_byte: u8, nonce: u64, gas_price: u128) -> Transaction {
        Transaction {
            from: Address::from([from_byte; 20]),
            to: Address::from([0xEE; 20]),
            value: 100,
            nonce,
            gas_limit: 21_000,
            gas_price,
            payload: vec![],
            signature: Signature::from_bytes(vec![1; 32]),
        }
    }

    #[test]
    fn test_selection_orders_by_gas_price_then_arrival() {
        let pool = Mempool::new(MempoolConfig::default());
        let cheap = tx(1, 0, 50);
        let dear = tx(2, 0, 100);
        let dear_later = tx(3, 0, 100);
        pool.insert(cheap.clone()).unwrap();
        pool.insert(dear.clone()).unwrap();
        pool.insert(dear_later.clone()).unwrap();

        let selected = pool.select(10);
        assert_eq!(selected.len(), 3);
        assert_eq!(selected[0], dear);
        assert_eq!(selected[1], dear_later);
        assert_eq!(selected[2], cheap);
    }

    #[test]
    fn test_selection_respects_limit() {
        let pool = Mempool::new(MempoolConfig::default());
        for nonce in 0..5 {
            pool.insert(tx(1, nonce, 10)).unwrap();
        }
        assert_eq!(pool.select(2).len(), 2);
    }

    #[test]
    fn test_duplicate_rejected() {
        let pool = Mempool::new(MempoolConfig::default());
        let t = tx(1, 0, 10);
        pool.insert(t.clone()).unwrap();
        assert!(matches!(pool.insert(t), Err(MempoolError::Duplicate(_))));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_pool_cap_rejects() {
        let pool = Mempool::new(MempoolConfig {
            max_size: 2,
            max_pending_per_account: 64,
        });
        pool.insert(tx(1, 0, 10)).unwrap();
        pool.insert(tx(2, 0, 10)).unwrap();
        assert!(matches!(
            pool.insert(tx(3, 0, 10)),
            Err(MempoolError::PoolFull { max: 2 })
        ));
    }

    #[test]
    fn test_account_cap_rejects() {
        let pool = Mempool::new(MempoolConfig {
            max_size: 100,
            max_pending_per_account: 2,
        });
        pool.insert(tx(1, 0, 10)).unwrap();
        pool.insert(tx(1, 1, 10)).unwrap();
        assert!(matches!(
            pool.insert(tx(1, 2, 10)),
            Err(MempoolError::AccountLimit { .. })
        ));
        // Other senders are unaffected
        pool.insert(tx(2, 0, 10)).unwrap();
    }

    #[test]
    fn test_remove_releases_account_slot() {
        let pool = Mempool::new(MempoolConfig {
            max_size: 100,
            max_pending_per_account: 1,
        });
        let hash = pool.insert(tx(1, 0, 10)).unwrap();
        assert!(pool.insert(tx(1, 1, 10)).is_err());

        pool.remove(&[hash]);
        assert!(!pool.contains(&hash));
        pool.insert(tx(1, 1, 10)).unwrap();
    }

    #[test]
    fn test_unsigned_rejected() {
        let pool = Mempool::new(MempoolConfig::default());
        let mut t = tx(1, 0, 10);
        t.signature = Signature::empty();
        assert!(matches!(pool.insert(t), Err(MempoolError::Unsigned(_))));
    }

    #[test]
    fn test_overflowing_cost_rejected() {
        let pool = Mempool::new(MempoolConfig::default());
        let mut t = tx(1, 0, u128::MAX);
        t.gas_limit = u64::MAX;
        assert!(matches!(pool.insert(t), Err(MempoolError::CostOverflow(_))));
    }
}
