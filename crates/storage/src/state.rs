//! Key-value account state with a deterministic state root.
//!
//! The state is a flat string key-value table. Balances and nonces are
//! stored under `balance:<address>` and `nonce:<address>` keys as decimal
//! strings, so the whole table stays human-inspectable in the snapshot
//! file. The state root hashes all (key, value) pairs in key order, which
//! lets independently-operated nodes verify they converged after applying
//! the same block sequence.

use crate::{Result, StorageError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use valcore_types::{Address, H256};

/// SHA-256 over sorted (key, value) pairs with length prefixes so that
/// pair boundaries cannot be confused.
fn sha256_pairs(table: &BTreeMap<String, String>) -> H256 {
    let mut data = Vec::new();
    for (key, value) in table {
        data.extend_from_slice(&(key.len() as u32).to_le_bytes());
        data.extend_from_slice(key.as_bytes());
        data.extend_from_slice(&(value.len() as u32).to_le_bytes());
        data.extend_from_slice(value.as_bytes());
    }
    H256::sha256(&data)
}

/// In-memory account state, whole-snapshot persisted via
/// write-temp-then-rename.
pub struct StateStore {
    path: PathBuf,
    table: RwLock<BTreeMap<String, String>>,
}

impl StateStore {
    /// Opens the state store, loading the snapshot at `path` if present.
    pub fn open(path: &Path) -> Result<Self> {
        let table = if path.exists() {
            let loaded: BTreeMap<String, String> = serde_json::from_reader(File::open(path)?)?;
            info!(path = %path.display(), keys = loaded.len(), "state snapshot loaded");
            loaded
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            table: RwLock::new(table),
        })
    }

    /// Raw get.
    pub fn get(&self, key: &str) -> Option<String> {
        self.table.read().get(key).cloned()
    }

    /// Raw set.
    pub fn set(&self, key: &str, value: &str) {
        self.table.write().insert(key.to_string(), value.to_string());
    }

    /// Raw delete; returns whether the key existed.
    pub fn delete(&self, key: &str) -> bool {
        self.table.write().remove(key).is_some()
    }

    /// Raw existence check.
    pub fn has(&self, key: &str) -> bool {
        self.table.read().contains_key(key)
    }

    fn balance_key(address: &Address) -> String {
        format!("balance:{address}")
    }

    fn nonce_key(address: &Address) -> String {
        format!("nonce:{address}")
    }

    /// Account balance; missing accounts have balance 0.
    pub fn get_balance(&self, address: &Address) -> u128 {
        self.get(&Self::balance_key(address))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Sets an account balance.
    pub fn set_balance(&self, address: &Address, balance: u128) {
        self.set(&Self::balance_key(address), &balance.to_string());
    }

    /// Account nonce; missing accounts have nonce 0.
    pub fn get_nonce(&self, address: &Address) -> u64 {
        self.get(&Self::nonce_key(address))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Sets an account nonce.
    pub fn set_nonce(&self, address: &Address, nonce: u64) {
        self.set(&Self::nonce_key(address), &nonce.to_string());
    }

    /// Adds to an account balance with overflow checking.
    pub fn credit(&self, address: &Address, amount: u128) -> Result<()> {
        let balance = self.get_balance(address);
        let new_balance = balance
            .checked_add(amount)
            .ok_or(StorageError::BalanceOverflow { address: *address })?;
        self.set_balance(address, new_balance);
        Ok(())
    }

    /// Subtracts from an account balance, failing if funds are short.
    pub fn debit(&self, address: &Address, amount: u128) -> Result<()> {
        let balance = self.get_balance(address);
        if balance < amount {
            return Err(StorageError::InsufficientBalance {
                address: *address,
                balance,
                required: amount,
            });
        }
        self.set_balance(address, balance - amount);
        Ok(())
    }

    /// Deterministic commitment to the current state: SHA-256 over all
    /// (key, value) pairs in key order.
    pub fn compute_state_root(&self) -> H256 {
        sha256_pairs(&self.table.read())
    }

    /// Persists the whole table atomically (temp file + rename).
    pub fn save(&self) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let table = self.table.read();
            let mut tmp = File::create(&tmp_path)?;
            serde_json::to_writer(&mut tmp, &*table)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        debug!(path = %self.path.display(), "state snapshot saved");
        Ok(())
    }

    /// Number of keys in the table.
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}
