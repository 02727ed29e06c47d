//! Integration tests for the append-only block store.

use tempfile::TempDir;
use valcore_storage::{BlockStore, BlockStoreConfig, StorageError};
use valcore_types::{transaction::transactions_root, Address, Block, BlockHeader, Signature, Transaction, H256};

fn open_store(dir: &TempDir) -> BlockStore {
    BlockStore::open(dir.path(), BlockStoreConfig::default()).unwrap()
}

fn make_tx(nonce: u64) -> Transaction {
    Transaction {
        from: Address::from([1u8; 20]),
        to: Address::from([2u8; 20]),
        value: 100,
        nonce,
        gas_limit: 21_000,
        gas_price: 50,
        payload: vec![],
        signature: Signature::empty(),
    }
}

fn make_block(height: u64, parent_hash: H256, txs: Vec<Transaction>) -> Block {
    let header = BlockHeader {
        height,
        parent_hash,
        state_root: H256::sha256(&height.to_le_bytes()),
        transactions_root: transactions_root(&txs),
        timestamp: 1_700_000_000_000 + height,
        proposer: Address::from([9u8; 20]),
        signature: Signature::empty(),
    };
    Block::new(header, txs, vec![])
}

fn make_chain(n: u64) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut parent = H256::NIL;
    for h in 0..n {
        let block = make_block(h, parent, vec![make_tx(h)]);
        parent = block.hash();
        blocks.push(block);
    }
    blocks
}

#[test]
fn test_put_and_get_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let block = make_block(0, H256::NIL, vec![make_tx(0), make_tx(1)]);
    store.put_block(&block).unwrap();

    let by_height = store.get_block_by_height(0).unwrap().unwrap();
    assert_eq!(by_height, block);

    let by_hash = store.get_block_by_hash(&block.hash()).unwrap().unwrap();
    assert_eq!(by_hash, block);
}

#[test]
fn test_duplicate_height_rejected_without_index_mutation() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let block = make_block(0, H256::NIL, vec![]);
    store.put_block(&block).unwrap();
    let entry_before = store.index_entry(0).unwrap();

    // Same height, different content.
    let mut conflicting = make_block(0, H256::NIL, vec![make_tx(0)]);
    conflicting.header.timestamp += 1;
    let err = store.put_block(&conflicting).unwrap_err();
    assert!(matches!(err, StorageError::NonMonotonicHeight { .. }));

    // Index entry untouched, stored bytes unchanged.
    assert_eq!(store.index_entry(0).unwrap(), entry_before);
    let stored = store.get_block_by_height(0).unwrap().unwrap();
    assert_eq!(stored, block);
}

#[test]
fn test_lower_height_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    for block in make_chain(3) {
        store.put_block(&block).unwrap();
    }
    assert_eq!(store.latest_height(), Some(2));

    let err = store.put_block(&make_block(1, H256::NIL, vec![])).unwrap_err();
    assert!(matches!(
        err,
        StorageError::NonMonotonicHeight { height: 1, latest: 2 }
    ));
}

#[test]
fn test_parent_hash_mismatch_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let genesis = make_block(0, H256::NIL, vec![]);
    store.put_block(&genesis).unwrap();

    let orphan = make_block(1, H256::sha256(b"wrong parent"), vec![]);
    assert!(matches!(
        store.put_block(&orphan).unwrap_err(),
        StorageError::ParentMismatch { height: 1 }
    ));
}

#[test]
fn test_get_block_bytes_identical() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let block = make_block(0, H256::NIL, vec![make_tx(0)]);
    store.put_block(&block).unwrap();

    let bytes = store.get_block_bytes(0).unwrap().unwrap();
    let expected = bincode::serialize(&block).unwrap();
    assert_eq!(bytes, expected);
}

#[test]
fn test_get_blocks_in_range() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    for block in make_chain(5) {
        store.put_block(&block).unwrap();
    }

    let blocks = store.get_blocks_in_range(1, 3).unwrap();
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[0].height(), 1);
    assert_eq!(blocks[2].height(), 3);
}

#[test]
fn test_get_transaction() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let tx = make_tx(42);
    let tx_hash = tx.hash();
    let block = make_block(0, H256::NIL, vec![make_tx(0), tx.clone()]);
    store.put_block(&block).unwrap();

    let (found, loc) = store.get_transaction(&tx_hash).unwrap().unwrap();
    assert_eq!(found, tx);
    assert_eq!(loc.height, 0);
    assert_eq!(loc.position, 1);
    assert_eq!(loc.block_hash, block.hash());

    assert!(store.get_transaction(&H256::sha256(b"missing")).unwrap().is_none());
}

#[test]
fn test_reopen_recovers_from_wal() {
    let dir = TempDir::new().unwrap();
    let chain = make_chain(4);

    {
        // Snapshot interval high enough that nothing is snapshotted; all
        // four blocks live only in the WAL + data file.
        let store = BlockStore::open(
            dir.path(),
            BlockStoreConfig {
                index_snapshot_interval: 100,
                ..Default::default()
            },
        )
        .unwrap();
        for block in &chain {
            store.put_block(block).unwrap();
        }
    }

    let store = open_store(&dir);
    assert_eq!(store.latest_height(), Some(3));
    for block in &chain {
        let stored = store.get_block_by_height(block.height()).unwrap().unwrap();
        assert_eq!(&stored, block);
        assert_eq!(
            store.get_block_by_hash(&block.hash()).unwrap().unwrap(),
            *block
        );
    }
}

#[test]
fn test_reopen_after_snapshot() {
    let dir = TempDir::new().unwrap();
    let chain = make_chain(6);

    {
        let store = BlockStore::open(
            dir.path(),
            BlockStoreConfig {
                index_snapshot_interval: 2,
                ..Default::default()
            },
        )
        .unwrap();
        for block in &chain {
            store.put_block(block).unwrap();
        }
    }

    let store = open_store(&dir);
    assert_eq!(store.latest_height(), Some(5));
    let stored = store.get_block_by_height(5).unwrap().unwrap();
    assert_eq!(stored, chain[5]);
}

#[test]
fn test_prune_respects_sync_floor() {
    let dir = TempDir::new().unwrap();
    let store = BlockStore::open(
        dir.path(),
        BlockStoreConfig {
            index_snapshot_interval: 100,
            retention_window: 2,
            min_sync_retention: 3,
        },
    )
    .unwrap();

    for block in make_chain(10) {
        store.put_block(&block).unwrap();
    }

    // Floor = 9 - max(2, 3) = 6: heights 0..=5 go, 6..=9 stay.
    let pruned = store.prune().unwrap();
    assert_eq!(pruned, 6);
    assert!(store.get_block_by_height(5).unwrap().is_none());
    assert!(store.get_block_by_height(6).unwrap().is_some());
    assert_eq!(store.latest_height(), Some(9));
}
