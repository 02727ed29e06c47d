//! Append-only block store.
//!
//! On-disk layout inside the store directory:
//!
//! - `blocks.dat` - append-only block records (bincode-encoded [`Block`]s)
//! - `blocks.wal` - write-ahead log, one entry per append
//! - `index.json` - atomically-replaced snapshot of the block/tx indices
//!
//! Write order for every `put_block`: WAL entry first, then the data-file
//! append, then the in-memory index update. The index snapshot is persisted
//! every `index_snapshot_interval` blocks via write-temp-then-rename, after
//! which the WAL is reset. Recovery loads the snapshot and replays whatever
//! the WAL still covers.

use crate::wal::{BlockWal, WalEntry};
use crate::{Result, StorageError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use valcore_types::{Block, Transaction, H256};

const DATA_FILE: &str = "blocks.dat";
const WAL_FILE: &str = "blocks.wal";
const INDEX_FILE: &str = "index.json";

/// Block store tuning knobs.
#[derive(Debug, Clone)]
pub struct BlockStoreConfig {
    /// Persist the index snapshot every this many blocks
    pub index_snapshot_interval: u64,
    /// Heights retained by [`BlockStore::prune`] (0 disables pruning)
    pub retention_window: u64,
    /// Pruning floor: never prune above `latest - min_sync_retention`
    pub min_sync_retention: u64,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            index_snapshot_interval: 16,
            retention_window: 0,
            min_sync_retention: 1_024,
        }
    }
}

/// One stored block, as tracked by the height and hash indices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIndexEntry {
    /// Block height
    pub height: u64,
    /// Block hash
    pub hash: H256,
    /// Byte offset in `blocks.dat`
    pub offset: u64,
    /// Record length in bytes
    pub length: u64,
    /// Block timestamp in Unix milliseconds
    pub timestamp: u64,
}

/// Where a transaction lives: which block, and where inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLocation {
    /// Height of the containing block
    pub height: u64,
    /// Hash of the containing block
    pub block_hash: H256,
    /// Position within the block's transaction list
    pub position: u32,
}

/// Persisted form of the indices.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexSnapshot {
    latest_height: Option<u64>,
    entries: Vec<BlockIndexEntry>,
    tx_index: Vec<(H256, TxLocation)>,
}

#[derive(Default)]
struct Indexes {
    by_height: BTreeMap<u64, BlockIndexEntry>,
    by_hash: HashMap<H256, u64>,
    tx_index: HashMap<H256, TxLocation>,
    latest_height: Option<u64>,
    blocks_since_snapshot: u64,
}

/// Serialized write path: the data file cursor and the WAL move together.
struct WriteHalf {
    file: File,
    append_pos: u64,
    wal: BlockWal,
}

/// Append-only block store with WAL-backed crash recovery.
pub struct BlockStore {
    dir: PathBuf,
    config: BlockStoreConfig,
    write: Mutex<WriteHalf>,
    read: Mutex<File>,
    indexes: RwLock<Indexes>,
}

impl BlockStore {
    /// Opens (or creates) a block store in the given directory and runs
    /// crash recovery.
    pub fn open(dir: &Path, config: BlockStoreConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let data_path = dir.join(DATA_FILE);
        let data_file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&data_path)?;
        let append_pos = data_file.metadata()?.len();
        let read_file = File::open(&data_path)?;

        let mut indexes = Indexes::default();
        let index_path = dir.join(INDEX_FILE);
        if index_path.exists() {
            let snapshot: IndexSnapshot =
                serde_json::from_reader(File::open(&index_path)?)?;
            for entry in snapshot.entries {
                indexes.by_hash.insert(entry.hash, entry.height);
                indexes.by_height.insert(entry.height, entry);
            }
            for (hash, loc) in snapshot.tx_index {
                indexes.tx_index.insert(hash, loc);
            }
            indexes.latest_height = snapshot.latest_height;
        }

        let (wal, recovered) = BlockWal::open(&dir.join(WAL_FILE))?;

        let store = Self {
            dir: dir.to_path_buf(),
            config,
            write: Mutex::new(WriteHalf {
                file: data_file,
                append_pos,
                wal,
            }),
            read: Mutex::new(read_file),
            indexes: RwLock::new(indexes),
        };

        store.replay_wal(recovered)?;

        let latest = store.latest_height();
        info!(
            dir = %dir.display(),
            latest_height = ?latest,
            "block store opened"
        );
        Ok(store)
    }

    /// Replays WAL entries not covered by the index snapshot, verifying
    /// that the logged data actually reached the data file.
    fn replay_wal(&self, entries: Vec<WalEntry>) -> Result<()> {
        for entry in entries {
            let known = {
                let idx = self.indexes.read();
                idx.by_height.contains_key(&entry.height)
            };
            if known {
                continue;
            }

            let data_len = self.write.lock().append_pos;
            if entry.offset + entry.length > data_len {
                // Crash hit between the WAL append and the data write.
                warn!(
                    height = entry.height,
                    "WAL entry without matching data, dropping"
                );
                break;
            }

            let bytes = self.read_record(entry.offset, entry.length)?;
            let block: Block = bincode::deserialize(&bytes)?;
            if block.hash() != entry.hash {
                return Err(StorageError::Corrupted {
                    offset: entry.offset,
                    message: format!("block hash mismatch at height {}", entry.height),
                });
            }

            debug!(height = entry.height, "replaying block from WAL");
            self.index_block(&block, &entry);
        }
        Ok(())
    }

    /// Stores a block. Fails for any height at or below the latest stored
    /// height and for parent-hash mismatches; fork resolution belongs to
    /// consensus, never to storage.
    pub fn put_block(&self, block: &Block) -> Result<()> {
        let height = block.height();
        let hash = block.hash();

        {
            let idx = self.indexes.read();
            if let Some(latest) = idx.latest_height {
                if height <= latest {
                    return Err(StorageError::NonMonotonicHeight { height, latest });
                }
                if height == latest + 1 {
                    if let Some(prev) = idx.by_height.get(&latest) {
                        if block.header.parent_hash != prev.hash {
                            return Err(StorageError::ParentMismatch { height });
                        }
                    }
                }
            }
        }

        let bytes = bincode::serialize(block)?;

        let entry = {
            let mut write = self.write.lock();
            let entry = WalEntry {
                height,
                hash,
                offset: write.append_pos,
                length: bytes.len() as u64,
                timestamp: block.header.timestamp,
            };

            // WAL first, then data, in that order.
            write.wal.append(&entry)?;
            write.file.write_all(&bytes)?;
            write.file.sync_data()?;
            write.append_pos += bytes.len() as u64;
            entry
        };

        self.index_block(block, &entry);
        debug!(height = height, hash = %hash, size = bytes.len(), "block stored");

        let snapshot_due = {
            let idx = self.indexes.read();
            idx.blocks_since_snapshot >= self.config.index_snapshot_interval
        };
        if snapshot_due {
            self.persist_index()?;
        }

        Ok(())
    }

    fn index_block(&self, block: &Block, entry: &WalEntry) {
        let mut idx = self.indexes.write();
        idx.by_hash.insert(entry.hash, entry.height);
        for (pos, tx) in block.transactions.iter().enumerate() {
            idx.tx_index.insert(
                tx.hash(),
                TxLocation {
                    height: entry.height,
                    block_hash: entry.hash,
                    position: pos as u32,
                },
            );
        }
        idx.by_height.insert(
            entry.height,
            BlockIndexEntry {
                height: entry.height,
                hash: entry.hash,
                offset: entry.offset,
                length: entry.length,
                timestamp: entry.timestamp,
            },
        );
        idx.latest_height = Some(match idx.latest_height {
            Some(latest) => latest.max(entry.height),
            None => entry.height,
        });
        idx.blocks_since_snapshot += 1;
    }

    /// Writes the index snapshot atomically (temp file + rename) and
    /// resets the WAL.
    pub fn persist_index(&self) -> Result<()> {
        let snapshot = {
            let idx = self.indexes.read();
            IndexSnapshot {
                latest_height: idx.latest_height,
                entries: idx.by_height.values().cloned().collect(),
                tx_index: idx
                    .tx_index
                    .iter()
                    .map(|(h, loc)| (*h, loc.clone()))
                    .collect(),
            }
        };

        let tmp_path = self.dir.join(format!("{INDEX_FILE}.tmp"));
        let final_path = self.dir.join(INDEX_FILE);
        {
            let mut tmp = File::create(&tmp_path)?;
            serde_json::to_writer(&mut tmp, &snapshot)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;

        {
            let mut write = self.write.lock();
            write.wal.reset()?;
        }
        self.indexes.write().blocks_since_snapshot = 0;

        debug!(
            entries = snapshot.entries.len(),
            "index snapshot persisted"
        );
        Ok(())
    }

    fn read_record(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut read = self.read.lock();
        read.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        read.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Returns the exact stored bytes of the block at the given height.
    pub fn get_block_bytes(&self, height: u64) -> Result<Option<Vec<u8>>> {
        let entry = {
            let idx = self.indexes.read();
            idx.by_height.get(&height).cloned()
        };
        match entry {
            Some(e) => Ok(Some(self.read_record(e.offset, e.length)?)),
            None => Ok(None),
        }
    }

    /// Returns the block at the given height, if stored.
    pub fn get_block_by_height(&self, height: u64) -> Result<Option<Block>> {
        match self.get_block_bytes(height)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Returns the block with the given hash, if stored.
    pub fn get_block_by_hash(&self, hash: &H256) -> Result<Option<Block>> {
        let height = {
            let idx = self.indexes.read();
            idx.by_hash.get(hash).copied()
        };
        match height {
            Some(h) => self.get_block_by_height(h),
            None => Ok(None),
        }
    }

    /// Returns the stored blocks in `[from, to]` height order, skipping
    /// gaps (pruned heights).
    pub fn get_blocks_in_range(&self, from: u64, to: u64) -> Result<Vec<Block>> {
        let heights: Vec<u64> = {
            let idx = self.indexes.read();
            idx.by_height.range(from..=to).map(|(h, _)| *h).collect()
        };
        let mut blocks = Vec::with_capacity(heights.len());
        for h in heights {
            if let Some(block) = self.get_block_by_height(h)? {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }

    /// Looks up a transaction by hash.
    pub fn get_transaction(&self, hash: &H256) -> Result<Option<(Transaction, TxLocation)>> {
        let loc = {
            let idx = self.indexes.read();
            idx.tx_index.get(hash).cloned()
        };
        let Some(loc) = loc else {
            return Ok(None);
        };
        let Some(block) = self.get_block_by_height(loc.height)? else {
            return Ok(None);
        };
        Ok(block
            .transactions
            .into_iter()
            .nth(loc.position as usize)
            .map(|tx| (tx, loc)))
    }

    /// Latest stored height, if any block is stored.
    pub fn latest_height(&self) -> Option<u64> {
        self.indexes.read().latest_height
    }

    /// Index entry for a height, if stored.
    pub fn index_entry(&self, height: u64) -> Option<BlockIndexEntry> {
        self.indexes.read().by_height.get(&height).cloned()
    }

    /// Drops index entries below the retention floor.
    ///
    /// The floor is `latest - max(retention_window, min_sync_retention)`;
    /// with `retention_window == 0` pruning is disabled. The data file is
    /// append-only and keeps the bytes either way.
    pub fn prune(&self) -> Result<u64> {
        if self.config.retention_window == 0 {
            return Ok(0);
        }
        let Some(latest) = self.latest_height() else {
            return Ok(0);
        };
        let keep = self
            .config
            .retention_window
            .max(self.config.min_sync_retention);
        let floor = latest.saturating_sub(keep);
        if floor == 0 {
            return Ok(0);
        }

        let mut pruned = 0u64;
        {
            let mut idx = self.indexes.write();
            let below: Vec<u64> = idx.by_height.range(..floor).map(|(h, _)| *h).collect();
            for h in below {
                if let Some(entry) = idx.by_height.remove(&h) {
                    idx.by_hash.remove(&entry.hash);
                    pruned += 1;
                }
            }
            idx.tx_index.retain(|_, loc| loc.height >= floor);
        }
        if pruned > 0 {
            info!(floor = floor, pruned = pruned, "pruned block index");
            self.persist_index()?;
        }
        Ok(pruned)
    }
}
