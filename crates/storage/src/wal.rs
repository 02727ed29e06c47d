//! Write-ahead log for block appends.
//!
//! Every `put_block` writes a WAL entry before touching the data file, so a
//! crash between the two leaves a recoverable trail. Entries use a simple
//! binary framing with CRC32 integrity:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Magic "VCWL" (4 bytes)                       │
//! │ Version (1 byte)                             │
//! │ Entry type (1 byte)                          │
//! │ Payload length (4 bytes, little-endian)      │
//! │ Payload (bincode-encoded WalEntry)           │
//! │ CRC32 checksum (4 bytes, little-endian)      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Recovery scans entries from the start and stops at the first torn or
//! corrupt record; a truncated tail is tolerated (the crash happened
//! mid-append), anything recovered before it is replayed against the data
//! file. The log is reset whenever the index snapshot is persisted, since
//! everything below the snapshot is already durable.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use valcore_types::H256;

/// WAL file magic bytes: "VCWL"
const WAL_MAGIC: [u8; 4] = [0x56, 0x43, 0x57, 0x4C];

/// Current WAL format version
const WAL_VERSION: u8 = 1;

/// Fixed header size: magic + version + type + payload length
const HEADER_SIZE: usize = 10;

/// CRC32 checksum size
const CRC_SIZE: usize = 4;

/// Entry type: a block append about to hit the data file.
const ENTRY_BLOCK_PUT: u8 = 1;

/// A logged block append: the index entry the data-file write will create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Block height
    pub height: u64,
    /// Block hash
    pub hash: H256,
    /// Byte offset the block record starts at in the data file
    pub offset: u64,
    /// Byte length of the block record
    pub length: u64,
    /// Block timestamp in Unix milliseconds
    pub timestamp: u64,
}

impl WalEntry {
    /// Encodes the entry with framing and checksum.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&WAL_MAGIC);
        data.push(WAL_VERSION);
        data.push(ENTRY_BLOCK_PUT);
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&payload);

        let crc = crc32_checksum(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }
}

/// Append-only write-ahead log for block appends.
pub struct BlockWal {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl BlockWal {
    /// Opens the WAL, recovering any entries already on disk.
    ///
    /// Returns the log handle (positioned for appends) and the recovered
    /// entries in write order.
    pub fn open(path: &Path) -> Result<(Self, Vec<WalEntry>)> {
        let entries = if path.exists() {
            Self::recover(path)?
        } else {
            Vec::new()
        };

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        Ok((
            Self {
                path: path.to_path_buf(),
                writer: BufWriter::new(file),
            },
            entries,
        ))
    }

    /// Appends an entry and syncs it to disk.
    ///
    /// The entry must be durable before the data-file write happens, so
    /// this flushes and fsyncs on every append.
    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        let bytes = entry.to_bytes()?;
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Truncates the log. Called after the index snapshot is persisted;
    /// everything logged so far is covered by the snapshot.
    pub fn reset(&mut self) -> Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.sync_data()?;
        debug!(path = %self.path.display(), "WAL reset");
        Ok(())
    }

    /// Scans the log from the start, returning every intact entry.
    fn recover(path: &Path) -> Result<Vec<WalEntry>> {
        let mut file = File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;

        while offset < data.len() {
            if data.len() - offset < HEADER_SIZE + CRC_SIZE {
                warn!(offset = offset, "truncated WAL tail, stopping recovery");
                break;
            }

            let frame = &data[offset..];
            if frame[..4] != WAL_MAGIC {
                warn!(offset = offset, "bad magic in WAL, stopping recovery");
                break;
            }
            let version = frame[4];
            if version != WAL_VERSION {
                return Err(StorageError::UnsupportedVersion {
                    version,
                    file: path.display().to_string(),
                });
            }
            let entry_type = frame[5];
            let payload_len = u32::from_le_bytes([frame[6], frame[7], frame[8], frame[9]]) as usize;
            let total_len = HEADER_SIZE + payload_len + CRC_SIZE;

            if frame.len() < total_len {
                warn!(offset = offset, "truncated WAL entry, stopping recovery");
                break;
            }

            let stored_crc = u32::from_le_bytes([
                frame[HEADER_SIZE + payload_len],
                frame[HEADER_SIZE + payload_len + 1],
                frame[HEADER_SIZE + payload_len + 2],
                frame[HEADER_SIZE + payload_len + 3],
            ]);
            let computed_crc = crc32_checksum(&frame[..HEADER_SIZE + payload_len]);
            if stored_crc != computed_crc {
                warn!(
                    offset = offset,
                    stored = format!("{stored_crc:#x}"),
                    computed = format!("{computed_crc:#x}"),
                    "CRC mismatch in WAL, stopping recovery"
                );
                break;
            }

            if entry_type != ENTRY_BLOCK_PUT {
                return Err(StorageError::Corrupted {
                    offset: offset as u64,
                    message: format!("unknown WAL entry type {entry_type}"),
                });
            }

            let entry: WalEntry =
                bincode::deserialize(&frame[HEADER_SIZE..HEADER_SIZE + payload_len])?;
            entries.push(entry);
            offset += total_len;
        }

        debug!(
            path = %path.display(),
            entries = entries.len(),
            "WAL recovery complete"
        );
        Ok(entries)
    }
}

/// CRC32 (IEEE polynomial 0xEDB88320) over the given bytes.
pub(crate) fn crc32_checksum(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = generate_crc32_table();
    let mut crc = 0xFFFF_FFFFu32;
    for byte in data {
        let index = ((crc ^ (*byte as u32)) & 0xFF) as usize;
        crc = TABLE[index] ^ (crc >> 8);
    }
    !crc
}

const fn generate_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = 0xEDB8_8320 ^ (crc >> 1);
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(height: u64) -> WalEntry {
        WalEntry {
            height,
            hash: H256::sha256(&height.to_le_bytes()),
            offset: height * 100,
            length: 100,
            timestamp: 1_700_000_000_000 + height,
        }
    }

    #[test]
    fn test_append_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.wal");

        {
            let (mut wal, recovered) = BlockWal::open(&path).unwrap();
            assert!(recovered.is_empty());
            wal.append(&sample_entry(1)).unwrap();
            wal.append(&sample_entry(2)).unwrap();
        }

        let (_wal, recovered) = BlockWal::open(&path).unwrap();
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].height, 1);
        assert_eq!(recovered[1].height, 2);
    }

    #[test]
    fn test_truncated_tail_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.wal");

        {
            let (mut wal, _) = BlockWal::open(&path).unwrap();
            wal.append(&sample_entry(1)).unwrap();
            wal.append(&sample_entry(2)).unwrap();
        }

        // Chop a few bytes off the end, simulating a torn write.
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 3]).unwrap();

        let (_wal, recovered) = BlockWal::open(&path).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].height, 1);
    }

    #[test]
    fn test_corrupt_crc_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.wal");

        {
            let (mut wal, _) = BlockWal::open(&path).unwrap();
            wal.append(&sample_entry(1)).unwrap();
        }

        // Flip a payload byte.
        let mut data = std::fs::read(&path).unwrap();
        let mid = HEADER_SIZE + 2;
        data[mid] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let (_wal, recovered) = BlockWal::open(&path).unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn test_reset_clears_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocks.wal");

        {
            let (mut wal, _) = BlockWal::open(&path).unwrap();
            wal.append(&sample_entry(1)).unwrap();
            wal.reset().unwrap();
            wal.append(&sample_entry(9)).unwrap();
        }

        let (_wal, recovered) = BlockWal::open(&path).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].height, 9);
    }

    #[test]
    fn test_crc32_known_value() {
        // CRC32("123456789") = 0xCBF43926, the classic check value
        assert_eq!(crc32_checksum(b"123456789"), 0xCBF4_3926);
    }
}
