//! Checkpoint file holding the full contents of every table.
//!
//! Layout: magic, version byte, u64 payload length, MessagePack payload,
//! CRC32 of the payload. Written to a temporary file and renamed into place,
//! so a crash mid-write leaves the previous checkpoint intact.

use crate::error::{Result, StoreError};
use crate::types::Record;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for snapshot files.
const SNAPSHOT_MAGIC: &[u8; 4] = b"SNP\0";

/// Current snapshot format version.
const SNAPSHOT_VERSION: u8 = 1;

/// Magic, version byte and payload length.
const HEADER_LEN: u64 = 13;

const CHECKSUM_LEN: u64 = 4;

/// Persisted contents of one table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub name: String,
    pub next_id: u64,
    pub records: Vec<Record>,
}

/// Reads and writes the checkpoint file.
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Atomically replace the checkpoint.
    pub fn write(&self, tables: &[TableSnapshot]) -> Result<()> {
        let encoded = rmp_serde::to_vec(tables)?;
        let checksum = crc32fast::hash(&encoded);

        let tmp_path = self.path.with_extension("snap.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;

            file.write_all(SNAPSHOT_MAGIC)?;
            file.write_all(&[SNAPSHOT_VERSION])?;
            file.write_all(&(encoded.len() as u64).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&checksum.to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Load the checkpoint; an absent file means no tables yet.
    pub fn read(&self) -> Result<Vec<TableSnapshot>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        let file_len = file.metadata()?.len();

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid snapshot magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported snapshot version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        if len > file_len.saturating_sub(HEADER_LEN + CHECKSUM_LEN) {
            return Err(StoreError::Corruption("Snapshot length exceeds file".into()));
        }

        let mut encoded = vec![0u8; len as usize];
        file.read_exact(&mut encoded)
            .map_err(|_| StoreError::Corruption("Snapshot truncated".into()))?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)
            .map_err(|_| StoreError::Corruption("Snapshot checksum missing".into()))?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(StoreError::ChecksumMismatch { expected, got });
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }
}
