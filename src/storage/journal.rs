//! Write-ahead journal of committed mutations.
//!
//! Every mutation is appended here before it becomes visible in memory.
//! On open the journal is replayed on top of the last checkpoint; a
//! checkpoint then truncates it.
//!
//! Entry framing: u32 length, MessagePack entry, u32 CRC32 of the entry.

use crate::error::{Result, StoreError};
use crate::types::{Fields, Record, RecordId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for journal files.
const JOURNAL_MAGIC: &[u8; 4] = b"JRN\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

const HEADER_LEN: u64 = 5;

/// Mutation recorded in the journal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JournalOp {
    Add(Record),
    BulkAdd(Vec<Record>),
    Update { id: RecordId, patch: Fields },
    Delete { id: RecordId },
    /// Every record removed; ids restart at 1.
    Clear,
}

/// A single journal entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub table: String,
    pub op: JournalOp,
}

struct JournalWriter {
    writer: BufWriter<File>,
    next_seq: u64,
    entries: u64,
    writes_since_sync: u64,
    /// File length up to the end of the last complete append.
    committed_len: u64,
    /// Set when a failed append could not be rolled back; cleared by truncate.
    broken: bool,
    #[cfg(test)]
    fail_after: Option<usize>,
}

/// Append-only mutation journal.
pub struct Journal {
    path: PathBuf,
    inner: Mutex<JournalWriter>,
    /// fsync every N entries (1 = every entry).
    sync_interval: u64,
}

impl Journal {
    /// Open or create a journal, returning it with every intact entry.
    ///
    /// A torn or corrupt tail (left by a crash mid-append) is cut off.
    pub fn open(path: impl AsRef<Path>, sync_interval: u64) -> Result<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();

        let (entries, committed_len) = if path.exists() {
            let (entries, good_len) = Self::read_all(&path)?;
            let file_len = std::fs::metadata(&path)?.len();
            if good_len < file_len {
                tracing::warn!(
                    path = %path.display(),
                    discarded_bytes = file_len - good_len,
                    "discarding torn journal tail"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(good_len)?;
                file.sync_all()?;
            }
            (entries, good_len)
        } else {
            Self::write_header(&path)?;
            (Vec::new(), HEADER_LEN)
        };

        let file = OpenOptions::new().append(true).open(&path)?;
        let next_seq = entries.last().map(|e| e.seq + 1).unwrap_or(1);

        let journal = Self {
            path,
            inner: Mutex::new(JournalWriter {
                writer: BufWriter::new(file),
                next_seq,
                entries: entries.len() as u64,
                writes_since_sync: 0,
                committed_len,
                broken: false,
                #[cfg(test)]
                fail_after: None,
            }),
            sync_interval: sync_interval.max(1),
        };

        Ok((journal, entries))
    }

    /// Append an entry, returning its sequence number.
    pub fn append(&self, table: &str, op: JournalOp) -> Result<u64> {
        self.append_batch(vec![(table.to_string(), op)])
    }

    /// Append entries as one unit, returning the last sequence number.
    ///
    /// On failure the file is cut back to where it was, so either every
    /// entry is replayed after a restart or none is.
    pub fn append_batch(&self, ops: Vec<(String, JournalOp)>) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.broken {
            return Err(StoreError::Corruption(
                "Journal holds a partial write; checkpoint to recover".into(),
            ));
        }

        let first_seq = inner.next_seq;
        let entries: Vec<JournalEntry> = ops
            .into_iter()
            .zip(first_seq..)
            .map(|((table, op), seq)| JournalEntry { seq, table, op })
            .collect();

        match self.write_batch(&mut inner, &entries) {
            Ok(written) => {
                inner.committed_len += written;
                inner.next_seq += entries.len() as u64;
                inner.entries += entries.len() as u64;
                Ok(inner.next_seq - 1)
            }
            Err(e) => {
                if let Err(rollback) = self.roll_back(&mut inner) {
                    tracing::error!(
                        path = %self.path.display(),
                        error = %rollback,
                        "journal rollback failed, refusing further appends"
                    );
                    inner.broken = true;
                }
                Err(e)
            }
        }
    }

    fn write_batch(&self, inner: &mut JournalWriter, entries: &[JournalEntry]) -> Result<u64> {
        let mut written = 0;
        for entry in entries {
            Self::injected_failure(inner)?;
            written += Self::write_entry(&mut inner.writer, entry)?;
        }
        inner.writer.flush()?;

        inner.writes_since_sync += entries.len() as u64;
        if inner.writes_since_sync >= self.sync_interval {
            inner.writer.get_ref().sync_data()?;
            inner.writes_since_sync = 0;
        }
        Ok(written)
    }

    /// Discard buffered bytes and cut the file back to the last complete append.
    fn roll_back(&self, inner: &mut JournalWriter) -> Result<()> {
        let fresh = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        let stale = std::mem::replace(&mut inner.writer, fresh);
        // into_parts hands back the buffer without writing it out
        let _ = stale.into_parts();

        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(inner.committed_len)?;
        file.sync_all()?;
        inner.writes_since_sync = 0;
        Ok(())
    }

    /// Make the next append fail after `entries` complete entries.
    #[cfg(test)]
    pub(crate) fn fail_after(&self, entries: usize) {
        self.inner.lock().fail_after = Some(entries);
    }

    #[cfg(test)]
    fn injected_failure(inner: &mut JournalWriter) -> Result<()> {
        match inner.fail_after {
            Some(0) => {
                inner.fail_after = None;
                // A short write, as a full disk leaves it.
                inner.writer.write_all(&[0xAB; 3])?;
                inner.writer.flush()?;
                Err(std::io::Error::new(ErrorKind::Other, "injected write failure").into())
            }
            Some(left) => {
                inner.fail_after = Some(left - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    #[cfg(not(test))]
    fn injected_failure(_inner: &mut JournalWriter) -> Result<()> {
        Ok(())
    }

    /// Entries written since the last truncate.
    pub fn len(&self) -> u64 {
        self.inner.lock().entries
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry (called after a successful checkpoint).
    ///
    /// Sequence numbers keep increasing until the journal is reopened.
    pub fn truncate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;

        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(HEADER_LEN)?;
        file.sync_all()?;

        let fresh = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        let _ = std::mem::replace(&mut inner.writer, fresh).into_parts();
        inner.entries = 0;
        inner.writes_since_sync = 0;
        inner.committed_len = HEADER_LEN;
        inner.broken = false;
        Ok(())
    }

    fn write_header(path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    /// Read intact entries; returns them with the byte length they span.
    fn read_all(path: &Path) -> Result<(Vec<JournalEntry>, u64)> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut entries = Vec::new();
        let mut good_len = HEADER_LEN;
        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some(entry)) => {
                    entries.push(entry);
                    good_len = reader.stream_position()?;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(error = %e, "journal replay stopped");
                    break;
                }
            }
        }

        Ok((entries, good_len))
    }

    /// Frame and buffer one entry, returning the bytes it takes up.
    fn write_entry(writer: &mut BufWriter<File>, entry: &JournalEntry) -> Result<u64> {
        let encoded = rmp_serde::to_vec(entry)?;

        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;

        Ok(encoded.len() as u64 + 8)
    }

    /// `Ok(None)` at a clean end of file.
    fn read_entry(reader: &mut BufReader<File>) -> Result<Option<JournalEntry>> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > 64 * 1024 * 1024 {
            return Err(StoreError::Corruption("Journal entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(StoreError::ChecksumMismatch { expected, got });
        }

        Ok(Some(rmp_serde::from_slice(&encoded)?))
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        let _ = self.inner.lock().writer.flush();
    }
}
