//! Append-only journal backing a durable queue.
//!
//! Every queue state change is written as a frame before it is applied in
//! memory. On reopen the frames are replayed to rebuild the live messages.
//!
//! Frame layout: `len: u32 LE | MessagePack entry | crc32: u32 LE`.

use crate::error::{PipelineError, Result};
use crate::queue::message::DeadLetterOrigin;
use crate::types::{Event, MessageId, Timestamp};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"RLQ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Upper bound on a single frame.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// A recorded queue state change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JournalOp {
    /// A message entered the queue.
    Enqueued {
        id: MessageId,
        event: Event,
        enqueued_at: Timestamp,
        origin: Option<DeadLetterOrigin>,
    },
    /// A message was handed out; `delivery_count` is the new count.
    Delivered { id: MessageId, delivery_count: u32 },
    /// A message went back to visible after a nack or expiry.
    Released { id: MessageId },
    /// A message left the queue (acked, dead-lettered or discarded).
    Removed { id: MessageId },
}

/// Journal file handle.
pub struct QueueJournal {
    /// Path to the journal file.
    path: PathBuf,
    /// Write handle.
    writer: Mutex<BufWriter<File>>,
    /// Held for exclusive access.
    _lock_file: File,
    #[cfg(test)]
    failing_appends: std::sync::atomic::AtomicU32,
}

impl QueueJournal {
    /// Open or create a journal, returning the ops already recorded.
    ///
    /// A torn or corrupt frame ends replay; everything before it is kept.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<JournalOp>)> {
        let path = path.as_ref().to_path_buf();
        let lock_file = Self::acquire_lock(&path)?;

        let ops = if path.exists() {
            let mut reader = BufReader::new(File::open(&path)?);
            Self::read_header(&mut reader)?;

            let mut ops = Vec::new();
            let mut damaged = false;
            loop {
                match Self::read_entry(&mut reader) {
                    Ok(Some(op)) => ops.push(op),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(journal = %path.display(), error = %e, "journal replay stopped at damaged frame");
                        damaged = true;
                        break;
                    }
                }
            }
            drop(reader);
            // Appends must not land behind a damaged frame
            if damaged {
                Self::write_fresh(&path, &ops)?;
            }
            debug!(journal = %path.display(), ops = ops.len(), "journal replayed");
            ops
        } else {
            Self::write_fresh(&path, &[])?;
            Vec::new()
        };

        let writer = BufWriter::new(OpenOptions::new().append(true).open(&path)?);

        Ok((
            Self {
                path,
                writer: Mutex::new(writer),
                _lock_file: lock_file,
                #[cfg(test)]
                failing_appends: std::sync::atomic::AtomicU32::new(0),
            },
            ops,
        ))
    }

    /// Append ops and fsync.
    pub fn append(&self, ops: &[JournalOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        #[cfg(test)]
        if self
            .failing_appends
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |n| n.checked_sub(1),
            )
            .is_ok()
        {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected append failure").into());
        }
        let mut writer = self.writer.lock();
        for op in ops {
            Self::write_entry(&mut *writer, op)?;
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Replace the journal with the given ops (used for compaction).
    pub fn rewrite(&self, ops: &[JournalOp]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;

        let tmp = self.path.with_extension("journal.tmp");
        Self::write_fresh(&tmp, ops)?;
        fs::rename(&tmp, &self.path)?;

        *writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        Ok(())
    }

    /// Make the next `n` appends fail without writing.
    #[cfg(test)]
    pub(crate) fn fail_next_appends(&self, n: u32) {
        self.failing_appends
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_fresh(path: &Path, ops: &[JournalOp]) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(JOURNAL_MAGIC)?;
        writer.write_all(&[JOURNAL_VERSION])?;
        for op in ops {
            Self::write_entry(&mut writer, op)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.with_extension("lock");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| PipelineError::Locked)?;

        Ok(lock_file)
    }

    fn read_header(reader: &mut impl Read) -> Result<()> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(PipelineError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(PipelineError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    fn write_entry(writer: &mut impl Write, op: &JournalOp) -> Result<()> {
        let encoded = rmp_serde::to_vec(op)?;

        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;

        Ok(())
    }

    /// Read one frame. `Ok(None)` at a clean end of file.
    fn read_entry(reader: &mut impl Read) -> Result<Option<JournalOp>> {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_FRAME_BYTES {
            return Err(PipelineError::Corruption("journal frame too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);

        if stored != crc32fast::hash(&encoded) {
            return Err(PipelineError::Corruption("journal checksum mismatch".into()));
        }

        Ok(Some(rmp_serde::from_slice(&encoded)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventId, EventKind};
    use tempfile::TempDir;

    fn enqueued(id: u64, key: &str) -> JournalOp {
        JournalOp::Enqueued {
            id: MessageId(id),
            event: Event::new(EventId::new(format!("e{id}")), EventKind::UploadCreated, key),
            enqueued_at: Timestamp(id as i64),
            origin: None,
        }
    }

    #[test]
    fn test_journal_reopen_replays_ops() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uploads.journal");

        {
            let (journal, ops) = QueueJournal::open(&path).unwrap();
            assert!(ops.is_empty());
            journal
                .append(&[
                    enqueued(1, "a.png"),
                    JournalOp::Delivered {
                        id: MessageId(1),
                        delivery_count: 1,
                    },
                ])
                .unwrap();
        }

        let (_journal, ops) = QueueJournal::open(&path).unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0], enqueued(1, "a.png"));
    }

    #[test]
    fn test_journal_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uploads.journal");

        let (_journal, _) = QueueJournal::open(&path).unwrap();
        assert!(matches!(
            QueueJournal::open(&path),
            Err(PipelineError::Locked)
        ));
    }

    #[test]
    fn test_journal_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uploads.journal");

        {
            let (journal, _) = QueueJournal::open(&path).unwrap();
            journal.append(&[enqueued(1, "a.png")]).unwrap();
        }

        // Simulate a crash mid-frame
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(file);

        {
            let (journal, ops) = QueueJournal::open(&path).unwrap();
            assert_eq!(ops, vec![enqueued(1, "a.png")]);
            journal.append(&[enqueued(2, "b.png")]).unwrap();
        }

        let (_journal, ops) = QueueJournal::open(&path).unwrap();
        assert_eq!(ops, vec![enqueued(1, "a.png"), enqueued(2, "b.png")]);
    }

    #[test]
    fn test_journal_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uploads.journal");

        {
            let (journal, _) = QueueJournal::open(&path).unwrap();
            journal
                .append(&[enqueued(1, "a.png"), JournalOp::Removed { id: MessageId(1) }])
                .unwrap();
            journal.rewrite(&[enqueued(2, "b.png")]).unwrap();
            journal.append(&[enqueued(3, "c.png")]).unwrap();
        }

        let (_journal, ops) = QueueJournal::open(&path).unwrap();
        assert_eq!(ops, vec![enqueued(2, "b.png"), enqueued(3, "c.png")]);
    }

    #[test]
    fn test_journal_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("uploads.journal");
        fs::write(&path, b"nope, not a journal").unwrap();

        assert!(matches!(
            QueueJournal::open(&path),
            Err(PipelineError::InvalidFormat(_))
        ));
    }
}
