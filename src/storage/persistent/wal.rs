//! Write-ahead log.
//!
//! Every store write is appended here (and fsynced when configured) before
//! it touches the in-memory tables. A transaction is a single entry, so a
//! crash can never leave half of one on disk.
//!
//! # File Format
//! ```text
//! [HEADER: 6 bytes]
//! [ENTRY 1: codec-encoded WalEntry]
//! [ENTRY 2: codec-encoded WalEntry]
//! ...
//! ```
//!
//! Sequence numbers keep increasing across compactions; a snapshot records
//! the last sequence it covers.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::history::MergeRecord;
use crate::mention::Mention;
use crate::storage::StoreTransaction;

use super::codec::{self, FileKind, HEADER_LEN};

/// One logged write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum WalEntryKind {
    InsertMention(Mention),
    InsertEntity(Entity),
    AppendMerge(MergeRecord),
    Commit(StoreTransaction),
}

#[derive(Debug, Deserialize)]
pub(crate) struct WalEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: WalEntryKind,
}

/// Serialized form of [`WalEntry`] without cloning the payload.
#[derive(Serialize)]
struct WalEntryRef<'a> {
    sequence: u64,
    timestamp: DateTime<Utc>,
    kind: &'a WalEntryKind,
}

struct WalInner {
    writer: BufWriter<File>,
    sequence: u64,
}

pub(crate) struct WriteAheadLog {
    path: PathBuf,
    inner: Mutex<WalInner>,
    sync_on_write: bool,
}

fn poisoned() -> std::io::Error {
    std::io::Error::other("poisoned lock: wal")
}

fn fresh(path: &Path, sync: bool) -> IoResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    codec::write_header(&mut file, FileKind::Wal)?;
    if sync {
        file.sync_all()?;
    }
    Ok(())
}

/// Reads every intact entry and the byte length they span.
fn read_entries(path: &Path) -> IoResult<(Vec<WalEntry>, u64, u64)> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    codec::read_header(&mut reader, FileKind::Wal)?;

    let mut entries = Vec::new();
    let mut valid_len = HEADER_LEN;
    while valid_len < file_len {
        match codec::decode::<WalEntry>(&mut reader) {
            Ok(entry) => {
                valid_len = reader.stream_position()?;
                entries.push(entry);
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                tracing::warn!(
                    path = %path.display(),
                    offset = valid_len,
                    "wal ends with a torn entry, discarding it"
                );
                break;
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    offset = valid_len,
                    error = %e,
                    "wal corruption detected, replaying up to the last intact entry"
                );
                break;
            }
        }
    }
    Ok((entries, valid_len, file_len))
}

impl WriteAheadLog {
    /// Opens or creates the log and returns it with the entries to replay.
    ///
    /// A damaged tail is cut off so new entries follow the last intact one.
    /// `base_sequence` is the last sequence already covered by a snapshot;
    /// numbering continues from whichever is higher.
    pub(crate) fn open(path: &Path, sync_on_write: bool, base_sequence: u64) -> IoResult<(Self, Vec<WalEntry>)> {
        let existing_len = match std::fs::metadata(path) {
            Ok(meta) => Some(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e),
        };

        let entries = match existing_len {
            Some(len) if len >= HEADER_LEN => {
                let (entries, valid_len, file_len) = read_entries(path)?;
                if valid_len < file_len {
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(valid_len)?;
                    file.sync_all()?;
                }
                entries
            }
            Some(_) | None => {
                fresh(path, sync_on_write)?;
                Vec::new()
            }
        };

        let sequence = entries
            .last()
            .map_or(base_sequence, |e| e.sequence.max(base_sequence));
        let file = OpenOptions::new().append(true).open(path)?;

        Ok((
            Self {
                path: path.to_path_buf(),
                inner: Mutex::new(WalInner {
                    writer: BufWriter::new(file),
                    sequence,
                }),
                sync_on_write,
            },
            entries,
        ))
    }

    /// Appends one entry and returns its sequence number.
    pub(crate) fn append(&self, kind: &WalEntryKind) -> IoResult<u64> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        let sequence = inner.sequence + 1;
        let encoded = codec::encode(&WalEntryRef {
            sequence,
            timestamp: Utc::now(),
            kind,
        })?;

        inner.writer.write_all(&encoded)?;
        inner.writer.flush()?;
        if self.sync_on_write {
            inner.writer.get_ref().sync_data()?;
        }
        inner.sequence = sequence;
        Ok(sequence)
    }

    /// Last assigned sequence number.
    pub(crate) fn sequence(&self) -> IoResult<u64> {
        Ok(self.inner.lock().map_err(|_| poisoned())?.sequence)
    }

    pub(crate) fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    /// Drops every entry. Only call once a snapshot covers them.
    pub(crate) fn truncate(&self) -> IoResult<()> {
        let mut inner = self.inner.lock().map_err(|_| poisoned())?;
        inner.writer.flush()?;
        // Append mode: later writes land at the new end.
        let file = inner.writer.get_ref();
        file.set_len(HEADER_LEN)?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;
    use crate::ids::OrgId;
    use tempfile::tempdir;

    fn entity() -> Entity {
        Entity::new(OrgId::new(), "Acme", EntityType::Organization)
    }

    #[test]
    fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.krsv");
        {
            let (wal, replay) = WriteAheadLog::open(&path, false, 0).unwrap();
            assert!(replay.is_empty());
            assert_eq!(wal.append(&WalEntryKind::InsertEntity(entity())).unwrap(), 1);
            assert_eq!(wal.append(&WalEntryKind::InsertEntity(entity())).unwrap(), 2);
        }

        let (wal, replay) = WriteAheadLog::open(&path, false, 0).unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[1].sequence, 2);
        assert!(matches!(replay[0].kind, WalEntryKind::InsertEntity(_)));
        assert_eq!(wal.sequence().unwrap(), 2);
    }

    #[test]
    fn test_torn_tail_is_cut_off() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.krsv");
        {
            let (wal, _) = WriteAheadLog::open(&path, true, 0).unwrap();
            wal.append(&WalEntryKind::InsertEntity(entity())).unwrap();
        }
        // Simulate a crash mid-append.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 200, 0, 0, 0, b'{']).unwrap();
        drop(file);

        let (wal, replay) = WriteAheadLog::open(&path, true, 0).unwrap();
        assert_eq!(replay.len(), 1);
        wal.append(&WalEntryKind::InsertEntity(entity())).unwrap();
        drop(wal);

        let (_, replay) = WriteAheadLog::open(&path, true, 0).unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[1].sequence, 2);
    }

    #[test]
    fn test_truncate_keeps_numbering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.krsv");
        let (wal, _) = WriteAheadLog::open(&path, false, 0).unwrap();
        wal.append(&WalEntryKind::InsertEntity(entity())).unwrap();
        wal.truncate().unwrap();
        assert_eq!(wal.size_bytes().unwrap(), HEADER_LEN);
        assert_eq!(wal.append(&WalEntryKind::InsertEntity(entity())).unwrap(), 2);
        drop(wal);

        // After a restart the snapshot supplies the base sequence.
        let (wal, replay) = WriteAheadLog::open(&path, false, 1).unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(wal.sequence().unwrap(), 2);
    }

    #[test]
    fn test_rejects_other_file_kinds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snapshot.krsv");
        let mut file = File::create(&path).unwrap();
        codec::write_header(&mut file, FileKind::Snapshot).unwrap();
        drop(file);
        assert!(WriteAheadLog::open(&path, false, 0).is_err());
    }
}
