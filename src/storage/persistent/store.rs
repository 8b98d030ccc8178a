//! Durable [`ResolutionStore`] backed by a write-ahead log and snapshots.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bloom::{BloomFilter, BloomIndex};
use crate::entity::Entity;
use crate::history::{MergeRecord, MergeSource};
use crate::ids::{EntityId, MentionId, MergeId, OrgId, UserId};
use crate::mention::Mention;
use crate::storage::{
    lock_err, EntityStore, MentionStore, MergeHistoryStore, ResolutionStore, Snapshot, StorageError,
    StoreState, StoreStats, StoreTransaction,
};

use super::codec::{self, FileKind};
use super::file_lock::FileLock;
use super::wal::{WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "wal.krsv";
const SNAPSHOT_FILE: &str = "snapshot.krsv";
const BLOOM_FILE: &str = "bloom.krsv";

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    /// Last WAL sequence folded into `tables`.
    sequence: u64,
    written_at: DateTime<Utc>,
    tables: Snapshot,
}

#[derive(Serialize, Deserialize)]
struct BloomFile {
    /// WAL sequence the filters were saved at.
    sequence: u64,
    filters: Vec<(OrgId, BloomFilter)>,
}

fn io_err(context: &str, err: &std::io::Error) -> StorageError {
    StorageError::BackendError(format!("{context}: {err}"))
}

/// Writes `header + record` to `path` through a temp file and rename.
fn write_atomically<T: Serialize>(path: &Path, kind: FileKind, value: &T) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut out = BufWriter::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?,
        );
        codec::write_header(&mut out, kind)?;
        out.write_all(&codec::encode(value)?)?;
        out.flush()?;
        out.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_parent(path)
}

/// Makes a rename durable.
#[cfg(unix)]
fn sync_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(dir) => File::open(dir)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Reads a file written by [`write_atomically`]; `None` if it does not exist.
fn read_file<T: serde::de::DeserializeOwned>(path: &Path, kind: FileKind) -> std::io::Result<Option<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    codec::read_header(&mut reader, kind)?;
    codec::decode(&mut reader).map(Some)
}

/// Single-process durable store.
///
/// The tables live in memory exactly as in [`crate::InMemoryStore`]; every
/// write is validated, appended to the WAL as one entry, then applied. On
/// open the latest snapshot is loaded and the WAL entries after it are
/// replayed. [`PersistentStore::compact`] folds the WAL into a new snapshot.
pub struct PersistentStore {
    dir: PathBuf,
    config: PersistentConfig,
    state: RwLock<StoreState>,
    wal: WriteAheadLog,
    _lock: FileLock,
}

impl std::fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore")
            .field("dir", &self.dir)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PersistentStore {
    /// Opens or creates the store in `config.dir`.
    ///
    /// # Errors
    /// - `ConnectionError` if another process holds the directory
    /// - `BackendError` for I/O failures or an invalid config
    /// - `SerializationError` for a corrupt snapshot
    pub fn open(config: PersistentConfig) -> Result<Self, StorageError> {
        let config = config
            .validate()
            .map_err(|e| StorageError::BackendError(e.to_string()))?;
        let dir = config.dir.clone();
        fs::create_dir_all(&dir).map_err(|e| io_err("create store directory", &e))?;

        let lock = FileLock::acquire(&dir).map_err(|e| {
            if e.kind() == ErrorKind::WouldBlock {
                StorageError::ConnectionError(format!("{}: {e}", dir.display()))
            } else {
                io_err("lock store directory", &e)
            }
        })?;

        let snapshot: Option<SnapshotFile> = read_file(&dir.join(SNAPSHOT_FILE), FileKind::Snapshot)
            .map_err(|e| StorageError::SerializationError(format!("snapshot: {e}")))?;
        let (base_sequence, mut state) = match snapshot {
            Some(file) => {
                tracing::debug!(
                    sequence = file.sequence,
                    written_at = %file.written_at,
                    "loading snapshot"
                );
                (file.sequence, StoreState::from_snapshot(file.tables)?)
            }
            None => (0, StoreState::default()),
        };

        let (wal, entries) = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write, base_sequence)
            .map_err(|e| io_err("open wal", &e))?;

        let mut replayed = 0usize;
        for entry in entries {
            if entry.sequence <= base_sequence {
                continue;
            }
            if let Err(err) = Self::apply_entry(&mut state, entry.kind) {
                // Entries were validated before they were logged.
                tracing::warn!(
                    sequence = entry.sequence,
                    written_at = %entry.timestamp,
                    error = %err,
                    "skipping wal entry that no longer applies"
                );
                continue;
            }
            replayed += 1;
        }

        let stats = state.stats();
        tracing::info!(
            dir = %dir.display(),
            snapshot_sequence = base_sequence,
            replayed,
            mentions = stats.mentions,
            entities = stats.entities,
            merges = stats.merges,
            "persistent store opened"
        );

        Ok(Self {
            dir,
            config,
            state: RwLock::new(state),
            wal,
            _lock: lock,
        })
    }

    fn apply_entry(state: &mut StoreState, kind: WalEntryKind) -> Result<(), StorageError> {
        match kind {
            WalEntryKind::InsertMention(mention) => {
                state.check_insert_mention(&mention)?;
                state.apply_insert_mention(mention);
            }
            WalEntryKind::InsertEntity(entity) => {
                state.check_insert_entity(&entity)?;
                state.apply_insert_entity(entity);
            }
            WalEntryKind::AppendMerge(record) => {
                state.check_append_merge(&record, &HashSet::new(), &HashSet::new())?;
                state.apply_append_merge(record);
            }
            WalEntryKind::Commit(tx) => {
                state.validate(&tx)?;
                state.apply(tx);
            }
        }
        Ok(())
    }

    /// Logs `kind`, then applies it. Callers validate first.
    fn write(
        &self,
        mut state: RwLockWriteGuard<'_, StoreState>,
        kind: WalEntryKind,
    ) -> Result<(), StorageError> {
        self.wal.append(&kind).map_err(|e| io_err("wal append", &e))?;
        Self::apply_entry(&mut state, kind)?;

        match self.wal.size_bytes() {
            Ok(size) if size > self.config.max_wal_size => {
                if let Err(err) = self.compact_locked(&state) {
                    // The write itself is durable; the next write retries.
                    tracing::warn!(error = %err, "automatic compaction failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "cannot stat wal"),
        }
        Ok(())
    }

    fn compact_locked(&self, state: &StoreState) -> Result<(), StorageError> {
        let sequence = self.wal.sequence().map_err(|e| io_err("wal sequence", &e))?;
        let file = SnapshotFile {
            sequence,
            written_at: Utc::now(),
            tables: state.to_snapshot(),
        };
        write_atomically(&self.dir.join(SNAPSHOT_FILE), FileKind::Snapshot, &file)
            .map_err(|e| io_err("write snapshot", &e))?;
        self.wal.truncate().map_err(|e| io_err("truncate wal", &e))?;

        let stats = state.stats();
        tracing::info!(
            sequence,
            mentions = stats.mentions,
            entities = stats.entities,
            merges = stats.merges,
            "store compacted"
        );
        Ok(())
    }

    /// Writes a snapshot of every table and empties the WAL.
    ///
    /// # Errors
    /// `BackendError` if the snapshot cannot be written.
    pub fn compact(&self) -> Result<(), StorageError> {
        let state = self.state.write().map_err(|_| lock_err("store.compact"))?;
        self.compact_locked(&state)
    }

    /// Saves every loaded bloom filter, stamped with the current WAL sequence.
    ///
    /// # Errors
    /// `BackendError` if the file cannot be written.
    pub fn save_bloom(&self, bloom: &BloomIndex) -> Result<(), StorageError> {
        // Read the sequence first: entities are indexed before they commit,
        // so every commit up to it is already in the filters.
        let sequence = self.wal.sequence().map_err(|e| io_err("wal sequence", &e))?;
        let mut filters = Vec::new();
        for org_id in bloom.loaded_orgs()? {
            if let Some(filter) = bloom.snapshot(org_id)? {
                filters.push((org_id, filter));
            }
        }
        let count = filters.len();
        write_atomically(
            &self.dir.join(BLOOM_FILE),
            FileKind::Bloom,
            &BloomFile { sequence, filters },
        )
        .map_err(|e| io_err("write bloom snapshot", &e))?;
        tracing::debug!(sequence, orgs = count, "bloom filters saved");
        Ok(())
    }

    /// Restores saved bloom filters if nothing was written since they were
    /// saved. Returns whether they were used; otherwise filters rebuild
    /// lazily from the tables.
    ///
    /// # Errors
    /// `BackendError` if a lock is poisoned. An unreadable file is skipped.
    pub fn load_bloom(&self, bloom: &BloomIndex) -> Result<bool, StorageError> {
        let saved: BloomFile = match read_file(&self.dir.join(BLOOM_FILE), FileKind::Bloom) {
            Ok(Some(file)) => file,
            Ok(None) => return Ok(false),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable bloom snapshot");
                return Ok(false);
            }
        };

        let current = self.wal.sequence().map_err(|e| io_err("wal sequence", &e))?;
        if saved.sequence != current {
            tracing::debug!(saved = saved.sequence, current, "bloom snapshot is stale");
            return Ok(false);
        }
        for (org_id, filter) in saved.filters {
            bloom.restore(org_id, filter)?;
        }
        Ok(true)
    }

    /// The store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current row counts.
    ///
    /// # Errors
    /// Returns `BackendError` if the lock is poisoned.
    pub fn stats(&self) -> Result<StoreStats, StorageError> {
        Ok(self.state.read().map_err(|_| lock_err("store.stats"))?.stats())
    }
}

impl MentionStore for PersistentStore {
    fn insert_mention(&self, mention: Mention) -> Result<(), StorageError> {
        let state = self.state.write().map_err(|_| lock_err("mention.insert"))?;
        state.check_insert_mention(&mention)?;
        self.write(state, WalEntryKind::InsertMention(mention))
    }

    fn get_mention(&self, id: MentionId) -> Result<Option<Mention>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("mention.get"))?;
        Ok(state.get_mention(id))
    }

    fn mentions_for_entity(&self, entity_id: EntityId) -> Result<Vec<Mention>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("mention.for_entity"))?;
        Ok(state.mentions_for_entity(entity_id))
    }

    fn mentions_for_org(&self, org_id: OrgId) -> Result<Vec<Mention>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("mention.for_org"))?;
        Ok(state.mentions_for_org(org_id))
    }
}

impl EntityStore for PersistentStore {
    fn insert_entity(&self, entity: Entity) -> Result<(), StorageError> {
        let state = self.state.write().map_err(|_| lock_err("entity.insert"))?;
        state.check_insert_entity(&entity)?;
        self.write(state, WalEntryKind::InsertEntity(entity))
    }

    fn get_entity(&self, id: EntityId) -> Result<Option<Entity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.get"))?;
        Ok(state.get_entity(id))
    }

    fn find_by_text(
        &self,
        org_id: OrgId,
        normalized: &str,
        min_similarity: f32,
        limit: usize,
    ) -> Result<Vec<(Entity, f32)>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.find_by_text"))?;
        Ok(state.find_by_text(org_id, normalized, min_similarity, limit))
    }

    fn entities_for_org(&self, org_id: OrgId) -> Result<Vec<Entity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("entity.for_org"))?;
        Ok(state.entities_for_org(org_id))
    }
}

impl MergeHistoryStore for PersistentStore {
    fn append_merge(&self, record: MergeRecord) -> Result<(), StorageError> {
        let state = self.state.write().map_err(|_| lock_err("merge.append"))?;
        state.check_append_merge(&record, &HashSet::new(), &HashSet::new())?;
        self.write(state, WalEntryKind::AppendMerge(record))
    }

    fn get_merge(&self, id: MergeId) -> Result<Option<MergeRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("merge.get"))?;
        Ok(state.get_merge(id))
    }

    fn merges_by_target(&self, org_id: OrgId, entity_id: EntityId) -> Result<Vec<MergeRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("merge.by_target"))?;
        Ok(state.merges_by_target(org_id, entity_id))
    }

    fn merges_by_source(&self, org_id: OrgId, source: &MergeSource) -> Result<Vec<MergeRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("merge.by_source"))?;
        Ok(state.merges_by_source(org_id, source))
    }

    fn merges_by_user(&self, org_id: OrgId, user_id: &UserId) -> Result<Vec<MergeRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("merge.by_user"))?;
        Ok(state.merges_by_user(org_id, user_id))
    }

    fn reversal_of(&self, merge_id: MergeId) -> Result<Option<MergeRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("merge.reversal_of"))?;
        Ok(state.reversal_of(merge_id))
    }
}

impl ResolutionStore for PersistentStore {
    fn commit(&self, tx: StoreTransaction) -> Result<(), StorageError> {
        let state = self.state.write().map_err(|_| lock_err("store.commit"))?;
        state.validate(&tx)?;
        self.write(state, WalEntryKind::Commit(tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BloomConfig;
    use crate::entity::EntityType;
    use crate::mention::{Provenance, TextSpan};
    use tempfile::tempdir;

    fn mention(org: OrgId, text: &str) -> Mention {
        Mention::builder()
            .org(org)
            .text(text)
            .mention_type(EntityType::Person)
            .confidence(0.9)
            .provenance(Provenance::new("run", "doc", TextSpan::new(0, 1).unwrap(), text))
            .build()
            .unwrap()
    }

    fn resolve_one(store: &PersistentStore, org: OrgId, text: &str) -> (Entity, Mention) {
        let m = mention(org, text);
        let entity = Entity::from_mention(&m, Some(vec![1.0, 0.0]));
        store.insert_mention(m.clone()).unwrap();
        store
            .commit(
                StoreTransaction::new(org)
                    .insert_entity(entity.clone())
                    .assign(m.id, None, entity.id),
            )
            .unwrap();
        (entity, m)
    }

    #[test]
    fn test_reopen_replays_wal() {
        let dir = tempdir().unwrap();
        let org = OrgId::new();
        let (entity, m) = {
            let store = PersistentStore::open(PersistentConfig::new(dir.path())).unwrap();
            resolve_one(&store, org, "Cristiano Ronaldo")
        };

        let store = PersistentStore::open(PersistentConfig::new(dir.path())).unwrap();
        let stored = store.get_mention(m.id).unwrap().unwrap();
        assert_eq!(stored.resolved_entity_id, Some(entity.id));
        let hits = store.find_by_text(org, "cristiano ronaldo", 0.5, 10).unwrap();
        assert_eq!(hits[0].0.id, entity.id);
    }

    #[test]
    fn test_rejected_commit_is_not_logged() {
        let dir = tempdir().unwrap();
        let org = OrgId::new();
        {
            let store = PersistentStore::open(PersistentConfig::new(dir.path())).unwrap();
            let (entity, m) = resolve_one(&store, org, "Acme");
            // Stale compare-and-set.
            let err = store
                .commit(StoreTransaction::new(org).assign(m.id, None, entity.id))
                .unwrap_err();
            assert!(matches!(err, StorageError::Conflict(_)));
        }
        let store = PersistentStore::open(PersistentConfig::new(dir.path())).unwrap();
        assert_eq!(store.stats().unwrap().entities, 1);
    }

    #[test]
    fn test_compaction_then_more_writes() {
        let dir = tempdir().unwrap();
        let org = OrgId::new();
        {
            let store = PersistentStore::open(PersistentConfig::new(dir.path())).unwrap();
            resolve_one(&store, org, "Acme");
            store.compact().unwrap();
            resolve_one(&store, org, "Globex");
        }
        let store = PersistentStore::open(PersistentConfig::new(dir.path())).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.entities, 2);
        assert_eq!(stats.mentions, 2);
    }

    #[test]
    fn test_automatic_compaction() {
        let dir = tempdir().unwrap();
        let org = OrgId::new();
        let mut config = PersistentConfig::new(dir.path());
        config.max_wal_size = PersistentConfig::MIN_WAL_SIZE;
        config.sync_on_write = false;
        {
            let store = PersistentStore::open(config.clone()).unwrap();
            for i in 0..20 {
                resolve_one(&store, org, &format!("Company {i}"));
            }
            assert!(dir.path().join(SNAPSHOT_FILE).exists());
        }
        let store = PersistentStore::open(config).unwrap();
        assert_eq!(store.stats().unwrap().entities, 20);
    }

    #[test]
    fn test_second_open_is_refused() {
        let dir = tempdir().unwrap();
        let _store = PersistentStore::open(PersistentConfig::new(dir.path())).unwrap();
        let err = PersistentStore::open(PersistentConfig::new(dir.path())).unwrap_err();
        assert!(matches!(err, StorageError::ConnectionError(_)));
    }

    #[test]
    fn test_bloom_snapshot_is_used_only_when_current() {
        let dir = tempdir().unwrap();
        let org = OrgId::new();
        {
            let store = PersistentStore::open(PersistentConfig::new(dir.path())).unwrap();
            let (entity, _) = resolve_one(&store, org, "Acme");
            let bloom = BloomIndex::new(BloomConfig::default());
            bloom.insert_entity(&entity, &store).unwrap();
            store.save_bloom(&bloom).unwrap();
        }
        {
            let store = PersistentStore::open(PersistentConfig::new(dir.path())).unwrap();
            let bloom = BloomIndex::new(BloomConfig::default());
            assert!(store.load_bloom(&bloom).unwrap());
            assert_eq!(bloom.loaded_orgs().unwrap(), vec![org]);
            // A write after the save makes the saved filters stale.
            resolve_one(&store, org, "Globex");
        }
        let store = PersistentStore::open(PersistentConfig::new(dir.path())).unwrap();
        let bloom = BloomIndex::new(BloomConfig::default());
        assert!(!store.load_bloom(&bloom).unwrap());
        assert!(bloom.may_match(org, "globex", &store).unwrap());
    }
}
