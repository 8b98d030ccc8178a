//! In-memory storage backend.
//!
//! This module provides a thread-safe in-memory implementation of the
//! storage traits. It is intended for embedded usage, tests, and as the
//! reference implementation; the persistent backend keeps the same
//! [`StoreState`] behind its write-ahead log.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::entity::Entity;
use crate::history::{MergeRecord, MergeSource};
use crate::ids::{EntityId, MentionId, MergeId, OrgId, UserId};
use crate::mention::Mention;
use crate::normalize::trigrams;
use crate::storage::traits::{
    EntityStore, MentionStore, MergeHistoryStore, ResolutionStore, StorageError, StoreTransaction,
};

pub(crate) fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn check_scope(record: impl FnOnce() -> String, expected: OrgId, actual: OrgId) -> Result<(), StorageError> {
    if expected == actual {
        Ok(())
    } else {
        Err(StorageError::ScopeViolation {
            record: record(),
            expected,
            actual,
        })
    }
}

/// Row counts, for monitoring and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Stored mentions.
    pub mentions: usize,
    /// Stored entities in any status.
    pub entities: usize,
    /// Merge history rows.
    pub merges: usize,
}

/// Plain table contents, without indexes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub mentions: Vec<Mention>,
    pub entities: Vec<Entity>,
    pub merges: Vec<MergeRecord>,
}

/// Tables plus secondary indexes.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    mentions: HashMap<MentionId, Mention>,
    mentions_by_org: HashMap<OrgId, Vec<MentionId>>,
    mentions_by_entity: HashMap<EntityId, HashSet<MentionId>>,

    entities: HashMap<EntityId, Entity>,
    entities_by_org: HashMap<OrgId, Vec<EntityId>>,
    trigram_sets: HashMap<EntityId, BTreeSet<String>>,
    trigram_index: HashMap<OrgId, HashMap<String, HashSet<EntityId>>>,

    merges: Vec<MergeRecord>,
    merge_pos: HashMap<MergeId, usize>,
    merges_by_target: HashMap<EntityId, Vec<usize>>,
    merges_by_source: HashMap<MergeSource, Vec<usize>>,
    merges_by_user: HashMap<(OrgId, UserId), Vec<usize>>,
    reversed_by: HashMap<MergeId, MergeId>,
}

impl StoreState {
    pub(crate) fn stats(&self) -> StoreStats {
        StoreStats {
            mentions: self.mentions.len(),
            entities: self.entities.len(),
            merges: self.merges.len(),
        }
    }

    pub(crate) fn to_snapshot(&self) -> Snapshot {
        let mut mentions: Vec<Mention> = self.mentions.values().cloned().collect();
        mentions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let mut entities: Vec<Entity> = self.entities.values().cloned().collect();
        entities.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Snapshot {
            mentions,
            entities,
            merges: self.merges.clone(),
        }
    }

    /// Rebuilds every index from plain rows. Entities load before mentions
    /// so resolved mentions find their owner.
    pub(crate) fn from_snapshot(snapshot: Snapshot) -> Result<Self, StorageError> {
        let mut state = Self::default();
        for entity in snapshot.entities {
            state.check_insert_entity(&entity)?;
            state.apply_insert_entity(entity);
        }
        for mention in snapshot.mentions {
            state.check_insert_mention(&mention)?;
            state.apply_insert_mention(mention);
        }
        for record in snapshot.merges {
            state.check_append_merge(&record, &HashSet::new(), &HashSet::new())?;
            state.apply_append_merge(record);
        }
        Ok(state)
    }

    // ---- mentions ----

    pub(crate) fn check_insert_mention(&self, mention: &Mention) -> Result<(), StorageError> {
        if self.mentions.contains_key(&mention.id) {
            return Err(StorageError::DuplicateKey(format!("mention {}", mention.id)));
        }
        if let Some(owner) = mention.resolved_entity_id {
            let entity = self
                .entities
                .get(&owner)
                .ok_or(StorageError::EntityNotFound(owner))?;
            check_scope(|| format!("entity {owner}"), mention.org_id, entity.org_id)?;
        }
        Ok(())
    }

    pub(crate) fn apply_insert_mention(&mut self, mention: Mention) {
        self.mentions_by_org.entry(mention.org_id).or_default().push(mention.id);
        if let Some(owner) = mention.resolved_entity_id {
            self.mentions_by_entity.entry(owner).or_default().insert(mention.id);
        }
        self.mentions.insert(mention.id, mention);
    }

    pub(crate) fn get_mention(&self, id: MentionId) -> Option<Mention> {
        self.mentions.get(&id).cloned()
    }

    fn sorted_mentions<'a>(&self, ids: impl Iterator<Item = &'a MentionId>) -> Vec<Mention> {
        let mut out: Vec<Mention> = ids.filter_map(|id| self.mentions.get(id).cloned()).collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub(crate) fn mentions_for_entity(&self, entity_id: EntityId) -> Vec<Mention> {
        self.mentions_by_entity
            .get(&entity_id)
            .map(|ids| self.sorted_mentions(ids.iter()))
            .unwrap_or_default()
    }

    pub(crate) fn mentions_for_org(&self, org_id: OrgId) -> Vec<Mention> {
        self.mentions_by_org
            .get(&org_id)
            .map(|ids| self.sorted_mentions(ids.iter()))
            .unwrap_or_default()
    }

    // ---- entities ----

    pub(crate) fn check_insert_entity(&self, entity: &Entity) -> Result<(), StorageError> {
        if self.entities.contains_key(&entity.id) {
            return Err(StorageError::DuplicateKey(format!("entity {}", entity.id)));
        }
        Ok(())
    }

    fn index_text(&mut self, entity: &Entity) {
        let grams = trigrams(&entity.normalized_text);
        let index = self.trigram_index.entry(entity.org_id).or_default();
        for gram in &grams {
            index.entry(gram.clone()).or_default().insert(entity.id);
        }
        self.trigram_sets.insert(entity.id, grams);
    }

    fn unindex_text(&mut self, entity_id: EntityId, org_id: OrgId) {
        let Some(grams) = self.trigram_sets.remove(&entity_id) else {
            return;
        };
        if let Some(index) = self.trigram_index.get_mut(&org_id) {
            for gram in &grams {
                if let Some(ids) = index.get_mut(gram) {
                    ids.remove(&entity_id);
                    if ids.is_empty() {
                        index.remove(gram);
                    }
                }
            }
        }
    }

    pub(crate) fn apply_insert_entity(&mut self, entity: Entity) {
        self.entities_by_org.entry(entity.org_id).or_default().push(entity.id);
        self.index_text(&entity);
        self.entities.insert(entity.id, entity);
    }

    fn apply_update_entity(&mut self, entity: Entity) {
        let reindex = self
            .entities
            .get(&entity.id)
            .map_or(true, |prev| prev.normalized_text != entity.normalized_text);
        if reindex {
            self.unindex_text(entity.id, entity.org_id);
            self.index_text(&entity);
        }
        self.entities.insert(entity.id, entity);
    }

    pub(crate) fn get_entity(&self, id: EntityId) -> Option<Entity> {
        self.entities.get(&id).cloned()
    }

    pub(crate) fn entities_for_org(&self, org_id: OrgId) -> Vec<Entity> {
        let mut out: Vec<Entity> = self
            .entities_by_org
            .get(&org_id)
            .map(|ids| ids.iter().filter_map(|id| self.entities.get(id).cloned()).collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub(crate) fn find_by_text(
        &self,
        org_id: OrgId,
        normalized: &str,
        min_similarity: f32,
        limit: usize,
    ) -> Vec<(Entity, f32)> {
        let query = trigrams(normalized);
        if query.is_empty() || limit == 0 {
            return Vec::new();
        }
        let Some(index) = self.trigram_index.get(&org_id) else {
            return Vec::new();
        };

        let mut shared: HashMap<EntityId, usize> = HashMap::new();
        for gram in &query {
            if let Some(ids) = index.get(gram) {
                for id in ids {
                    *shared.entry(*id).or_default() += 1;
                }
            }
        }

        let mut scored: Vec<(Entity, f32)> = shared
            .into_iter()
            .filter_map(|(id, hits)| {
                let entity = self.entities.get(&id).filter(|e| e.is_active())?;
                let grams = self.trigram_sets.get(&id)?;
                let union = query.len() + grams.len() - hits;
                #[allow(clippy::cast_precision_loss)]
                let sim = hits as f32 / union as f32;
                (sim >= min_similarity).then(|| (entity.clone(), sim))
            })
            .collect();

        scored.sort_by(|(ea, sa), (eb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ea.id.cmp(&eb.id))
        });
        scored.truncate(limit);
        scored
    }

    // ---- merge history ----

    /// `extra_entities` and `pending_reversals` cover rows staged earlier in
    /// the same transaction.
    pub(crate) fn check_append_merge(
        &self,
        record: &MergeRecord,
        extra_entities: &HashSet<EntityId>,
        pending_reversals: &HashSet<MergeId>,
    ) -> Result<(), StorageError> {
        if self.merge_pos.contains_key(&record.id) {
            return Err(StorageError::DuplicateKey(format!("merge {}", record.id)));
        }
        match self.entities.get(&record.target) {
            Some(target) => check_scope(
                || format!("entity {}", record.target),
                record.org_id,
                target.org_id,
            )?,
            None if extra_entities.contains(&record.target) => {}
            None => return Err(StorageError::EntityNotFound(record.target)),
        }
        if let Some(reversed) = record.reverses {
            let original = self
                .merge_pos
                .get(&reversed)
                .and_then(|&pos| self.merges.get(pos))
                .ok_or(StorageError::MergeNotFound(reversed))?;
            check_scope(|| format!("merge {reversed}"), record.org_id, original.org_id)?;
            if let Some(by) = self.reversed_by.get(&reversed) {
                return Err(StorageError::Conflict(format!(
                    "merge {reversed} already reversed by {by}"
                )));
            }
            if pending_reversals.contains(&reversed) {
                return Err(StorageError::Conflict(format!(
                    "merge {reversed} reversed twice in one transaction"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn apply_append_merge(&mut self, record: MergeRecord) {
        let pos = self.merges.len();
        self.merge_pos.insert(record.id, pos);
        self.merges_by_target.entry(record.target).or_default().push(pos);
        self.merges_by_source.entry(record.source).or_default().push(pos);
        if let Some(user) = record.merged_by.clone() {
            self.merges_by_user.entry((record.org_id, user)).or_default().push(pos);
        }
        if let Some(reversed) = record.reverses {
            self.reversed_by.insert(reversed, record.id);
        }
        self.merges.push(record);
    }

    fn records_at(&self, positions: Option<&Vec<usize>>, org_id: OrgId) -> Vec<MergeRecord> {
        positions
            .map(|ps| {
                ps.iter()
                    .filter_map(|&p| self.merges.get(p))
                    .filter(|r| r.org_id == org_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn get_merge(&self, id: MergeId) -> Option<MergeRecord> {
        self.merge_pos.get(&id).and_then(|&p| self.merges.get(p)).cloned()
    }

    pub(crate) fn merges_by_target(&self, org_id: OrgId, entity_id: EntityId) -> Vec<MergeRecord> {
        self.records_at(self.merges_by_target.get(&entity_id), org_id)
    }

    pub(crate) fn merges_by_source(&self, org_id: OrgId, source: &MergeSource) -> Vec<MergeRecord> {
        self.records_at(self.merges_by_source.get(source), org_id)
    }

    pub(crate) fn merges_by_user(&self, org_id: OrgId, user_id: &UserId) -> Vec<MergeRecord> {
        self.records_at(self.merges_by_user.get(&(org_id, user_id.clone())), org_id)
    }

    pub(crate) fn reversal_of(&self, merge_id: MergeId) -> Option<MergeRecord> {
        self.reversed_by.get(&merge_id).and_then(|id| self.get_merge(*id))
    }

    // ---- transactions ----

    /// Checks every write in `tx` against current state without mutating it.
    pub(crate) fn validate(&self, tx: &StoreTransaction) -> Result<(), StorageError> {
        let org = tx.org_id;

        let mut staged: HashSet<EntityId> = HashSet::new();
        for entity in &tx.inserted_entities {
            check_scope(|| format!("entity {}", entity.id), org, entity.org_id)?;
            self.check_insert_entity(entity)?;
            if !staged.insert(entity.id) {
                return Err(StorageError::DuplicateKey(format!("entity {}", entity.id)));
            }
        }

        let mut updated: HashSet<EntityId> = HashSet::new();
        for entity in &tx.updated_entities {
            check_scope(|| format!("entity {}", entity.id), org, entity.org_id)?;
            let stored = self
                .entities
                .get(&entity.id)
                .ok_or(StorageError::EntityNotFound(entity.id))?;
            check_scope(|| format!("entity {}", entity.id), org, stored.org_id)?;
            if entity.version <= stored.version {
                return Err(StorageError::Conflict(format!(
                    "entity {} version {} is not newer than stored version {}",
                    entity.id, entity.version, stored.version
                )));
            }
            if staged.contains(&entity.id) || !updated.insert(entity.id) {
                return Err(StorageError::Conflict(format!(
                    "entity {} written twice in one transaction",
                    entity.id
                )));
            }
        }

        let mut assigned: HashSet<MentionId> = HashSet::new();
        for assignment in &tx.assignments {
            let mention = self
                .mentions
                .get(&assignment.mention_id)
                .ok_or(StorageError::MentionNotFound(assignment.mention_id))?;
            check_scope(|| format!("mention {}", mention.id), org, mention.org_id)?;
            if mention.resolved_entity_id != assignment.expected {
                return Err(StorageError::Conflict(format!(
                    "mention {} owner changed: expected {:?}, found {:?}",
                    mention.id, assignment.expected, mention.resolved_entity_id
                )));
            }
            if !assigned.insert(assignment.mention_id) {
                return Err(StorageError::Conflict(format!(
                    "mention {} assigned twice in one transaction",
                    assignment.mention_id
                )));
            }
            match self.entities.get(&assignment.new_owner) {
                Some(owner) => check_scope(
                    || format!("entity {}", assignment.new_owner),
                    org,
                    owner.org_id,
                )?,
                None if staged.contains(&assignment.new_owner) => {}
                None => return Err(StorageError::EntityNotFound(assignment.new_owner)),
            }
        }

        let mut staged_merges: HashSet<MergeId> = HashSet::new();
        let mut reversals: HashSet<MergeId> = HashSet::new();
        for record in &tx.merge_records {
            check_scope(|| format!("merge {}", record.id), org, record.org_id)?;
            self.check_append_merge(record, &staged, &reversals)?;
            if !staged_merges.insert(record.id) {
                return Err(StorageError::DuplicateKey(format!("merge {}", record.id)));
            }
            if let Some(reversed) = record.reverses {
                reversals.insert(reversed);
            }
        }

        Ok(())
    }

    /// Applies a transaction that already passed [`Self::validate`].
    pub(crate) fn apply(&mut self, tx: StoreTransaction) {
        for entity in tx.inserted_entities {
            self.apply_insert_entity(entity);
        }
        for entity in tx.updated_entities {
            self.apply_update_entity(entity);
        }
        for assignment in tx.assignments {
            if let Some(mention) = self.mentions.get_mut(&assignment.mention_id) {
                if let Some(prev) = mention.resolved_entity_id {
                    if let Some(set) = self.mentions_by_entity.get_mut(&prev) {
                        set.remove(&assignment.mention_id);
                        if set.is_empty() {
                            self.mentions_by_entity.remove(&prev);
                        }
                    }
                }
                mention.resolved_entity_id = Some(assignment.new_owner);
                self.mentions_by_entity
                    .entry(assignment.new_owner)
                    .or_default()
                    .insert(assignment.mention_id);
            }
        }
        for record in tx.merge_records {
            self.apply_append_merge(record);
        }
    }
}

/// Thread-safe in-memory resolution store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current row counts.
    ///
    /// # Errors
    /// Returns `BackendError` if the lock is poisoned.
    pub fn stats(&self) -> Result<StoreStats, StorageError> {
        Ok(self.state.read().map_err(|_| lock_err("store.stats"))?.stats())
    }
}

impl MentionStore for InMemoryStore {
    fn insert_mention(&self, mention: Mention) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("mention.insert"))?;
        state.check_insert_mention(&mention)?;
        state.apply_insert_mention(mention);
        Ok(())
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

impl EntityStore for InMemoryStore {
    fn insert_entity(&self, entity: Entity) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("entity.insert"))?;
        state.check_insert_entity(&entity)?;
        state.apply_insert_entity(entity);
        Ok(())
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

impl MergeHistoryStore for InMemoryStore {
    fn append_merge(&self, record: MergeRecord) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("merge.append"))?;
        state.check_append_merge(&record, &HashSet::new(), &HashSet::new())?;
        state.apply_append_merge(record);
        Ok(())
    }

    fn get_merge(&self, id: MergeId) -> Result<Option<MergeRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("merge.get"))?;
        Ok(state.get_merge(id))
    }

    fn merges_by_target(
        &self,
        org_id: OrgId,
        entity_id: EntityId,
    ) -> Result<Vec<MergeRecord>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("merge.by_target"))?;
        Ok(state.merges_by_target(org_id, entity_id))
    }

    fn merges_by_source(
        &self,
        org_id: OrgId,
        source: &MergeSource,
    ) -> Result<Vec<MergeRecord>, StorageError> {
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

impl ResolutionStore for InMemoryStore {
    fn commit(&self, tx: StoreTransaction) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("store.commit"))?;
        state.validate(&tx)?;
        state.apply(tx);
        Ok(())
    }
}
