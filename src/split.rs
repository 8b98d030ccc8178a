//! Split and unmerge: the only way a mention leaves an entity.
//!
//! Both operations validate fully, then commit the new entity, the entity
//! updates, the ownership moves and the history row in one transaction
//! under the organization's lock. Validation failures write nothing.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::cluster::OrgLocks;
use crate::config::EntityEmbeddingPolicy;
use crate::entity::{Entity, EntityStatus};
use crate::error::SplitError;
use crate::history::{MergeReason, MergeRecord, MergeSource, RecordMerge};
use crate::ids::{EntityId, MentionId, MergeId, OrgId, UserId};
use crate::mention::Mention;
use crate::registry::EntityRegistry;
use crate::storage::{ResolutionStore, StoreTransaction};

/// Result of [`SplitService::split_entity`].
#[derive(Debug, Clone)]
pub struct SplitOutcome {
    /// The entity that kept the remaining mentions.
    pub original: Entity,
    /// The entity founded by the split-off mentions.
    pub new: Entity,
    /// The `manual-split` history row.
    pub merge_id: MergeId,
}

/// Result of [`SplitService::unmerge`].
#[derive(Debug, Clone)]
pub struct UnmergeOutcome {
    /// The record that was reversed.
    pub reversed: MergeId,
    /// The appended `unmerge` record.
    pub merge_id: MergeId,
    /// The entity the mentions were merged into.
    pub target: Entity,
    /// The entity the mentions went back to.
    pub restored: Entity,
    /// Mentions that changed owner.
    pub restored_mentions: Vec<MentionId>,
    /// True if the source entity no longer existed and `restored` is new.
    pub recreated: bool,
}

pub(crate) fn scoped(expected: OrgId, actual: OrgId) -> Result<(), SplitError> {
    if expected == actual {
        Ok(())
    } else {
        Err(SplitError::ScopeMismatch { expected, actual })
    }
}

/// Loads an entity of `org_id` that still accepts mentions.
pub(crate) fn load_active(
    store: &dyn ResolutionStore,
    org_id: OrgId,
    entity_id: EntityId,
) -> Result<Entity, SplitError> {
    let entity = store
        .get_entity(entity_id)?
        .ok_or(SplitError::EntityNotFound { entity_id })?;
    scoped(org_id, entity.org_id)?;
    match entity.status {
        EntityStatus::Active => Ok(entity),
        EntityStatus::MergedInto(merged_into) => Err(SplitError::EntityInactive {
            entity_id,
            merged_into,
        }),
    }
}

/// Drops what `entity` drew from mentions that left: the representative
/// embedding if it came from one, and aliases no `staying` mention carries.
fn forget_departed(entity: &mut Entity, departed: &HashSet<MentionId>, staying: &[Mention]) {
    if entity
        .representative_mention
        .is_some_and(|m| departed.contains(&m))
    {
        entity.embedding = None;
        entity.representative_mention = None;
    }
    entity.retain_aliases_of(staying);
}

/// Mentions a record without a moved list brought to its target: the
/// mention it names, or for an entity source the target's mentions from the
/// record's extraction run that existed when it was written.
fn correlated_mentions(record: &MergeRecord, on_target: &[Mention]) -> Vec<MentionId> {
    match record.source {
        MergeSource::Mention(mention_id) => vec![mention_id],
        MergeSource::Entity(_) => record
            .extraction_run_id
            .as_deref()
            .map(|run| {
                on_target
                    .iter()
                    .filter(|m| m.provenance.extraction_run_id == run && m.created_at <= record.recorded_at)
                    .map(|m| m.id)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Founds an entity from mentions that are leaving another one.
fn found_entity(mentions: &[Mention], policy: EntityEmbeddingPolicy) -> Option<Entity> {
    let (first, rest) = mentions.split_first()?;
    // Without a stored embedding the registry embeds canonical text, which
    // is the founding mention's text.
    let mut entity = Entity::from_mention(first, None);
    for mention in rest {
        entity.absorb(mention, None, policy);
    }
    Some(entity)
}

/// Manual correction of clustering decisions.
#[derive(Clone)]
pub struct SplitService {
    store: Arc<dyn ResolutionStore>,
    registry: EntityRegistry,
    locks: Arc<OrgLocks>,
}

impl fmt::Debug for SplitService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitService").finish_non_exhaustive()
    }
}

impl SplitService {
    #[must_use]
    pub fn new(store: Arc<dyn ResolutionStore>, registry: EntityRegistry, locks: Arc<OrgLocks>) -> Self {
        Self {
            store,
            registry,
            locks,
        }
    }

    /// Runs before the commit so the bloom stage never misses a committed entity.
    fn index(&self, entity: &Entity) {
        if let Err(err) = self.registry.index_entity(entity) {
            tracing::warn!(entity_id = %entity.id, error = %err, "bloom insert failed");
        }
    }

    /// Moves `mention_ids` off `entity_id` into a new entity.
    ///
    /// The new entity takes its canonical text from the first listed
    /// mention. At least one mention must stay on the original.
    ///
    /// # Errors
    /// - `EmptySelection` / `DuplicateMention` for a malformed list
    /// - `EntityNotFound`, `EntityInactive` or `ScopeMismatch` for the entity
    /// - `MentionNotFound` or `MentionNotOwned` naming the offending mention
    /// - `WouldEmptyEntity` if every mention would leave
    /// - `Storage` if the commit fails
    pub fn split_entity(
        &self,
        org_id: OrgId,
        entity_id: EntityId,
        mention_ids: &[MentionId],
        performed_by: UserId,
    ) -> Result<SplitOutcome, SplitError> {
        if mention_ids.is_empty() {
            return Err(SplitError::EmptySelection);
        }
        let mut selected = HashSet::with_capacity(mention_ids.len());
        for &mention_id in mention_ids {
            if !selected.insert(mention_id) {
                return Err(SplitError::DuplicateMention { mention_id });
            }
        }

        self.locks.with_lock(org_id, || {
            let mut original = load_active(&*self.store, org_id, entity_id)?;

            let mut moving = Vec::with_capacity(mention_ids.len());
            for &mention_id in mention_ids {
                let mention = self
                    .store
                    .get_mention(mention_id)?
                    .ok_or(SplitError::MentionNotFound { mention_id })?;
                scoped(org_id, mention.org_id)?;
                if mention.resolved_entity_id != Some(entity_id) {
                    return Err(SplitError::MentionNotOwned {
                        mention_id,
                        entity_id,
                        actual: mention.resolved_entity_id,
                    });
                }
                moving.push(mention);
            }

            let owned = self.store.mentions_for_entity(entity_id)?;
            if owned.len() <= moving.len() {
                return Err(SplitError::WouldEmptyEntity { entity_id });
            }
            let staying: Vec<Mention> = owned
                .into_iter()
                .filter(|m| !selected.contains(&m.id))
                .collect();

            let policy = self.registry.config().entity_embedding;
            let new = found_entity(&moving, policy).ok_or(SplitError::EmptySelection)?;

            forget_departed(&mut original, &selected, &staying);
            original.bump();

            let record = RecordMerge::new(
                org_id,
                MergeSource::Entity(new.id),
                entity_id,
                MergeReason::ManualSplit,
                1.0,
            )
            .with_user(performed_by)
            .with_moved_mentions(mention_ids.to_vec())
            .into_record()?;
            let merge_id = record.id;

            let mut tx = StoreTransaction::new(org_id)
                .insert_entity(new.clone())
                .update_entity(original.clone());
            for &mention_id in mention_ids {
                tx = tx.assign(mention_id, Some(entity_id), new.id);
            }
            self.index(&new);
            self.store.commit(tx.record(record))?;

            tracing::info!(
                org_id = %org_id,
                original = %entity_id,
                new = %new.id,
                moved = mention_ids.len(),
                "entity split"
            );
            Ok(SplitOutcome {
                original,
                new,
                merge_id,
            })
        })
    }

    /// Reverses one merge, clustering or manual, by moving the mentions it
    /// moved back toward its source side.
    ///
    /// Only the record's moved mentions still resolved to its target move.
    /// A record written without a moved list falls back to the mention it
    /// names, or to the target's mentions from the record's extraction run
    /// created before it was written. They return to the source entity when it still exists (reactivating
    /// it after a manual merge); a mention-level merge, or a source that is
    /// gone, gets a fresh entity. The reversed record is left untouched.
    ///
    /// # Errors
    /// - `MergeNotFound` or `ScopeMismatch` for the record
    /// - `NotReversible` for split and unmerge records
    /// - `AlreadyReversed` naming the earlier reversal
    /// - `EntityNotFound` if the merge target is gone
    /// - `NothingToRestore` if no moved mention is still on the target
    /// - `WouldEmptyEntity` if a correlated restore would take every mention
    /// - `Storage` if the commit fails
    pub fn unmerge(
        &self,
        org_id: OrgId,
        merge_id: MergeId,
        performed_by: UserId,
    ) -> Result<UnmergeOutcome, SplitError> {
        self.locks.with_lock(org_id, || {
            let record = self
                .store
                .get_merge(merge_id)?
                .ok_or(SplitError::MergeNotFound { merge_id })?;
            scoped(org_id, record.org_id)?;

            if !record.reason.is_reversible() {
                return Err(SplitError::NotReversible {
                    merge_id,
                    reason: format!("{} records cannot be reversed", record.reason),
                });
            }
            if let Some(reversal) = self.store.reversal_of(merge_id)? {
                return Err(SplitError::AlreadyReversed {
                    merge_id,
                    reversed_by: reversal.id,
                });
            }

            let mut target = self
                .store
                .get_entity(record.target)?
                .ok_or(SplitError::EntityNotFound {
                    entity_id: record.target,
                })?;

            let on_target = self.store.mentions_for_entity(target.id)?;
            let correlated = record.moved_mentions.is_empty();
            let wanted = if correlated {
                correlated_mentions(&record, &on_target)
            } else {
                record.moved_mentions.clone()
            };
            let mut restoring = Vec::with_capacity(wanted.len());
            for mention_id in wanted {
                match on_target.iter().find(|m| m.id == mention_id) {
                    Some(m) => restoring.push(m.clone()),
                    None => {
                        tracing::debug!(
                            merge_id = %merge_id,
                            mention_id = %mention_id,
                            "mention moved on since the merge"
                        );
                    }
                }
            }
            if restoring.is_empty() {
                return Err(SplitError::NothingToRestore {
                    merge_id,
                    entity_id: target.id,
                });
            }
            if correlated && restoring.len() == on_target.len() {
                return Err(SplitError::WouldEmptyEntity { entity_id: target.id });
            }
            let restored_ids: Vec<MentionId> = restoring.iter().map(|m| m.id).collect();

            let existing_source = match record.source {
                MergeSource::Entity(source_id) => self.store.get_entity(source_id)?,
                MergeSource::Mention(_) => None,
            };
            let policy = self.registry.config().entity_embedding;
            let (restored, recreated) = match existing_source {
                Some(mut source) => {
                    if source.is_active() {
                        source.bump();
                    } else {
                        source.reactivate();
                    }
                    (source, false)
                }
                None => (
                    found_entity(&restoring, policy).ok_or(SplitError::NothingToRestore {
                        merge_id,
                        entity_id: target.id,
                    })?,
                    true,
                ),
            };

            let departed: HashSet<MentionId> = restored_ids.iter().copied().collect();
            let staying: Vec<Mention> = on_target
                .into_iter()
                .filter(|m| !departed.contains(&m.id))
                .collect();
            forget_departed(&mut target, &departed, &staying);
            target.bump();

            let unmerge = RecordMerge::new(
                org_id,
                MergeSource::Entity(target.id),
                restored.id,
                MergeReason::Unmerge,
                1.0,
            )
            .with_user(performed_by)
            .with_moved_mentions(restored_ids.clone())
            .reversing(merge_id)
            .into_record()?;
            let unmerge_id = unmerge.id;

            let mut tx = StoreTransaction::new(org_id).update_entity(target.clone());
            tx = if recreated {
                tx.insert_entity(restored.clone())
            } else {
                tx.update_entity(restored.clone())
            };
            for &mention_id in &restored_ids {
                tx = tx.assign(mention_id, Some(target.id), restored.id);
            }
            self.index(&restored);
            self.store.commit(tx.record(unmerge))?;

            tracing::info!(
                org_id = %org_id,
                reversed = %merge_id,
                target = %target.id,
                restored = %restored.id,
                recreated,
                moved = restored_ids.len(),
                "merge reversed"
            );
            Ok(UnmergeOutcome {
                reversed: merge_id,
                merge_id: unmerge_id,
                target,
                restored,
                restored_mentions: restored_ids,
                recreated,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolutionConfig;
    use crate::embedding::LexicalEmbedder;
    use crate::entity::EntityType;
    use crate::history::MergeHistory;
    use crate::mention::{Provenance, TextSpan};
    use crate::storage::{EntityStore, InMemoryStore, MentionStore, MergeHistoryStore};

    struct Fixture {
        store: Arc<InMemoryStore>,
        service: SplitService,
        org: OrgId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let registry = EntityRegistry::new(
            store.clone(),
            Arc::new(LexicalEmbedder::default()),
            ResolutionConfig::default(),
        );
        let service = SplitService::new(store.clone(), registry, Arc::new(OrgLocks::new()));
        Fixture {
            store,
            service,
            org: OrgId::new(),
        }
    }

    fn user() -> UserId {
        UserId::new("reviewer@example.com")
    }

    impl Fixture {
        fn mention(&self, text: &str) -> Mention {
            Mention::builder()
                .org(self.org)
                .text(text)
                .mention_type(EntityType::Person)
                .confidence(0.9)
                .provenance(Provenance::new("run-1", "doc", TextSpan::new(0, 4).unwrap(), text))
                .build()
                .unwrap()
        }

        /// One entity owning a mention per text; the first text founds it.
        fn entity_with(&self, texts: &[&str]) -> (Entity, Vec<MentionId>) {
            let mentions: Vec<Mention> = texts.iter().map(|t| self.mention(t)).collect();
            let mut entity = Entity::from_mention(&mentions[0], Some(vec![1.0, 0.0]));
            for m in &mentions[1..] {
                entity.absorb(m, None, EntityEmbeddingPolicy::Canonical);
            }
            let mut tx = StoreTransaction::new(self.org).insert_entity(entity.clone());
            for m in &mentions {
                self.store.insert_mention(m.clone()).unwrap();
                tx = tx.assign(m.id, None, entity.id);
            }
            self.store.commit(tx).unwrap();
            (entity, mentions.iter().map(|m| m.id).collect())
        }

        fn owners(&self, entity_id: EntityId) -> HashSet<MentionId> {
            self.store
                .mentions_for_entity(entity_id)
                .unwrap()
                .into_iter()
                .map(|m| m.id)
                .collect()
        }
    }

    #[test]
    fn split_partitions_the_mentions() {
        let f = fixture();
        let (entity, ids) = f.entity_with(&["Jordan", "Michael Jordan", "Jordan B. Peterson", "Dr Peterson"]);
        let before: HashSet<_> = ids.iter().copied().collect();

        let out = f
            .service
            .split_entity(f.org, entity.id, &[ids[2], ids[3]], user())
            .unwrap();

        let kept = f.owners(out.original.id);
        let moved = f.owners(out.new.id);
        assert!(kept.is_disjoint(&moved));
        assert_eq!(kept.union(&moved).copied().collect::<HashSet<_>>(), before);
        assert_eq!(moved, [ids[2], ids[3]].into_iter().collect());
        assert_eq!(out.new.canonical_text, "Jordan B. Peterson");
        assert_eq!(out.new.aliases, vec!["Dr Peterson".to_string()]);
        assert_eq!(out.original.aliases, vec!["Michael Jordan".to_string()]);
        let stored = f.store.get_entity(entity.id).unwrap().unwrap();
        assert_eq!(stored.aliases, vec!["Michael Jordan".to_string()]);

        let record = f.store.get_merge(out.merge_id).unwrap().unwrap();
        assert_eq!(record.reason, MergeReason::ManualSplit);
        assert_eq!(record.source, MergeSource::Entity(out.new.id));
        assert_eq!(record.target, entity.id);
        assert_eq!(record.merged_by, Some(user()));
    }

    #[test]
    fn split_of_the_representative_mention_drops_the_embedding() {
        let f = fixture();
        let (entity, ids) = f.entity_with(&["Acme", "Acme Ltd"]);
        let out = f.service.split_entity(f.org, entity.id, &[ids[0]], user()).unwrap();
        assert!(out.original.embedding.is_none());
        let stored = f.store.get_entity(entity.id).unwrap().unwrap();
        assert!(stored.representative_mention.is_none());
        assert_eq!(stored.version, entity.version + 1);
    }

    #[test]
    fn split_with_foreign_mention_writes_nothing() {
        let f = fixture();
        let (entity, ids) = f.entity_with(&["Acme", "Acme Ltd"]);
        let (other, other_ids) = f.entity_with(&["Globex"]);
        let before = f.store.stats().unwrap();

        let err = f
            .service
            .split_entity(f.org, entity.id, &[ids[1], other_ids[0]], user())
            .unwrap_err();
        match err {
            SplitError::MentionNotOwned {
                mention_id,
                entity_id,
                actual,
            } => {
                assert_eq!(mention_id, other_ids[0]);
                assert_eq!(entity_id, entity.id);
                assert_eq!(actual, Some(other.id));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(f.store.stats().unwrap(), before);
        assert_eq!(f.owners(entity.id).len(), 2);
    }

    #[test]
    fn split_validation_errors() {
        let f = fixture();
        let (entity, ids) = f.entity_with(&["Acme", "Acme Ltd"]);

        assert!(matches!(
            f.service.split_entity(f.org, entity.id, &[], user()),
            Err(SplitError::EmptySelection)
        ));
        assert!(matches!(
            f.service.split_entity(f.org, entity.id, &[ids[0], ids[0]], user()),
            Err(SplitError::DuplicateMention { .. })
        ));
        assert!(matches!(
            f.service.split_entity(f.org, entity.id, &ids, user()),
            Err(SplitError::WouldEmptyEntity { .. })
        ));
        assert!(matches!(
            f.service.split_entity(f.org, EntityId::new(), &[ids[0]], user()),
            Err(SplitError::EntityNotFound { .. })
        ));
        assert!(matches!(
            f.service.split_entity(f.org, entity.id, &[MentionId::new()], user()),
            Err(SplitError::MentionNotFound { .. })
        ));
        assert!(matches!(
            f.service.split_entity(OrgId::new(), entity.id, &[ids[0]], user()),
            Err(SplitError::ScopeMismatch { .. })
        ));
    }

    fn automatic_merge(f: &Fixture, target: &Entity, mention: &Mention) -> MergeId {
        f.store.insert_mention(mention.clone()).unwrap();
        let mut updated = f.store.get_entity(target.id).unwrap().unwrap();
        updated.absorb(mention, None, EntityEmbeddingPolicy::Canonical);
        let record = RecordMerge::new(
            f.org,
            MergeSource::Mention(mention.id),
            target.id,
            MergeReason::EmbeddingSimilarity,
            0.92,
        )
        .with_moved_mentions(vec![mention.id])
        .into_record()
        .unwrap();
        let id = record.id;
        f.store
            .commit(
                StoreTransaction::new(f.org)
                    .update_entity(updated)
                    .assign(mention.id, None, target.id)
                    .record(record),
            )
            .unwrap();
        id
    }

    #[test]
    fn unmerge_restores_two_entities_and_appends_a_record() {
        let f = fixture();
        let (entity, founder) = f.entity_with(&["Cristiano Ronaldo"]);
        let alias = f.mention("C. Ronaldo");
        let merge_id = automatic_merge(&f, &entity, &alias);
        let original_row = f.store.get_merge(merge_id).unwrap().unwrap();

        let out = f.service.unmerge(f.org, merge_id, user()).unwrap();
        assert!(out.recreated);
        assert_ne!(out.restored.id, entity.id);
        assert_eq!(out.restored_mentions, vec![alias.id]);
        assert_eq!(out.restored.canonical_text, "C. Ronaldo");
        assert!(out.target.aliases.is_empty());

        assert_eq!(f.owners(entity.id), founder.into_iter().collect());
        assert_eq!(f.owners(out.restored.id), [alias.id].into_iter().collect());
        assert_eq!(f.store.entities_for_org(f.org).unwrap().len(), 2);

        let reversal = f.store.get_merge(out.merge_id).unwrap().unwrap();
        assert_eq!(reversal.reason, MergeReason::Unmerge);
        assert_eq!(reversal.reverses, Some(merge_id));
        assert_eq!(f.store.get_merge(merge_id).unwrap().unwrap(), original_row);

        assert!(matches!(
            f.service.unmerge(f.org, merge_id, user()),
            Err(SplitError::AlreadyReversed { reversed_by, .. }) if reversed_by == out.merge_id
        ));
    }

    #[test]
    fn unmerge_rejects_reversal_records() {
        let f = fixture();
        let (entity, ids) = f.entity_with(&["Acme", "Acme Ltd"]);
        let split = f.service.split_entity(f.org, entity.id, &[ids[1]], user()).unwrap();
        assert!(matches!(
            f.service.unmerge(f.org, split.merge_id, user()),
            Err(SplitError::NotReversible { .. })
        ));
        assert!(matches!(
            f.service.unmerge(f.org, MergeId::new(), user()),
            Err(SplitError::MergeNotFound { .. })
        ));
    }

    #[test]
    fn unmerge_after_split_moved_the_mention_has_nothing_to_restore() {
        let f = fixture();
        let (entity, _) = f.entity_with(&["Acme"]);
        let extra = f.mention("Acme Incorporated");
        let merge_id = automatic_merge(&f, &entity, &extra);
        f.service.split_entity(f.org, entity.id, &[extra.id], user()).unwrap();

        assert!(matches!(
            f.service.unmerge(f.org, merge_id, user()),
            Err(SplitError::NothingToRestore { .. })
        ));
    }

    #[test]
    fn unmerge_of_a_record_without_moved_list_restores_its_mention() {
        let f = fixture();
        let (entity, founder) = f.entity_with(&["Cristiano Ronaldo"]);
        let alias = f.mention("C. Ronaldo");
        f.store.insert_mention(alias.clone()).unwrap();
        let mut updated = f.store.get_entity(entity.id).unwrap().unwrap();
        updated.absorb(&alias, None, EntityEmbeddingPolicy::Canonical);
        f.store
            .commit(
                StoreTransaction::new(f.org)
                    .update_entity(updated)
                    .assign(alias.id, None, entity.id),
            )
            .unwrap();
        let record = MergeHistory::new(f.store.clone())
            .record_merge(RecordMerge::new(
                f.org,
                MergeSource::Mention(alias.id),
                entity.id,
                MergeReason::EmbeddingSimilarity,
                0.9,
            ))
            .unwrap();
        assert!(record.moved_mentions.is_empty());

        let out = f.service.unmerge(f.org, record.id, user()).unwrap();
        assert!(out.recreated);
        assert_eq!(out.restored_mentions, vec![alias.id]);
        assert_eq!(f.owners(entity.id), founder.into_iter().collect());
        assert_eq!(f.owners(out.restored.id), [alias.id].into_iter().collect());
        assert!(f.store.get_entity(entity.id).unwrap().unwrap().aliases.is_empty());
    }

    #[test]
    fn unmerge_of_an_entity_record_without_moved_list_uses_its_run() {
        let f = fixture();
        let (entity, founder) = f.entity_with(&["Acme"]);
        let late = Mention::builder()
            .org(f.org)
            .text("Acme Holdings")
            .mention_type(EntityType::Organization)
            .confidence(0.8)
            .provenance(Provenance::new("run-2", "doc", TextSpan::new(0, 4).unwrap(), "r"))
            .build()
            .unwrap();
        f.store.insert_mention(late.clone()).unwrap();
        f.store
            .commit(StoreTransaction::new(f.org).assign(late.id, None, entity.id))
            .unwrap();
        let record = MergeHistory::new(f.store.clone())
            .record_merge(
                RecordMerge::new(
                    f.org,
                    MergeSource::Entity(EntityId::new()),
                    entity.id,
                    MergeReason::ManualOverride,
                    1.0,
                )
                .with_user(user())
                .with_extraction_run("run-2"),
            )
            .unwrap();

        let out = f.service.unmerge(f.org, record.id, user()).unwrap();
        assert!(out.recreated);
        assert_eq!(out.restored_mentions, vec![late.id]);
        assert_eq!(f.owners(entity.id), founder.into_iter().collect());
    }

    #[test]
    fn unmerge_without_moved_list_or_run_has_nothing_to_restore() {
        let f = fixture();
        let (entity, _) = f.entity_with(&["Acme", "Acme Ltd"]);
        let record = MergeHistory::new(f.store.clone())
            .record_merge(
                RecordMerge::new(
                    f.org,
                    MergeSource::Entity(EntityId::new()),
                    entity.id,
                    MergeReason::ManualOverride,
                    1.0,
                )
                .with_user(user()),
            )
            .unwrap();
        assert!(matches!(
            f.service.unmerge(f.org, record.id, user()),
            Err(SplitError::NothingToRestore { .. })
        ));
        assert_eq!(f.owners(entity.id).len(), 2);
    }
}
