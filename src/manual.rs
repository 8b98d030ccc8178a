//! User-approved entity merges.

use std::fmt;
use std::sync::Arc;

use crate::cluster::OrgLocks;
use crate::config::EntityEmbeddingPolicy;
use crate::error::SplitError;
use crate::history::{MergeRecord, MergeReason, MergeSource, RecordMerge};
use crate::ids::{EntityId, OrgId, UserId};
use crate::split::load_active;
use crate::storage::{ResolutionStore, StoreTransaction};

/// Folds one entity into another on a user's say-so.
///
/// The source keeps its row with status `MergedInto(target)` and drops out
/// of candidate search; every mention it owned moves to the target. The
/// `manual-override` record can be reversed with
/// [`crate::SplitService::unmerge`], which reactivates the source.
#[derive(Clone)]
pub struct ManualMerge {
    store: Arc<dyn ResolutionStore>,
    locks: Arc<OrgLocks>,
}

impl fmt::Debug for ManualMerge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualMerge").finish_non_exhaustive()
    }
}

impl ManualMerge {
    #[must_use]
    pub fn new(store: Arc<dyn ResolutionStore>, locks: Arc<OrgLocks>) -> Self {
        Self { store, locks }
    }

    /// Merges `source` into `target` and returns the history row.
    ///
    /// # Errors
    /// - `SameEntity` if `source == target`
    /// - `EntityNotFound`, `EntityInactive` or `ScopeMismatch` for either entity
    /// - `Validation` for a confidence outside `[0, 1]`
    /// - `Storage` if the commit fails
    pub fn merge_entities(
        &self,
        org_id: OrgId,
        source: EntityId,
        target: EntityId,
        merged_by: UserId,
        confidence: f32,
    ) -> Result<MergeRecord, SplitError> {
        if source == target {
            return Err(SplitError::SameEntity { entity_id: source });
        }

        self.locks.with_lock(org_id, || {
            let mut from = load_active(&*self.store, org_id, source)?;
            let mut into = load_active(&*self.store, org_id, target)?;
            let moving = self.store.mentions_for_entity(source)?;

            // Surface forms carry over as aliases; the target keeps its embedding.
            for mention in &moving {
                into.absorb(mention, None, EntityEmbeddingPolicy::Canonical);
            }
            into.bump();
            from.mark_merged_into(target);

            let moved: Vec<_> = moving.iter().map(|m| m.id).collect();
            let record = RecordMerge::new(
                org_id,
                MergeSource::Entity(source),
                target,
                MergeReason::ManualOverride,
                confidence,
            )
            .with_user(merged_by)
            .with_moved_mentions(moved.clone())
            .into_record()?;

            let mut tx = StoreTransaction::new(org_id)
                .update_entity(from)
                .update_entity(into);
            for &mention_id in &moved {
                tx = tx.assign(mention_id, Some(source), target);
            }
            self.store.commit(tx.record(record.clone()))?;

            tracing::info!(
                org_id = %org_id,
                source = %source,
                target = %target,
                moved = moved.len(),
                "entities merged manually"
            );
            Ok(record)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolutionConfig;
    use crate::embedding::LexicalEmbedder;
    use crate::entity::{Entity, EntityStatus, EntityType};
    use crate::mention::{Mention, Provenance, TextSpan};
    use crate::registry::EntityRegistry;
    use crate::split::SplitService;
    use crate::storage::{EntityStore, InMemoryStore, MentionStore};

    fn seeded(store: &InMemoryStore, org: OrgId, text: &str) -> (Entity, Mention) {
        let mention = Mention::builder()
            .org(org)
            .text(text)
            .mention_type(EntityType::Organization)
            .confidence(0.6)
            .provenance(Provenance::new("run", "doc", TextSpan::new(0, 3).unwrap(), text))
            .build()
            .unwrap();
        let entity = Entity::from_mention(&mention, None);
        store.insert_mention(mention.clone()).unwrap();
        store
            .commit(
                StoreTransaction::new(org)
                    .insert_entity(entity.clone())
                    .assign(mention.id, None, entity.id),
            )
            .unwrap();
        (entity, mention)
    }

    #[test]
    fn merge_moves_mentions_and_retires_source() {
        let store = Arc::new(InMemoryStore::new());
        let locks = Arc::new(OrgLocks::new());
        let org = OrgId::new();
        let (ibm, _) = seeded(&store, org, "IBM");
        let (big_blue, nickname) = seeded(&store, org, "Big Blue");

        let merge = ManualMerge::new(store.clone(), locks.clone());
        let record = merge
            .merge_entities(org, big_blue.id, ibm.id, UserId::new("analyst"), 1.0)
            .unwrap();
        assert_eq!(record.reason, MergeReason::ManualOverride);
        assert_eq!(record.moved_mentions, vec![nickname.id]);
        assert!(!record.is_automatic());

        let retired = store.get_entity(big_blue.id).unwrap().unwrap();
        assert_eq!(retired.status, EntityStatus::MergedInto(ibm.id));
        let target = store.get_entity(ibm.id).unwrap().unwrap();
        assert_eq!(target.aliases, vec!["Big Blue".to_string()]);
        assert_eq!(store.mentions_for_entity(ibm.id).unwrap().len(), 2);

        // Reversal brings the source back.
        let registry = EntityRegistry::new(
            store.clone(),
            Arc::new(LexicalEmbedder::default()),
            ResolutionConfig::default(),
        );
        let split = SplitService::new(store.clone(), registry, locks);
        let out = split.unmerge(org, record.id, UserId::new("analyst")).unwrap();
        assert!(!out.recreated);
        assert_eq!(out.restored.id, big_blue.id);
        assert!(store.get_entity(big_blue.id).unwrap().unwrap().is_active());
        assert_eq!(
            store.get_mention(nickname.id).unwrap().unwrap().resolved_entity_id,
            Some(big_blue.id)
        );
    }

    #[test]
    fn merge_rejects_bad_requests() {
        let store = Arc::new(InMemoryStore::new());
        let org = OrgId::new();
        let (a, _) = seeded(&store, org, "Acme");
        let (b, _) = seeded(&store, org, "Globex");
        let merge = ManualMerge::new(store.clone(), Arc::new(OrgLocks::new()));
        let user = || UserId::new("u");

        assert!(matches!(
            merge.merge_entities(org, a.id, a.id, user(), 1.0),
            Err(SplitError::SameEntity { .. })
        ));
        assert!(matches!(
            merge.merge_entities(org, a.id, b.id, user(), 1.5),
            Err(SplitError::Validation(_))
        ));
        assert!(matches!(
            merge.merge_entities(OrgId::new(), a.id, b.id, user(), 1.0),
            Err(SplitError::ScopeMismatch { .. })
        ));

        merge.merge_entities(org, a.id, b.id, user(), 1.0).unwrap();
        assert!(matches!(
            merge.merge_entities(org, a.id, b.id, user(), 1.0),
            Err(SplitError::EntityInactive { .. })
        ));
    }
}
