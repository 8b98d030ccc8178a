//! Incremental clustering of mention batches.
//!
//! A batch runs in two stages. Stage A prefetches every mention embedding on
//! the search pool in parallel. Stage B walks the mentions in `created_at`
//! order under the organization's lock: search candidates (on the pool, with
//! a deadline), then either merge into the best candidate or found a new
//! entity, committing entity, mention and history writes as one transaction.
//! A failure only ever fails the mention it belongs to.

mod locks;
mod runtime;

pub use locks::OrgLocks;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::config::ResolutionConfig;
use crate::entity::Entity;
use crate::error::{ClusterError, RegistryError, ResolveError};
use crate::history::{MergeReason, MergeSource, RecordMerge};
use crate::ids::{EntityId, MentionId, MergeId, OrgId};
use crate::mention::Mention;
use crate::registry::{EntityCandidate, EntityRegistry};
use crate::storage::{ResolutionStore, StorageError, StoreTransaction};

use runtime::{PoolError, SearchPool};

/// What happened to one mention.
#[derive(Debug)]
pub enum ClusterOutcome {
    /// Joined an existing entity.
    Merged {
        /// The merged mention.
        mention_id: MentionId,
        /// The entity it joined.
        entity_id: EntityId,
        /// History row written for the merge.
        merge_id: MergeId,
        /// Similarity to the winning candidate.
        similarity: f32,
        /// `embedding-similarity` or `text-exact-match`.
        reason: MergeReason,
    },
    /// Founded a new entity.
    Created {
        /// The founding mention.
        mention_id: MentionId,
        /// The new entity.
        entity_id: EntityId,
    },
    /// Left unresolved.
    Failed {
        /// The mention that failed.
        mention_id: MentionId,
        /// Why it failed.
        error: ClusterError,
    },
}

impl ClusterOutcome {
    /// The mention this outcome describes.
    #[must_use]
    pub const fn mention_id(&self) -> MentionId {
        match self {
            Self::Merged { mention_id, .. }
            | Self::Created { mention_id, .. }
            | Self::Failed { mention_id, .. } => *mention_id,
        }
    }

    /// The entity the mention now resolves to, unless it failed.
    #[must_use]
    pub const fn entity_id(&self) -> Option<EntityId> {
        match self {
            Self::Merged { entity_id, .. } | Self::Created { entity_id, .. } => Some(*entity_id),
            Self::Failed { .. } => None,
        }
    }

    /// True for [`ClusterOutcome::Failed`].
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Per-mention outcomes of one batch.
///
/// Mentions rejected before processing (wrong organization, already
/// resolved, duplicated) come first, then the rest in processing order.
#[derive(Debug)]
pub struct ClusterResult {
    /// Organization the batch was clustered for.
    pub org_id: OrgId,
    /// One outcome per submitted mention.
    pub outcomes: Vec<ClusterOutcome>,
}

impl ClusterResult {
    /// Mentions that joined an existing entity.
    #[must_use]
    pub fn merged_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ClusterOutcome::Merged { .. }))
            .count()
    }

    /// Mentions that founded a new entity.
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, ClusterOutcome::Created { .. }))
            .count()
    }

    /// Mentions left unresolved.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_failure()).count()
    }

    /// Mentions to resubmit.
    #[must_use]
    pub fn failed_mention_ids(&self) -> Vec<MentionId> {
        self.outcomes
            .iter()
            .filter(|o| o.is_failure())
            .map(ClusterOutcome::mention_id)
            .collect()
    }

    /// Failed outcomes with their errors.
    pub fn failures(&self) -> impl Iterator<Item = &ClusterError> {
        self.outcomes.iter().filter_map(|o| match o {
            ClusterOutcome::Failed { error, .. } => Some(error),
            ClusterOutcome::Merged { .. } | ClusterOutcome::Created { .. } => None,
        })
    }

    /// Outcome for one mention.
    #[must_use]
    pub fn outcome(&self, mention_id: MentionId) -> Option<&ClusterOutcome> {
        self.outcomes.iter().find(|o| o.mention_id() == mention_id)
    }

    /// True when no mention failed.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| !o.is_failure())
    }
}

fn pool_error(mention_id: MentionId, err: PoolError) -> ClusterError {
    match err {
        PoolError::QueueFull { capacity } => ClusterError::QueueFull {
            mention_id,
            capacity,
        },
        PoolError::Disconnected => ClusterError::Disconnected { mention_id },
        PoolError::Timeout { duration_ms } => ClusterError::Timeout {
            mention_id,
            duration_ms,
        },
    }
}

/// Resolves batches of mentions into entities.
#[derive(Clone)]
pub struct IncrementalClusterer {
    store: Arc<dyn ResolutionStore>,
    registry: EntityRegistry,
    locks: Arc<OrgLocks>,
    pool: Arc<SearchPool>,
    config: Arc<ResolutionConfig>,
}

impl fmt::Debug for IncrementalClusterer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncrementalClusterer")
            .field("registry", &self.registry)
            .field("queue_capacity", &self.pool.queue_capacity())
            .finish_non_exhaustive()
    }
}

impl IncrementalClusterer {
    /// Starts the search pool sized by the registry's `search` config.
    ///
    /// # Errors
    /// Returns `ResolveError::Internal` if a worker thread cannot be spawned.
    pub fn new(
        store: Arc<dyn ResolutionStore>,
        registry: EntityRegistry,
        locks: Arc<OrgLocks>,
    ) -> Result<Self, ResolveError> {
        let config = Arc::new(registry.config().clone());
        let pool = SearchPool::start(config.search.workers, config.search.queue_capacity)
            .map_err(|e| ResolveError::internal(format!("failed to start search workers: {e}")))?;
        Ok(Self {
            store,
            registry,
            locks,
            pool: Arc::new(pool),
            config,
        })
    }

    /// The registry used for candidate search.
    #[must_use]
    pub const fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Resolves `mentions` for `org_id`. Never fails as a whole; inspect the
    /// per-mention outcomes.
    pub fn cluster(&self, org_id: OrgId, mentions: Vec<Mention>) -> ClusterResult {
        let total = mentions.len();
        let mut outcomes = Vec::with_capacity(total);

        let mut seen = HashSet::new();
        let mut accepted = Vec::with_capacity(total);
        for mention in mentions {
            let mention_id = mention.id;
            let rejected = if mention.org_id != org_id {
                Some(ClusterError::ScopeMismatch {
                    mention_id,
                    expected: org_id,
                    actual: mention.org_id,
                })
            } else if let Some(entity_id) = mention.resolved_entity_id {
                Some(ClusterError::AlreadyResolved {
                    mention_id,
                    entity_id,
                })
            } else if !seen.insert(mention_id) {
                Some(ClusterError::DuplicateInBatch { mention_id })
            } else {
                None
            };
            match rejected {
                Some(error) => outcomes.push(ClusterOutcome::Failed { mention_id, error }),
                None => accepted.push(mention),
            }
        }

        // Stable: input order breaks created_at ties.
        accepted.sort_by_key(|m| m.created_at);

        let embeddings = self.prefetch_embeddings(&accepted);

        for (mention, embedding) in accepted.into_iter().zip(embeddings) {
            let mention_id = mention.id;
            let outcome = embedding
                .and_then(|embedding| {
                    self.locks
                        .with_lock(org_id, || self.resolve_one(org_id, mention, embedding))
                })
                .unwrap_or_else(|error| ClusterOutcome::Failed { mention_id, error });
            if let ClusterOutcome::Failed { error, .. } = &outcome {
                tracing::warn!(
                    mention_id = %mention_id,
                    retryable = error.is_retryable(),
                    error = %error,
                    "mention left unresolved"
                );
            }
            outcomes.push(outcome);
        }

        let result = ClusterResult { org_id, outcomes };
        tracing::info!(
            org_id = %org_id,
            mentions = total,
            merged = result.merged_count(),
            created = result.created_count(),
            failed = result.failed_count(),
            "batch clustered"
        );
        result
    }

    /// Stage A: embeds every mention on the pool, at most one queue's worth
    /// in flight at a time.
    fn prefetch_embeddings(&self, mentions: &[Mention]) -> Vec<Result<Vec<f32>, ClusterError>> {
        let timeout = self.config.search.timeout();
        let mut out = Vec::with_capacity(mentions.len());

        for chunk in mentions.chunks(self.pool.queue_capacity()) {
            let handles: Vec<_> = chunk
                .iter()
                .map(|mention| {
                    let registry = self.registry.clone();
                    let owned = mention.clone();
                    (
                        mention.id,
                        self.pool.submit(move || registry.embed_mention(&owned)),
                    )
                })
                .collect();

            for (mention_id, handle) in handles {
                let embedding = handle
                    .and_then(|h| h.join_timeout(timeout))
                    .map_err(|err| pool_error(mention_id, err))
                    .and_then(|res| {
                        res.map_err(|source| ClusterError::Search { mention_id, source })
                    });
                out.push(embedding);
            }
        }
        out
    }

    fn search(
        &self,
        mention: &Mention,
        embedding: &[f32],
    ) -> Result<Vec<EntityCandidate>, ClusterError> {
        let mention_id = mention.id;
        let registry = self.registry.clone();
        let owned = mention.clone();
        let emb = embedding.to_vec();
        let handle = self
            .pool
            .submit(move || registry.find_candidates_with_embedding(&owned, &emb))
            .map_err(|err| pool_error(mention_id, err))?;
        handle
            .join_timeout(self.config.search.timeout())
            .map_err(|err| pool_error(mention_id, err))?
            .map_err(|source: RegistryError| ClusterError::Search { mention_id, source })
    }

    /// Stage B for one mention; the caller holds the organization lock.
    fn resolve_one(
        &self,
        org_id: OrgId,
        mention: Mention,
        embedding: Vec<f32>,
    ) -> Result<ClusterOutcome, ClusterError> {
        let mention_id = mention.id;
        let commit_err = |source: StorageError| ClusterError::Commit { mention_id, source };

        match self.store.get_mention(mention_id).map_err(commit_err)? {
            None => self.store.insert_mention(mention.clone()).map_err(commit_err)?,
            Some(stored) => {
                if let Some(entity_id) = stored.resolved_entity_id {
                    return Err(ClusterError::AlreadyResolved {
                        mention_id,
                        entity_id,
                    });
                }
                if !stored.same_evidence(&mention) {
                    return Err(commit_err(StorageError::Conflict(format!(
                        "mention {mention_id} differs from the stored record"
                    ))));
                }
            }
        }

        let candidates = self.search(&mention, &embedding)?;
        let threshold = self.config.merge_threshold;

        match candidates.into_iter().next() {
            Some(best) if best.similarity > threshold => {
                self.merge_into(org_id, &mention, &embedding, best)
            }
            _ => self.create_from(org_id, &mention, embedding),
        }
    }

    fn merge_into(
        &self,
        org_id: OrgId,
        mention: &Mention,
        embedding: &[f32],
        best: EntityCandidate,
    ) -> Result<ClusterOutcome, ClusterError> {
        let mention_id = mention.id;
        let similarity = best.similarity;
        let reason = if similarity >= 1.0 - self.config.exact_match_epsilon {
            MergeReason::TextExactMatch
        } else {
            MergeReason::EmbeddingSimilarity
        };

        let mut entity = best.entity;
        entity.absorb(mention, Some(embedding), self.config.entity_embedding);
        let entity_id = entity.id;

        let record = RecordMerge::new(
            org_id,
            MergeSource::Mention(mention_id),
            entity_id,
            reason,
            similarity,
        )
        .with_moved_mentions(vec![mention_id])
        .with_extraction_run(mention.provenance.extraction_run_id.clone())
        .into_record()
        .map_err(|e| ClusterError::Commit {
            mention_id,
            source: StorageError::BackendError(e.to_string()),
        })?;
        let merge_id = record.id;

        self.store
            .commit(
                StoreTransaction::new(org_id)
                    .update_entity(entity)
                    .assign(mention_id, None, entity_id)
                    .record(record),
            )
            .map_err(|source| ClusterError::Commit { mention_id, source })?;

        tracing::debug!(
            mention_id = %mention_id,
            entity_id = %entity_id,
            similarity,
            reason = %reason,
            "mention merged"
        );
        Ok(ClusterOutcome::Merged {
            mention_id,
            entity_id,
            merge_id,
            similarity,
            reason,
        })
    }

    fn create_from(
        &self,
        org_id: OrgId,
        mention: &Mention,
        embedding: Vec<f32>,
    ) -> Result<ClusterOutcome, ClusterError> {
        let mention_id = mention.id;
        let entity = Entity::from_mention(mention, Some(embedding));
        let entity_id = entity.id;

        // Indexed before the commit: a failed commit costs a false positive,
        // never a false negative.
        if let Err(err) = self.registry.index_entity(&entity) {
            tracing::warn!(entity_id = %entity_id, error = %err, "bloom insert failed");
        }

        self.store
            .commit(
                StoreTransaction::new(org_id)
                    .insert_entity(entity)
                    .assign(mention_id, None, entity_id),
            )
            .map_err(|source| ClusterError::Commit { mention_id, source })?;

        tracing::debug!(mention_id = %mention_id, entity_id = %entity_id, "entity created");
        Ok(ClusterOutcome::Created {
            mention_id,
            entity_id,
        })
    }
}
