//! Candidate search.
//!
//! [`EntityRegistry::find_candidates`] runs a fixed pipeline, cheapest stage
//! first, and stops as soon as a stage comes back empty:
//!
//! 1. normalize the mention text
//! 2. bloom check against the organization's filter
//! 3. trigram text match through the store's index
//! 4. cosine ranking of the mention embedding against each candidate
//! 5. keep candidates strictly above the merge threshold, best first

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::bloom::BloomIndex;
use crate::config::{ResolutionConfig, SimilarityFailurePolicy};
use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::entity::Entity;
use crate::error::{RegistryError, SimilarityError};
use crate::mention::Mention;
use crate::storage::ResolutionStore;

/// An entity that passed every stage, with its similarity to the mention.
#[derive(Debug, Clone)]
pub struct EntityCandidate {
    /// The candidate entity.
    pub entity: Entity,
    /// Cosine similarity in `[0, 1]`, strictly above the merge threshold.
    pub similarity: f32,
}

/// Read side of entity resolution: finds merge candidates for a mention.
#[derive(Clone)]
pub struct EntityRegistry {
    store: Arc<dyn ResolutionStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    bloom: Arc<BloomIndex>,
    config: Arc<ResolutionConfig>,
}

impl fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("bloom", &self.bloom)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EntityRegistry {
    /// Creates a registry with its own bloom index.
    #[must_use]
    pub fn new(
        store: Arc<dyn ResolutionStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: ResolutionConfig,
    ) -> Self {
        let bloom = Arc::new(BloomIndex::new(config.bloom.clone()));
        Self::with_bloom(store, embedder, bloom, Arc::new(config))
    }

    /// Creates a registry sharing an existing bloom index.
    #[must_use]
    pub fn with_bloom(
        store: Arc<dyn ResolutionStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        bloom: Arc<BloomIndex>,
        config: Arc<ResolutionConfig>,
    ) -> Self {
        Self {
            store,
            embedder,
            bloom,
            config,
        }
    }

    /// The bloom index this registry consults.
    #[must_use]
    pub fn bloom(&self) -> &Arc<BloomIndex> {
        &self.bloom
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ResolutionConfig {
        &self.config
    }

    /// Embeds a mention's raw text.
    ///
    /// # Errors
    /// Returns `RegistryError::Embedding` if the provider fails.
    pub fn embed_mention(&self, mention: &Mention) -> Result<Vec<f32>, RegistryError> {
        Ok(self.embedder.embed(&mention.raw_text)?)
    }

    /// Finds entities the mention may be merged into, best first.
    ///
    /// Repeated calls against an unchanged store return the same list in
    /// the same order.
    ///
    /// # Errors
    /// - `Storage` if the bloom bootstrap or text search fails
    /// - `Embedding` if the mention cannot be embedded
    /// - `Similarity` if a candidate fails under [`SimilarityFailurePolicy::Abort`]
    pub fn find_candidates(&self, mention: &Mention) -> Result<Vec<EntityCandidate>, RegistryError> {
        let candidates = self.text_candidates(mention)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let embedding = self.embed_mention(mention)?;
        self.rank(mention, &embedding, candidates)
    }

    /// Like [`Self::find_candidates`], reusing a precomputed mention embedding.
    ///
    /// # Errors
    /// As [`Self::find_candidates`], minus the mention embedding failure.
    pub fn find_candidates_with_embedding(
        &self,
        mention: &Mention,
        embedding: &[f32],
    ) -> Result<Vec<EntityCandidate>, RegistryError> {
        let candidates = self.text_candidates(mention)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        self.rank(mention, embedding, candidates)
    }

    /// Makes a new or reactivated entity visible to the bloom stage.
    ///
    /// Call before committing the entity, so a saved filter never misses a
    /// committed entity; a failed commit only leaves a false positive.
    ///
    /// # Errors
    /// Returns `RegistryError::Storage` if the filter cannot be bootstrapped.
    pub fn index_entity(&self, entity: &Entity) -> Result<(), RegistryError> {
        self.bloom.insert_entity(entity, &*self.store)?;
        Ok(())
    }

    fn text_candidates(&self, mention: &Mention) -> Result<Vec<Entity>, RegistryError> {
        let normalized = mention.normalized_text();
        if normalized.is_empty() {
            return Ok(Vec::new());
        }

        if !self.bloom.may_match(mention.org_id, &normalized, &*self.store)? {
            tracing::debug!(mention_id = %mention.id, "bloom miss");
            return Ok(Vec::new());
        }

        let text = &self.config.text_match;
        let hits = self.store.find_by_text(
            mention.org_id,
            &normalized,
            text.min_similarity,
            text.max_candidates,
        )?;
        if hits.is_empty() {
            tracing::debug!(mention_id = %mention.id, "no text candidates");
        }
        Ok(hits.into_iter().map(|(entity, _)| entity).collect())
    }

    fn similarity(&self, embedding: &[f32], entity: &Entity) -> Result<f32, SimilarityError> {
        let computed;
        let entity_embedding: &[f32] = match entity.embedding.as_deref() {
            Some(e) => e,
            None => {
                computed = self
                    .embedder
                    .embed(&entity.canonical_text)
                    .map_err(|source| SimilarityError::Embedding {
                        entity_id: entity.id,
                        source,
                    })?;
                &computed
            }
        };

        let sim = cosine_similarity(embedding, entity_embedding).ok_or(
            SimilarityError::DimensionMismatch {
                entity_id: entity.id,
                mention_dim: embedding.len(),
                entity_dim: entity_embedding.len(),
            },
        )?;
        Ok(if sim.is_finite() { sim.clamp(0.0, 1.0) } else { 0.0 })
    }

    fn rank(
        &self,
        mention: &Mention,
        embedding: &[f32],
        candidates: Vec<Entity>,
    ) -> Result<Vec<EntityCandidate>, RegistryError> {
        let threshold = self.config.merge_threshold;
        let mut ranked = Vec::with_capacity(candidates.len());

        for entity in candidates {
            let similarity = match self.similarity(embedding, &entity) {
                Ok(sim) => sim,
                Err(err) => match self.config.similarity_failure {
                    SimilarityFailurePolicy::Skip => {
                        tracing::warn!(
                            mention_id = %mention.id,
                            entity_id = %err.entity_id(),
                            error = %err,
                            "skipping candidate"
                        );
                        continue;
                    }
                    SimilarityFailurePolicy::Abort => return Err(err.into()),
                },
            };
            if similarity > threshold {
                ranked.push(EntityCandidate { entity, similarity });
            }
        }

        ranked.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });
        Ok(ranked)
    }
}
