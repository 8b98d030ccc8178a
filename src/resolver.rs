//! One-stop wiring of the resolution services.

use std::fmt;
use std::sync::Arc;

use crate::bloom::BloomIndex;
use crate::cluster::{ClusterResult, IncrementalClusterer, OrgLocks};
use crate::config::ResolutionConfig;
use crate::embedding::{EmbeddingProvider, LexicalEmbedder};
use crate::error::ResolveResult;
use crate::history::{MergeHistory, MergeRecord};
use crate::ids::{EntityId, MentionId, MergeId, OrgId, UserId};
use crate::manual::ManualMerge;
use crate::mention::Mention;
use crate::registry::{EntityCandidate, EntityRegistry};
use crate::split::{SplitOutcome, SplitService, UnmergeOutcome};
use crate::storage::{InMemoryStore, ResolutionStore};

#[cfg(feature = "persistent")]
use crate::storage::{PersistentConfig, PersistentStore};

/// Every service of the engine sharing one store, one bloom index and one
/// set of organization locks.
///
/// # Examples
///
/// ```
/// use kyro_resolve::{EntityResolver, EntityType, Mention, OrgId, Provenance, ResolutionConfig, TextSpan};
///
/// let resolver = EntityResolver::in_memory(ResolutionConfig::default()).unwrap();
/// let org = OrgId::new();
/// let mention = Mention::builder()
///     .org(org)
///     .text("Acme Corp")
///     .mention_type(EntityType::Organization)
///     .confidence(0.9)
///     .provenance(Provenance::new("run-1", "doc-1", TextSpan::new(0, 9).unwrap(), "{}"))
///     .build()
///     .unwrap();
///
/// let result = resolver.cluster(org, vec![mention]);
/// assert_eq!(result.created_count(), 1);
/// ```
#[derive(Clone)]
pub struct EntityResolver {
    store: Arc<dyn ResolutionStore>,
    registry: EntityRegistry,
    clusterer: IncrementalClusterer,
    history: MergeHistory,
    splitter: SplitService,
    manual: ManualMerge,
    #[cfg(feature = "persistent")]
    persistent: Option<Arc<PersistentStore>>,
}

impl fmt::Debug for EntityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityResolver")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl EntityResolver {
    /// Wires the services over `store` after validating `config`.
    ///
    /// # Errors
    /// Returns `ResolveError::Config` for an invalid config and
    /// `ResolveError::Internal` if the search pool cannot start.
    pub fn new(
        store: Arc<dyn ResolutionStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        config: ResolutionConfig,
    ) -> ResolveResult<Self> {
        let config = Arc::new(config.validate()?);
        let bloom = Arc::new(BloomIndex::new(config.bloom.clone()));
        Self::assemble(store, embedder, bloom, config)
    }

    /// In-memory store and the offline lexical embedder.
    ///
    /// # Errors
    /// As [`Self::new`].
    pub fn in_memory(config: ResolutionConfig) -> ResolveResult<Self> {
        Self::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(LexicalEmbedder::default()),
            config,
        )
    }

    fn assemble(
        store: Arc<dyn ResolutionStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        bloom: Arc<BloomIndex>,
        config: Arc<ResolutionConfig>,
    ) -> ResolveResult<Self> {
        let locks = Arc::new(OrgLocks::new());
        let registry = EntityRegistry::with_bloom(Arc::clone(&store), embedder, bloom, config);
        let clusterer = IncrementalClusterer::new(Arc::clone(&store), registry.clone(), Arc::clone(&locks))?;
        Ok(Self {
            history: MergeHistory::new(Arc::clone(&store)),
            splitter: SplitService::new(Arc::clone(&store), registry.clone(), Arc::clone(&locks)),
            manual: ManualMerge::new(Arc::clone(&store), locks),
            clusterer,
            registry,
            store,
            #[cfg(feature = "persistent")]
            persistent: None,
        })
    }

    /// Opens (or creates) an on-disk store and restores any saved bloom
    /// filters.
    ///
    /// # Errors
    /// `ResolveError::Storage` if the directory cannot be opened or replayed,
    /// otherwise as [`Self::new`].
    #[cfg(feature = "persistent")]
    pub fn open(
        persistent: PersistentConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        config: ResolutionConfig,
    ) -> ResolveResult<Self> {
        let config = Arc::new(config.validate()?);
        let store = Arc::new(PersistentStore::open(persistent)?);
        let bloom = Arc::new(BloomIndex::new(config.bloom.clone()));
        store.load_bloom(&bloom)?;

        let dyn_store: Arc<dyn ResolutionStore> = store.clone();
        let mut resolver = Self::assemble(dyn_store, embedder, bloom, config)?;
        resolver.persistent = Some(store);
        Ok(resolver)
    }

    /// Compacts the WAL into a snapshot and saves the loaded bloom filters.
    /// A no-op for in-memory resolvers.
    ///
    /// # Errors
    /// `ResolveError::Storage` if writing either file fails.
    #[cfg(feature = "persistent")]
    pub fn checkpoint(&self) -> ResolveResult<()> {
        if let Some(store) = &self.persistent {
            store.compact()?;
            store.save_bloom(self.registry.bloom())?;
        }
        Ok(())
    }

    /// The shared store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn ResolutionStore> {
        &self.store
    }

    #[must_use]
    pub const fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn clusterer(&self) -> &IncrementalClusterer {
        &self.clusterer
    }

    #[must_use]
    pub const fn history(&self) -> &MergeHistory {
        &self.history
    }

    #[must_use]
    pub const fn splitter(&self) -> &SplitService {
        &self.splitter
    }

    #[must_use]
    pub const fn manual(&self) -> &ManualMerge {
        &self.manual
    }

    /// See [`EntityRegistry::find_candidates`].
    ///
    /// # Errors
    /// `ResolveError::Registry` when candidate search fails.
    pub fn find_candidates(&self, mention: &Mention) -> ResolveResult<Vec<EntityCandidate>> {
        Ok(self.registry.find_candidates(mention)?)
    }

    /// See [`IncrementalClusterer::cluster`].
    pub fn cluster(&self, org_id: OrgId, mentions: Vec<Mention>) -> ClusterResult {
        self.clusterer.cluster(org_id, mentions)
    }

    /// See [`SplitService::split_entity`].
    ///
    /// # Errors
    /// `ResolveError::Split` with the specific reason.
    pub fn split_entity(
        &self,
        org_id: OrgId,
        entity_id: EntityId,
        mention_ids: &[MentionId],
        performed_by: UserId,
    ) -> ResolveResult<SplitOutcome> {
        Ok(self
            .splitter
            .split_entity(org_id, entity_id, mention_ids, performed_by)?)
    }

    /// See [`SplitService::unmerge`].
    ///
    /// # Errors
    /// `ResolveError::Split` with the specific reason.
    pub fn unmerge(&self, org_id: OrgId, merge_id: MergeId, performed_by: UserId) -> ResolveResult<UnmergeOutcome> {
        Ok(self.splitter.unmerge(org_id, merge_id, performed_by)?)
    }

    /// See [`ManualMerge::merge_entities`].
    ///
    /// # Errors
    /// `ResolveError::Split` with the specific reason.
    pub fn merge_entities(
        &self,
        org_id: OrgId,
        source: EntityId,
        target: EntityId,
        merged_by: UserId,
        confidence: f32,
    ) -> ResolveResult<MergeRecord> {
        Ok(self
            .manual
            .merge_entities(org_id, source, target, merged_by, confidence)?)
    }

    /// See [`MergeHistory::get_merge_history`].
    ///
    /// # Errors
    /// `ResolveError::Merge` if the store read fails.
    pub fn get_merge_history(&self, org_id: OrgId, entity_id: EntityId) -> ResolveResult<Vec<MergeRecord>> {
        Ok(self.history.get_merge_history(org_id, entity_id)?)
    }

    /// See [`MergeHistory::get_merges_by_user`].
    ///
    /// # Errors
    /// `ResolveError::Merge` if the store read fails.
    pub fn get_merges_by_user(&self, org_id: OrgId, user_id: &UserId) -> ResolveResult<Vec<MergeRecord>> {
        Ok(self.history.get_merges_by_user(org_id, user_id)?)
    }
}
