//! # kyro-resolve - Incremental Entity Resolution
//!
//! kyro-resolve decides, for each extracted mention, whether it refers to an
//! entity the organization already knows or introduces a new one. Every
//! decision is recorded so that it can be audited and, where possible,
//! reversed.
//!
//! ## Core Concepts
//!
//! - **Mention**: one occurrence of an entity in a source document, with the
//!   extraction run and span that produced it
//! - **Entity**: the canonical cluster that resolved mentions point at
//! - **Registry**: bloom-filtered, embedding-ranked candidate search
//! - **Clusterer**: batch decision loop that merges or creates entities
//! - **Merge history**: append-only audit trail of every merge, split and
//!   unmerge
//!
//! ## Usage
//!
//! ```rust
//! use kyro_resolve::{
//!     EntityResolver, EntityType, Mention, OrgId, Provenance, ResolutionConfig, TextSpan, ValidationError,
//! };
//!
//! let resolver = EntityResolver::in_memory(ResolutionConfig::default())?;
//! let org = OrgId::new();
//!
//! let mention = |text: &str| -> Result<Mention, ValidationError> {
//!     Mention::builder()
//!         .org(org)
//!         .text(text)
//!         .mention_type(EntityType::Person)
//!         .confidence(0.9)
//!         .provenance(Provenance::new("run-1", "doc-1", TextSpan::new(0, text.len())?, "{}"))
//!         .build()
//! };
//!
//! let first = resolver.cluster(org, vec![mention("Ada Lovelace")?]);
//! let entity_id = first.outcomes[0].entity_id().expect("created");
//!
//! let second = resolver.cluster(org, vec![mention("ada lovelace")?]);
//! assert_eq!(second.merged_count(), 1);
//! assert_eq!(resolver.get_merge_history(org, entity_id)?.len(), 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod confidence;
pub mod entity;
pub mod error;
pub mod ids;
pub mod mention;
pub mod normalize;

// Configuration and collaborators
pub mod config;
pub mod embedding;

// Candidate search
pub mod bloom;
pub mod registry;

// Storage and audit
pub mod history;
pub mod storage;

// Decision services
pub mod cluster;
pub mod manual;
pub mod resolver;
pub mod split;

// Re-export primary types at crate root for convenience
pub use bloom::{BloomFilter, BloomIndex, BloomStats};
pub use cluster::{ClusterOutcome, ClusterResult, IncrementalClusterer, OrgLocks};
pub use confidence::Confidence;
pub use config::{
    BloomConfig, EntityEmbeddingPolicy, ResolutionConfig, SearchConfig, SimilarityFailurePolicy,
    TextMatchConfig,
};
pub use embedding::{cosine_similarity, EmbeddingProvider, LexicalEmbedder};
pub use entity::{Entity, EntityStatus, EntityType};
pub use error::{
    ClusterError, ConfigError, EmbeddingError, MergeError, RegistryError, ResolveError, ResolveResult,
    SimilarityError, SplitError, ValidationError,
};
pub use history::{MergeHistory, MergeReason, MergeRecord, MergeSource, RecordMerge};
pub use ids::{EntityId, MentionId, MergeId, OrgId, UserId};
pub use manual::ManualMerge;
pub use mention::{Mention, MentionBuilder, Provenance, TextSpan};
pub use registry::{EntityCandidate, EntityRegistry};
pub use resolver::EntityResolver;
pub use split::{SplitOutcome, SplitService, UnmergeOutcome};
pub use storage::{
    EntityStore, InMemoryStore, MentionAssignment, MentionStore, MergeHistoryStore, ResolutionStore, StorageError,
    StoreStats, StoreTransaction,
};
#[cfg(feature = "persistent")]
pub use storage::{PersistentConfig, PersistentStore};
